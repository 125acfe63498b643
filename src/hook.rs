//! Diverts calls to functions in the server binary to our own code, and provides types and macros
//! for doing that safely.
//!
//! Native code can't call a closure, so every function we divert gets its own `extern "C"` entry
//! point from `native_target!`. That entry point looks up whatever `Hook` is currently bound to
//! it and runs it. The `Hook` holds the diversion the fix installed and a `Next` that runs the
//! original function, which stays callable for as long as the diversion is installed.

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    ffi::c_void,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use dlopen::symbor::Library;
use eyre::{Context, Result};
use parking_lot::{Mutex, RwLock};

use crate::{error::FixError, resolver::ForeignFn};

/// A native function type that calls can be made through and diverted away from.
pub trait Signature: Copy + Send + Sync + 'static {
    type Args: Clone + Send + 'static;
    type Ret: Clone + Default + 'static;

    /// # Safety
    /// `address` must be the entry point of a function with this signature.
    unsafe fn from_address(address: usize) -> Self;

    fn address(self) -> usize;

    fn invoke(self, args: Self::Args) -> Self::Ret;
}

macro_rules! impl_signature {
    ($($arg:ident),*) => {
        impl<Ret: Clone + Default + 'static, $($arg: Clone + Send + 'static),*> Signature
            for extern "C" fn($($arg),*) -> Ret
        {
            type Args = ($($arg,)*);
            type Ret = Ret;

            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute_copy(&address)
            }

            fn address(self) -> usize {
                self as usize
            }

            #[allow(non_snake_case)]
            fn invoke(self, ($($arg,)*): Self::Args) -> Ret {
                self($($arg),*)
            }
        }
    };
}

impl_signature!(A);
impl_signature!(A, B);
impl_signature!(A, B, C);
impl_signature!(A, B, C, D);
impl_signature!(A, B, C, D, E);

/// Calls the implementation a diversion replaced.
pub struct Next<A, R>(Arc<dyn Fn(A) -> R + Send + Sync>);

impl<A, R> Clone for Next<A, R> {
    fn clone(&self) -> Self {
        Next(self.0.clone())
    }
}

impl<A: 'static, R: 'static> Next<A, R> {
    pub fn new(function: impl Fn(A) -> R + Send + Sync + 'static) -> Next<A, R> {
        Next(Arc::new(function))
    }

    pub fn call(&self, args: A) -> R {
        (self.0)(args)
    }
}

/// Replacement logic for a diverted function.
pub type Diversion<A, R> = Box<dyn Fn(A) -> R + Send + Sync>;

/// Identifies one installed diversion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Token(u64);

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// A diversion running on this thread.
struct Active {
    id: u64,

    /// What the original returned, if the diversion has called it through `Next`.
    forwarded: Option<Box<dyn Any>>,
}

thread_local! {
    static ACTIVE_HOOKS: RefCell<Vec<Active>> = RefCell::new(vec![]);
}

/// Marks a hook as running on the current thread until dropped.
struct ActiveGuard(u64);

impl ActiveGuard {
    /// Returns `None` if the hook is already running on this thread.
    fn enter(id: u64) -> Option<ActiveGuard> {
        ACTIVE_HOOKS.with(|active| {
            let mut active = active.borrow_mut();

            if active.iter().any(|running| running.id == id) {
                return None;
            }

            active.push(Active {
                id,
                forwarded: None,
            });

            Some(ActiveGuard(id))
        })
    }

    /// Records that the diversion for hook `id` on this thread got `value` from the original.
    fn forwarded(id: u64, value: Box<dyn Any>) {
        ACTIVE_HOOKS.with(|active| {
            if let Some(running) = active
                .borrow_mut()
                .iter_mut()
                .find(|running| running.id == id)
            {
                running.forwarded = Some(value);
            }
        });
    }

    fn take_forwarded(&self) -> Option<Box<dyn Any>> {
        ACTIVE_HOOKS.with(|active| {
            active
                .borrow_mut()
                .iter_mut()
                .find(|running| running.id == self.0)
                .and_then(|running| running.forwarded.take())
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_HOOKS.with(|active| active.borrow_mut().retain(|running| running.id != self.0));
    }
}

/// One interception point: a native function, plus at most one
/// diversion.
pub struct Hook<A, R> {
    id: u64,
    name: String,
    original: Next<A, R>,
    diversion: RwLock<Option<(Token, Arc<dyn Fn(A) -> R + Send + Sync>)>>,
}

impl<A: Clone + 'static, R: Clone + 'static> Hook<A, R> {
    /// Creates a hook with no diversion. Calls go straight to `original`.
    pub fn new(name: impl Into<String>, original: Next<A, R>) -> Hook<A, R> {
        Hook {
            id: NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            original,
            diversion: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original(&self) -> &Next<A, R> {
        &self.original
    }

    /// The `Next` to give a diversion. It calls the original and notes the result, so a
    /// diversion that panics afterwards doesn't cause the original to run a second time.
    pub fn next(&self) -> Next<A, R> {
        let id = self.id;
        let original = self.original.clone();

        Next::new(move |args| {
            let value = original.call(args);
            ActiveGuard::forwarded(id, Box::new(value.clone()));
            value
        })
    }

    /// Returns the token of the installed diversion, if there is one.
    pub fn token(&self) -> Option<Token> {
        self.diversion.read().as_ref().map(|(token, _)| *token)
    }

    pub fn is_diverted(&self) -> bool {
        self.token().is_some()
    }

    /// Runs the diversion if one is installed, or the original if not.
    ///
    /// Calls that come back into this hook from inside its own diversion go to the original.
    /// If the diversion panics, the panic is logged and the original runs instead, unless the
    /// diversion had already called it through `next()`. In that case the result it got is
    /// returned.
    pub fn call(&self, args: A) -> R {
        // Clone the diversion out so the lock isn't held while it runs.
        let diversion = self
            .diversion
            .read()
            .as_ref()
            .map(|(_, diversion)| diversion.clone());

        let diversion = match diversion {
            Some(diversion) => diversion,
            None => return self.original.call(args),
        };

        let guard = match ActiveGuard::enter(self.id) {
            Some(guard) => guard,
            None => return self.original.call(args),
        };

        let result = catch_unwind(AssertUnwindSafe(|| diversion(args.clone())));
        let forwarded = guard.take_forwarded();
        drop(guard);

        if let Ok(value) = result {
            return value;
        }

        match forwarded.and_then(|value| value.downcast::<R>().ok()) {
            Some(value) => {
                log::error!(
                    "Diversion for '{}' panicked after calling the original; using its result.",
                    self.name
                );

                *value
            }

            None => {
                log::error!(
                    "Diversion for '{}' panicked; calling the original instead.",
                    self.name
                );

                self.original.call(args)
            }
        }
    }

    fn divert(&self, token: Token, diversion: Diversion<A, R>) -> Result<()> {
        let mut slot = self.diversion.write();

        if slot.is_some() {
            return Err(FixError::AlreadyDiverted {
                name: self.name.clone(),
            }
            .into());
        }

        *slot = Some((token, Arc::from(diversion)));
        Ok(())
    }

    /// Removes the diversion if it was installed with `token`.
    fn restore(&self, token: Token) -> bool {
        let mut slot = self.diversion.write();

        match slot.as_ref() {
            Some((installed, _)) if *installed == token => {
                *slot = None;
                true
            }

            _ => false,
        }
    }
}

/// The connection between a native entry point and the hook it runs.
pub struct Bridge<S: Signature> {
    name: &'static str,
    hook: RwLock<Option<Arc<Hook<S::Args, S::Ret>>>>,

    /// The original of the last hook bound. Calls that were already inside the entry point
    /// when their hook was unbound go here.
    fallback: RwLock<Option<Next<S::Args, S::Ret>>>,
}

impl<S: Signature> Bridge<S> {
    pub fn new(name: &'static str) -> Bridge<S> {
        Bridge {
            name,
            hook: RwLock::new(None),
            fallback: RwLock::new(None),
        }
    }

    fn bind(&self, hook: Arc<Hook<S::Args, S::Ret>>) {
        *self.fallback.write() = Some(hook.original().clone());

        if self.hook.write().replace(hook).is_some() {
            log::warn!("Entry point '{}' was rebound.", self.name);
        }
    }

    fn unbind(&self) {
        self.hook.write().take();
    }

    /// Called from the native entry point.
    pub fn dispatch(&self, args: S::Args) -> S::Ret {
        let hook = self.hook.read().clone();

        if let Some(hook) = hook {
            return hook.call(args);
        }

        let fallback = self.fallback.read().clone();

        match fallback {
            Some(original) => original.call(args),
            None => {
                log::error!("Entry point '{}' called with no hook bound.", self.name);
                S::Ret::default()
            }
        }
    }
}

/// A native entry point along with the bridge it dispatches through.
pub struct Detour<S: Signature> {
    bridge: &'static Bridge<S>,
    thunk: S,
}

impl<S: Signature> Detour<S> {
    pub fn new(bridge: &'static Bridge<S>, thunk: S) -> Detour<S> {
        Detour { bridge, thunk }
    }
}

/// Declares a native entry point for a function we divert.
///
/// Creates a module named `$name` containing the function type and a `detour()` that returns
/// what `Interceptor::install` needs.
#[macro_export]
macro_rules! native_target {
    ($name:ident, fn($($arg:ident: $ty:ty),*) $(-> $ret:ty)?) => {
        #[allow(dead_code)]
        pub mod $name {
            #[allow(unused_imports)]
            use super::*;

            pub type Function = extern "C" fn($($ty),*) $(-> $ret)?;

            static BRIDGE: once_cell::sync::Lazy<$crate::hook::Bridge<Function>> =
                once_cell::sync::Lazy::new(|| $crate::hook::Bridge::new(stringify!($name)));

            extern "C" fn thunk($($arg: $ty),*) $(-> $ret)? {
                BRIDGE.dispatch(($($arg,)*))
            }

            pub fn detour() -> $crate::hook::Detour<Function> {
                $crate::hook::Detour::new(&BRIDGE, thunk as Function)
            }
        }
    };
}

/// Something that can redirect native code.
pub trait Patcher: Send + Sync {
    /// Makes code that calls `target` run `detour` instead. The address of a trampoline that
    /// runs the original code is stored in `trampoline` before the patch goes live, so
    /// `detour` can forward calls that arrive while this is still running.
    fn attach(&self, target: usize, detour: usize, trampoline: &AtomicUsize) -> Result<()>;

    /// Undoes `attach`, restoring the original code at `target`.
    fn detach(&self, target: usize) -> Result<()>;
}

type DobbyHookFn =
    unsafe extern "C" fn(address: *mut c_void, replace: *mut c_void, origin: *mut *mut c_void) -> i32;

type DobbyDestroyFn = unsafe extern "C" fn(address: *mut c_void) -> i32;

/// Patches code using Dobby, loaded at runtime.
pub struct DobbyPatcher {
    _library: Library,
    hook: DobbyHookFn,
    destroy: DobbyDestroyFn,
}

impl DobbyPatcher {
    pub fn load(path: &str) -> Result<DobbyPatcher> {
        let library = Library::open(path).wrap_err("Failed to open hooking library")?;

        let hook = *unsafe { library.symbol::<DobbyHookFn>("DobbyHook") }
            .wrap_err("Unable to find DobbyHook in library")?;

        let destroy = *unsafe { library.symbol::<DobbyDestroyFn>("DobbyDestroy") }
            .wrap_err("Unable to find DobbyDestroy in library")?;

        log::info!("Loaded hooking library from '{path}'.");

        Ok(DobbyPatcher {
            _library: library,
            hook,
            destroy,
        })
    }
}

impl Patcher for DobbyPatcher {
    fn attach(&self, target: usize, detour: usize, trampoline: &AtomicUsize) -> Result<()> {
        // Dobby writes the relocated original through this pointer before it commits the
        // patch.
        let status = unsafe {
            (self.hook)(
                target as *mut c_void,
                detour as *mut c_void,
                trampoline.as_ptr().cast::<*mut c_void>(),
            )
        };

        if status != 0 || trampoline.load(Ordering::Acquire) == 0 {
            return Err(eyre::format_err!(
                "DobbyHook failed for {target:#x} with status {status}"
            ));
        }

        Ok(())
    }

    fn detach(&self, target: usize) -> Result<()> {
        let status = unsafe { (self.destroy)(target as *mut c_void) };

        if status != 0 {
            return Err(eyre::format_err!(
                "DobbyDestroy failed for {target:#x} with status {status}"
            ));
        }

        Ok(())
    }
}

struct Installation {
    name: String,
    target: usize,
    hook: Arc<dyn Any + Send + Sync>,
    restore: Box<dyn Fn() + Send>,
    unbind: Box<dyn FnOnce() + Send>,
}

/// Keeps track of every diversion installed in the process.
pub struct Interceptor {
    patcher: Arc<dyn Patcher>,
    next_token: AtomicU64,
    installed: Mutex<HashMap<Token, Installation>>,
}

impl Interceptor {
    pub fn new(patcher: Arc<dyn Patcher>) -> Interceptor {
        Interceptor {
            patcher,
            next_token: AtomicU64::new(1),
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Diverts calls to `function`. `factory` is given the original function and returns
    /// the logic that should run in its place.
    ///
    /// Calls that arrive before the diversion is in place go to the original. `factory` runs
    /// after the patch is live and may use this interceptor.
    pub fn install<S: Signature>(
        &self,
        function: &ForeignFn<S>,
        detour: Detour<S>,
        factory: impl FnOnce(Next<S::Args, S::Ret>) -> Diversion<S::Args, S::Ret>,
    ) -> Result<Token> {
        let name = function.name().to_string();
        let target = function.address();

        let trampoline = Arc::new(AtomicUsize::new(0));

        let original = {
            let trampoline = trampoline.clone();
            let name = name.clone();

            Next::new(move |args| match trampoline.load(Ordering::Acquire) {
                0 => {
                    log::error!("'{name}' was called before its trampoline was known.");
                    S::Ret::default()
                }

                address => unsafe { S::from_address(address) }.invoke(args),
            })
        };

        let hook = Arc::new(Hook::new(name.clone(), original));
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        {
            let mut installed = self.installed.lock();

            if installed
                .values()
                .any(|installation| installation.target == target)
            {
                return Err(FixError::AlreadyDiverted { name }.into());
            }

            // Bound first, so the entry point has somewhere to send calls as soon as the
            // patch is live.
            detour.bridge.bind(hook.clone());

            if let Err(err) = self
                .patcher
                .attach(target, detour.thunk.address(), &trampoline)
            {
                detour.bridge.unbind();
                return Err(err).wrap_err_with(|| format!("When attaching to '{name}'"));
            }

            let restore = {
                let hook = hook.clone();
                Box::new(move || {
                    hook.restore(token);
                })
            };

            let bridge = detour.bridge;

            installed.insert(
                token,
                Installation {
                    name: name.clone(),
                    target,
                    hook: hook.clone(),
                    restore,
                    unbind: Box::new(move || bridge.unbind()),
                },
            );
        }

        hook.divert(token, factory(hook.next()))?;

        log::debug!(
            "Diverted '{}' at {:#x} ({token:?}).",
            function.name(),
            function.address()
        );

        Ok(token)
    }

    /// Removes the diversion installed with `token`. Returns `false` if there wasn't one.
    ///
    /// Calls already inside the entry point when it is unbound still reach the original.
    pub fn remove(&self, token: Token) -> bool {
        let installation = match self.installed.lock().remove(&token) {
            Some(installation) => installation,
            None => return false,
        };

        (installation.restore)();

        match self.patcher.detach(installation.target) {
            Ok(()) => (installation.unbind)(),

            // Leave the hook bound. With no diversion it forwards to the original.
            Err(err) => log::error!(
                "Unable to detach '{}' at {:#x}: {err:?}",
                installation.name,
                installation.target
            ),
        }

        log::debug!("Removed diversion for '{}'.", installation.name);
        true
    }

    /// Removes every diversion that is still installed.
    pub fn remove_all(&self) {
        let tokens: Vec<Token> = self.installed.lock().keys().copied().collect();

        for token in tokens {
            self.remove(token);
        }
    }

    pub fn is_installed(&self, token: Token) -> bool {
        self.installed.lock().contains_key(&token)
    }

    /// Returns the hook diverting calls at `target`, if there is one.
    pub fn hook_at<A, R>(&self, target: usize) -> Option<Arc<Hook<A, R>>>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let hook = self
            .installed
            .lock()
            .values()
            .find(|installation| installation.target == target)
            .map(|installation| installation.hook.clone())?;

        hook.downcast::<Hook<A, R>>().ok()
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.remove_all();
    }
}

/// Removes the diversion in `slot`, if there is one.
pub fn remove_token(interceptor: &Interceptor, slot: &mut Option<Token>) {
    if let Some(token) = slot.take() {
        interceptor.remove(token);
    }
}
