//! The fixes, and the orchestrator that installs and removes them.

pub mod entity;
pub mod equip;
pub mod gravity;
pub mod patch;
pub mod push;
pub mod strip;
pub mod subtick;

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use eyre::Result;

use crate::{
    hook::Interceptor,
    host::{Host, Memory},
    meta::{
        game_data::GameData,
        settings::{Options, Switches},
    },
    resolver::Resolver,
};

use self::{
    equip::EquipFix,
    gravity::{GravityFix, GravityTable},
    patch::PatchFix,
    push::PushFix,
    strip::{EquipStripTable, StripFix, Stripper},
    subtick::SubtickFix,
};

/// Everything a fix needs to find and divert game code.
pub struct Context {
    pub host: Arc<dyn Host>,
    pub memory: Arc<dyn Memory>,
    pub game_data: Arc<GameData>,
    pub interceptor: Arc<Interceptor>,
    pub switches: Switches,
}

impl Context {
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.game_data, &*self.memory)
    }
}

/// One independently installable correction to the game's behaviour.
pub trait Fix: Send {
    fn name(&self) -> &str;

    /// Finds and diverts everything the fix needs. An error means the fix is unusable; anything
    /// it managed to install before failing is removed again by `uninstall`.
    fn install(&mut self, context: &Context) -> Result<()>;

    /// Removes whatever `install` set up. Must be safe to call when nothing was installed.
    fn uninstall(&mut self, context: &Context);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `f`, turning a panic into an error.
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(eyre::format_err!("panicked: {}", panic_message(&*payload))),
    }
}

/// Owns every fix, and installs and removes them as a group.
pub struct Fixes {
    context: Context,
    fixes: Vec<Box<dyn Fix>>,
    installed: Vec<usize>,
    gravity: Arc<GravityTable>,
    strip_table: Arc<EquipStripTable>,
}

impl Fixes {
    /// Creates the full set of fixes, in installation order.
    pub fn new(context: Context, options: &Options) -> Fixes {
        let gravity = Arc::new(GravityTable::default());
        let strip_table = Arc::new(EquipStripTable::default());
        let stripper = Arc::new(Stripper::new(strip_table.clone()));

        let mut fixes: Vec<Box<dyn Fix>> = options
            .patches
            .iter()
            .map(|name| Box::new(PatchFix::new(name)) as Box<dyn Fix>)
            .collect();

        fixes.push(Box::new(StripFix::new(stripper.clone())));
        fixes.push(Box::new(PushFix::new()));
        fixes.push(Box::new(EquipFix::new(stripper)));
        fixes.push(Box::new(GravityFix::new(gravity.clone())));
        fixes.push(Box::new(SubtickFix::new()));

        Fixes {
            context,
            fixes,
            installed: vec![],
            gravity,
            strip_table,
        }
    }

    /// Wraps an arbitrary list of fixes.
    pub fn with_fixes(context: Context, fixes: Vec<Box<dyn Fix>>) -> Fixes {
        Fixes {
            context,
            fixes,
            installed: vec![],
            gravity: Arc::default(),
            strip_table: Arc::default(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The gravity overrides used by the trigger_gravity fix.
    pub fn gravity(&self) -> &Arc<GravityTable> {
        &self.gravity
    }

    /// The slot sets used when a game_player_equip strips matching weapons.
    pub fn strip_table(&self) -> &Arc<EquipStripTable> {
        &self.strip_table
    }

    /// Names of the fixes that are currently installed.
    pub fn installed(&self) -> Vec<&str> {
        self.installed
            .iter()
            .map(|index| self.fixes[*index].name())
            .collect()
    }

    /// Installs every fix that isn't installed yet. A fix that fails is logged and left out;
    /// the others are unaffected. Returns the number of installed fixes.
    pub fn install(&mut self) -> usize {
        for (index, fix) in self.fixes.iter_mut().enumerate() {
            if self.installed.contains(&index) {
                continue;
            }

            let context = &self.context;

            match guarded(|| fix.install(context)) {
                Ok(()) => {
                    log::info!("Installed {}.", fix.name());
                    self.installed.push(index);
                }

                Err(err) => {
                    log::error!("Failed to install {}: {err:?}", fix.name());

                    if let Err(err) = guarded(|| {
                        fix.uninstall(context);
                        Ok(())
                    }) {
                        log::error!("Failed to clean up {}: {err:?}", fix.name());
                    }
                }
            }
        }

        log::info!(
            "{} of {} fixes installed.",
            self.installed.len(),
            self.fixes.len()
        );

        self.installed.len()
    }

    /// Removes every installed fix, most recently installed first. Failures are logged.
    pub fn uninstall(&mut self) {
        while let Some(index) = self.installed.pop() {
            let fix = &mut self.fixes[index];
            let context = &self.context;

            match guarded(|| {
                fix.uninstall(context);
                Ok(())
            }) {
                Ok(()) => log::info!("Uninstalled {}.", fix.name()),
                Err(err) => log::error!("Failed to uninstall {}: {err:?}", fix.name()),
            }
        }
    }
}

impl Drop for Fixes {
    fn drop(&mut self) {
        self.uninstall();
    }
}
