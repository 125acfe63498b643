//! Strips subtick information out of user commands before the server processes them, so that
//! movement and shooting are simulated on whole ticks.
//!
//! `ProcessUsercmds` is only diverted while `sw_disable_subtick_movement` or
//! `sw_disable_subtick_shooting` is on.

use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::Mutex;

use crate::{
    error::FixError,
    game::{
        entity::{SubtickMove, UserCmd},
        Context, Fix,
    },
    hook::{Interceptor, Token},
    host::Host,
    meta::settings::{Subscription, Switch},
    native_target,
    resolver::ForeignFn,
};

pub const PROCESS_USERCMDS: &str = "ProcessUsercmds";

/// `IN_USE`, which is kept even though it sits inside the movement button range.
const BUTTON_USE: u64 = 0x20;

native_target!(
    process_usercmds,
    fn(controller: usize, commands: usize, count: i32, paused: bool, margin: f32) -> usize
);

fn is_subtick_movement(step: &SubtickMove) -> bool {
    (0x2..=0x400).contains(&step.button) && step.button != BUTTON_USE
        || step.pitch_delta != 0.0
        || step.yaw_delta != 0.0
}

/// Removes the movement-button and view-angle steps from `cmd`. The list is only rewritten if
/// something was removed. Returns `true` if it was.
pub fn filter_movement(cmd: &mut dyn UserCmd) -> bool {
    let moves = cmd.subtick_moves();
    let count = moves.len();

    let kept: Vec<SubtickMove> = moves
        .into_iter()
        .filter(|step| !is_subtick_movement(step))
        .collect();

    if kept.len() == count {
        return false;
    }

    cmd.set_subtick_moves(kept);
    true
}

/// Drops the attack timing from `cmd`. Returns `true` if anything changed.
pub fn filter_shooting(cmd: &mut dyn UserCmd) -> bool {
    let mut changed = false;

    if cmd.attack_start_history_indices() != (-1, -1) {
        cmd.set_attack_start_history_indices(-1, -1);
        changed = true;
    }

    if cmd.input_history_len() > 0 {
        cmd.clear_input_history();
        changed = true;
    }

    changed
}

/// The diverted `ProcessUsercmds` and the switches that decide whether it's diverted.
struct Filter {
    function: ForeignFn<process_usercmds::Function>,
    interceptor: Arc<Interceptor>,
    host: Arc<dyn Host>,
    movement: Arc<Switch>,
    shooting: Arc<Switch>,
    token: Mutex<Option<Token>>,
}

impl Filter {
    fn wanted(&self) -> bool {
        self.movement.get() || self.shooting.get()
    }

    /// Attaches or detaches to match the switches.
    fn refresh(&self) -> Result<()> {
        let mut token = self.token.lock();

        match (self.wanted(), *token) {
            (true, None) => {
                let host = self.host.clone();
                let movement = self.movement.clone();
                let shooting = self.shooting.clone();

                let installed = self.interceptor.install(
                    &self.function,
                    process_usercmds::detour(),
                    move |next| {
                        Box::new(move |args: (usize, usize, i32, bool, f32)| {
                            let (_, commands, count, _, _) = args;

                            for mut cmd in host.user_cmds(commands, count) {
                                if movement.get() {
                                    filter_movement(cmd.as_mut());
                                }

                                if shooting.get() {
                                    filter_shooting(cmd.as_mut());
                                }
                            }

                            next.call(args)
                        })
                    },
                )?;

                *token = Some(installed);
                log::debug!("Subtick filtering enabled.");
            }

            (false, Some(installed)) => {
                self.interceptor.remove(installed);
                *token = None;
                log::debug!("Subtick filtering disabled.");
            }

            _ => {}
        }

        Ok(())
    }

    fn detach(&self) {
        if let Some(installed) = self.token.lock().take() {
            self.interceptor.remove(installed);
        }
    }
}

fn refresh_listener(filter: Weak<Filter>) -> impl Fn(bool) + Send + Sync + 'static {
    move |_| {
        if let Some(filter) = filter.upgrade() {
            if let Err(err) = filter.refresh() {
                log::error!("Unable to update subtick filtering: {err:?}");
            }
        }
    }
}

pub struct SubtickFix {
    filter: Option<Arc<Filter>>,
    subscriptions: Vec<(Arc<Switch>, Subscription)>,
}

impl SubtickFix {
    pub fn new() -> SubtickFix {
        SubtickFix {
            filter: None,
            subscriptions: vec![],
        }
    }

    /// Whether `ProcessUsercmds` is currently diverted.
    pub fn is_filtering(&self) -> bool {
        self.filter
            .as_ref()
            .map_or(false, |filter| filter.token.lock().is_some())
    }
}

impl Default for SubtickFix {
    fn default() -> Self {
        SubtickFix::new()
    }
}

impl Fix for SubtickFix {
    fn name(&self) -> &str {
        "SubtickDisable"
    }

    fn install(&mut self, context: &Context) -> Result<()> {
        if self.filter.is_some() {
            return Ok(());
        }

        let function = context
            .resolver()
            .by_signature::<process_usercmds::Function>(PROCESS_USERCMDS)
            .map_err(|err| FixError::fatal(self.name(), err))?;

        let switches = &context.switches;

        let filter = Arc::new(Filter {
            function,
            interceptor: context.interceptor.clone(),
            host: context.host.clone(),
            movement: switches.disable_subtick_movement.clone(),
            shooting: switches.disable_subtick_shooting.clone(),
            token: Mutex::new(None),
        });

        for switch in [
            &switches.disable_subtick_movement,
            &switches.disable_subtick_shooting,
        ] {
            let subscription = switch.subscribe(refresh_listener(Arc::downgrade(&filter)));
            self.subscriptions.push((switch.clone(), subscription));
        }

        self.filter = Some(filter.clone());

        filter.refresh()?;

        log::info!(
            "Subtick filtering configured (movement: {}, shooting: {}).",
            filter.movement.get(),
            filter.shooting.get()
        );

        Ok(())
    }

    fn uninstall(&mut self, _context: &Context) {
        for (switch, subscription) in self.subscriptions.drain(..) {
            switch.unsubscribe(subscription);
        }

        if let Some(filter) = self.filter.take() {
            filter.detach();
        }
    }
}
