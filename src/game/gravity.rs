//! Makes `trigger_gravity` keep working for players.
//!
//! The gravity scale each trigger was authored with is remembered when the trigger is
//! precached. While a live player touches the trigger we apply that scale to the player
//! ourselves, and put the player back to normal gravity once they stop touching it.

use std::sync::Arc;

use dashmap::DashMap;
use eyre::Result;

use crate::{
    entity_key::EntityKey,
    error::FixError,
    game::{entity::Entity, Context, Fix},
    hook::{self, Token},
    host::Host,
    native_target,
    resolver::{ForeignFn, MethodSlot},
};

pub const GRAVITY_TOUCH: &str = "CTriggerGravity::GravityTouch";
pub const SET_GRAVITY_SCALE: &str = "CBaseEntity::SetGravityScale";
pub const PRECACHE: MethodSlot = MethodSlot::new("CTriggerGravity", "CBaseEntity::Precache");
pub const END_TOUCH: MethodSlot = MethodSlot::new("CTriggerGravity", "CBaseEntity::EndTouch");

pub const DEFAULT_GRAVITY_SCALE: f32 = 1.0;

native_target!(gravity_touch, fn(trigger: usize, other: usize));
native_target!(precache, fn(trigger: usize, key_values: usize));
native_target!(end_touch, fn(trigger: usize, other: usize));

type SetGravityScaleFn = extern "C" fn(usize, f32);

/// Gravity scales of `trigger_gravity` entities, by key.
#[derive(Default)]
pub struct GravityTable(DashMap<EntityKey, f32>);

impl GravityTable {
    /// Stores `scale` for the trigger with `key`. Invalid keys and scales that aren't positive
    /// are rejected.
    pub fn set(&self, key: EntityKey, scale: f32) -> bool {
        if !key.is_valid() || !scale.is_finite() || scale <= 0.0 {
            return false;
        }

        self.0.insert(key, scale);
        log::info!("Gravity for {key} set to {scale}.");

        true
    }

    pub fn remove(&self, key: EntityKey) -> Option<f32> {
        let removed = self.0.remove(&key).map(|(_, scale)| scale);

        if let Some(scale) = removed {
            log::info!("Removed gravity {scale} for {key}.");
        }

        removed
    }

    pub fn get(&self, key: EntityKey) -> Option<f32> {
        self.0.get(&key).map(|scale| *scale)
    }

    pub fn clear(&self) {
        let count = self.0.len();
        self.0.clear();

        log::info!("Cleared {count} gravity entries.");
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Remembers what a freshly precached trigger's gravity scale is. Runs on the world update
/// after the precache, by which point the entity's keyvalues have been applied.
fn register(table: &GravityTable, host: &dyn Host, address: usize) -> Result<()> {
    let trigger = match host.entity(address) {
        Some(trigger) if trigger.is_valid() => trigger,
        _ => return Ok(()),
    };

    let key = trigger.key();
    if !key.is_valid() {
        return Ok(());
    }

    let scale = trigger.gravity_scale()?;

    if scale != 0.0 && scale != DEFAULT_GRAVITY_SCALE && table.set(key, scale) {
        log::debug!("Registered gravity {scale} for trigger {address:#x}.");
    }

    Ok(())
}

struct Gravity {
    table: Arc<GravityTable>,
    host: Arc<dyn Host>,
    set_gravity_scale: Option<ForeignFn<SetGravityScaleFn>>,
}

impl Gravity {
    fn apply(&self, pawn: &dyn Entity, scale: f32) -> Result<()> {
        pawn.set_actual_gravity_scale(scale)?;

        if let Some(set_gravity_scale) = &self.set_gravity_scale {
            set_gravity_scale.call((pawn.address(), scale));
        }

        Ok(())
    }

    /// Returns `true` if the touch was handled and the original shouldn't run.
    fn touch(&self, trigger: usize, other: usize) -> Result<bool> {
        let trigger = match self.host.entity(trigger) {
            Some(trigger) => trigger,
            None => return Ok(false),
        };

        let scale = match self.table.get(trigger.key()) {
            Some(scale) => scale,
            None => return Ok(false),
        };

        let pawn = match self.host.entity(other) {
            Some(pawn) if pawn.is_live_pawn() => pawn,
            _ => return Ok(false),
        };

        self.apply(pawn.as_ref(), scale)?;
        log::trace!("Applied gravity {scale} to {other:#x}.");

        Ok(true)
    }

    fn end_touch(&self, other: usize) -> Result<()> {
        match self.host.entity(other) {
            Some(pawn) if pawn.is_live_pawn() => self.apply(pawn.as_ref(), DEFAULT_GRAVITY_SCALE),
            _ => Ok(()),
        }
    }
}

pub struct GravityFix {
    table: Arc<GravityTable>,
    touch: Option<Token>,
    precache: Option<Token>,
    end_touch: Option<Token>,
}

impl GravityFix {
    pub fn new(table: Arc<GravityTable>) -> GravityFix {
        GravityFix {
            table,
            touch: None,
            precache: None,
            end_touch: None,
        }
    }

    pub fn table(&self) -> &Arc<GravityTable> {
        &self.table
    }

    fn install_precache(&mut self, context: &Context) -> Result<()> {
        let function = context
            .resolver()
            .by_vtable::<precache::Function>(PRECACHE)?;

        let table = self.table.clone();
        let host = context.host.clone();

        let token = context
            .interceptor
            .install(&function, precache::detour(), move |next| {
                Box::new(move |(trigger, key_values)| {
                    next.call((trigger, key_values));

                    let table = table.clone();
                    let scheduled_host = host.clone();

                    host.next_world_update(Box::new(move || {
                        if let Err(err) = register(&table, &*scheduled_host, trigger) {
                            log::error!("Unable to register gravity of {trigger:#x}: {err:?}");
                        }
                    }));
                })
            })?;

        self.precache = Some(token);
        Ok(())
    }

    fn install_end_touch(&mut self, context: &Context, gravity: Arc<Gravity>) -> Result<()> {
        let function = context
            .resolver()
            .by_vtable::<end_touch::Function>(END_TOUCH)?;

        let token = context
            .interceptor
            .install(&function, end_touch::detour(), move |next| {
                Box::new(move |(trigger, other)| {
                    next.call((trigger, other));

                    if let Err(err) = gravity.end_touch(other) {
                        log::error!("Unable to restore gravity of {other:#x}: {err:?}");
                    }
                })
            })?;

        self.end_touch = Some(token);
        Ok(())
    }
}

impl Fix for GravityFix {
    fn name(&self) -> &str {
        "GravityTouchFix"
    }

    fn install(&mut self, context: &Context) -> Result<()> {
        let resolver = context.resolver();

        let touch = resolver
            .by_signature::<gravity_touch::Function>(GRAVITY_TOUCH)
            .map_err(|err| FixError::fatal(self.name(), err))?;

        let set_gravity_scale = match resolver.by_signature::<SetGravityScaleFn>(SET_GRAVITY_SCALE)
        {
            Ok(function) => Some(function),
            Err(err) => {
                log::warn!("Gravity will only be written to the pawn's field: {err:?}");
                None
            }
        };

        let gravity = Arc::new(Gravity {
            table: self.table.clone(),
            host: context.host.clone(),
            set_gravity_scale,
        });

        if self.touch.is_none() {
            let gravity = gravity.clone();

            let token = context
                .interceptor
                .install(&touch, gravity_touch::detour(), move |next| {
                    Box::new(move |(trigger, other)| {
                        let handled = gravity.touch(trigger, other).unwrap_or_else(|err| {
                            log::error!("Error in gravity touch of {trigger:#x}: {err:?}");
                            false
                        });

                        if !handled {
                            next.call((trigger, other));
                        }
                    })
                })?;

            self.touch = Some(token);
        }

        if self.precache.is_none() {
            if let Err(err) = self.install_precache(context) {
                log::warn!("Gravity won't be read from new triggers: {err:?}");
            }
        }

        if self.end_touch.is_none() {
            if let Err(err) = self.install_end_touch(context, gravity) {
                log::warn!("Gravity won't be reset when players leave triggers: {err:?}");
            }
        }

        Ok(())
    }

    fn uninstall(&mut self, context: &Context) {
        hook::remove_token(&context.interceptor, &mut self.end_touch);
        hook::remove_token(&context.interceptor, &mut self.precache);
        hook::remove_token(&context.interceptor, &mut self.touch);

        self.table.clear();
    }
}
