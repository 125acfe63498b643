//! Restores the CS:GO behaviour of `trigger_push` when `cs2f_use_old_push` is on: the push
//! velocity goes into the touching entity's base velocity on every touch, instead of whatever
//! the new implementation does.

use std::sync::Arc;

use eyre::Result;

use crate::{
    error::FixError,
    game::{
        entity::{flags, Entity, MoveType, SceneNode},
        Context, Fix,
    },
    hook::{self, Token},
    host::Host,
    math::{Matrix3x4, Vector},
    meta::settings::Switch,
    native_target,
    resolver::{ForeignFn, MethodSlot},
};

pub const TOUCH: &str = "TriggerPush_Touch";
pub const PASSES_TRIGGER_FILTERS: MethodSlot =
    MethodSlot::new("CBaseTrigger", "CBaseTrigger::PassesTriggerFilters");

/// Only push on the first touch.
pub const SF_PUSH_ONCE: u32 = 0x80;

native_target!(push_touch, fn(push: usize, other: usize));

type FilterFn = extern "C" fn(usize, usize) -> bool;

/// What happened to a touch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PushOutcome {
    /// The game's own implementation should handle it.
    Forward,

    /// Nothing should be pushed.
    Ignore,

    /// We pushed the entity ourselves.
    Applied,
}

/// Computes the velocity `push` gives an entity whose base velocity is `base_velocity`.
pub fn push_velocity(
    frame: &Matrix3x4,
    direction: Vector,
    speed: f32,
    base_velocity: Option<Vector>,
) -> Vector {
    let mut velocity = frame.rotate(direction) * speed;

    if let Some(base_velocity) = base_velocity {
        velocity += base_velocity;
    }

    velocity
}

struct Pusher {
    host: Arc<dyn Host>,
    enabled: Arc<Switch>,
    filter: ForeignFn<FilterFn>,
}

impl Pusher {
    fn touch(&self, push: usize, other: usize) -> Result<PushOutcome> {
        if !self.enabled.get() {
            return Ok(PushOutcome::Forward);
        }

        let (push, other) = match (self.host.entity(push), self.host.entity(other)) {
            (Some(push), Some(other)) => (push, other),
            _ => return Ok(PushOutcome::Forward),
        };

        if push.spawn_flags()? & SF_PUSH_ONCE != 0 || push.trigger_on_start_touch()? {
            return Ok(PushOutcome::Forward);
        }

        match other.move_type()? {
            MoveType::VPhysics => return Ok(PushOutcome::Forward),
            MoveType::None | MoveType::Push | MoveType::NoClip => return Ok(PushOutcome::Ignore),
            _ => {}
        }

        if !other.collision()?.map_or(false, |collision| collision.is_solid()) {
            return Ok(PushOutcome::Ignore);
        }

        if !self.filter.call((push.address(), other.address())) {
            return Ok(PushOutcome::Ignore);
        }

        let node = match other.scene_node()? {
            Some(node) if !node.has_parent => node,
            _ => return Ok(PushOutcome::Ignore),
        };

        let trigger_node = match push.scene_node()? {
            Some(node) => node,
            None => return Ok(PushOutcome::Forward),
        };

        self.apply(push.as_ref(), other.as_ref(), &trigger_node, node.abs_origin)?;
        Ok(PushOutcome::Applied)
    }

    fn apply(
        &self,
        push: &dyn Entity,
        other: &dyn Entity,
        trigger_node: &SceneNode,
        origin: Vector,
    ) -> Result<()> {
        let frame = Matrix3x4::from_angles(trigger_node.abs_rotation, trigger_node.abs_origin);
        let entity_flags = other.flags()?;

        let base_velocity = (entity_flags & flags::BASE_VELOCITY != 0)
            .then(|| other.base_velocity())
            .transpose()?;

        let velocity = push_velocity(
            &frame,
            push.push_direction()?,
            push.push_speed()?,
            base_velocity,
        );

        if velocity.z > 0.0 && entity_flags & flags::ON_GROUND != 0 {
            other.clear_ground_entity()?;
            other.teleport(origin + Vector::new(0.0, 0.0, 1.0))?;
        }

        other.set_base_velocity(velocity)?;
        other.set_flags(other.flags()? | flags::BASE_VELOCITY)?;

        log::trace!(
            "Pushed {:#x} with {velocity:?} from {:#x}.",
            other.address(),
            push.address()
        );

        Ok(())
    }
}

pub struct PushFix {
    token: Option<Token>,
}

impl PushFix {
    pub fn new() -> PushFix {
        PushFix { token: None }
    }
}

impl Default for PushFix {
    fn default() -> Self {
        PushFix::new()
    }
}

impl Fix for PushFix {
    fn name(&self) -> &str {
        "TriggerPushFix"
    }

    fn install(&mut self, context: &Context) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }

        let resolver = context.resolver();

        let touch = resolver
            .by_signature::<push_touch::Function>(TOUCH)
            .map_err(|err| FixError::fatal(self.name(), err))?;

        let filter = resolver
            .by_vtable::<FilterFn>(PASSES_TRIGGER_FILTERS)
            .map_err(|err| FixError::fatal(self.name(), err))?;

        let pusher = Pusher {
            host: context.host.clone(),
            enabled: context.switches.use_old_push.clone(),
            filter,
        };

        let token = context
            .interceptor
            .install(&touch, push_touch::detour(), move |next| {
                Box::new(move |(push, other)| {
                    let outcome = pusher.touch(push, other).unwrap_or_else(|err| {
                        log::error!("Error in trigger_push touch of {push:#x}: {err:?}");
                        PushOutcome::Forward
                    });

                    if outcome == PushOutcome::Forward {
                        next.call((push, other));
                    }
                })
            })?;

        self.token = Some(token);
        Ok(())
    }

    fn uninstall(&mut self, context: &Context) {
        hook::remove_token(&context.interceptor, &mut self.token);
    }
}
