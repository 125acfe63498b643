//! Typed views of server entities and user commands.
//!
//! Implementations read and write the live objects through the host's schema layer, so every
//! accessor can fail: an entity can be destroyed at any point between two reads. Callers treat
//! such failures as "nothing to do" rather than as errors worth surfacing.

use std::sync::Arc;

use eyre::Result;
use strum::{Display, FromRepr};

use crate::{entity_key::EntityKey, math::Vector};

/// `m_fFlags` bits.
pub mod flags {
    /// At rest on the ground.
    pub const ON_GROUND: u32 = 1 << 0;

    /// Base velocity has been applied this frame.
    pub const BASE_VELOCITY: u32 = 1 << 23;
}

/// `m_usSolidFlags` bits.
pub mod solid_flags {
    pub const NOT_SOLID: u8 = 0x0004;
}

/// Designer name shared by every player pawn.
pub const PLAYER_DESIGNER_NAME: &str = "player";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum MoveType {
    None = 0,
    Obsolete,
    Walk,
    Fly,
    FlyGravity,
    VPhysics,
    Push,
    NoClip,
    Observer,
    Ladder,
    Custom,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum SolidType {
    None = 0,
    Bsp,
    Bbox,
    Obb,
    Sphere,
    Point,
    VPhysics,
    Capsule,
}

/// The parts of an entity's collision property that matter for touching.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Collision {
    pub solid_type: SolidType,
    pub solid_flags: u8,
}

impl Collision {
    pub fn is_solid(&self) -> bool {
        self.solid_type != SolidType::None && self.solid_flags & solid_flags::NOT_SOLID == 0
    }
}

/// A snapshot of an entity's scene node.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct SceneNode {
    pub abs_origin: Vector,
    pub abs_rotation: crate::math::QAngle,
    pub has_parent: bool,
}

pub trait Weapon: Send + Sync {
    fn address(&self) -> usize;

    fn is_valid(&self) -> bool;

    /// The inventory slot from the weapon's data.
    fn slot(&self) -> Result<u32>;

    /// Spawns the weapon into the world after it has been dropped.
    fn dispatch_spawn(&self) -> Result<()>;
}

pub trait Entity: Send + Sync {
    fn address(&self) -> usize;

    /// Whether the entity still exists.
    fn is_valid(&self) -> bool;

    fn designer_name(&self) -> Result<String>;

    /// The id the level designer gave the entity, if any.
    fn unique_id(&self) -> Result<Option<String>>;

    fn spawn_flags(&self) -> Result<u32>;

    /// Whether the entity's life state is "alive".
    fn is_alive(&self) -> Result<bool>;

    fn move_type(&self) -> Result<MoveType>;

    fn collision(&self) -> Result<Option<Collision>>;

    fn scene_node(&self) -> Result<Option<SceneNode>>;

    fn flags(&self) -> Result<u32>;

    fn set_flags(&self, flags: u32) -> Result<()>;

    fn base_velocity(&self) -> Result<Vector>;

    fn set_base_velocity(&self, velocity: Vector) -> Result<()>;

    fn clear_ground_entity(&self) -> Result<()>;

    /// Moves the entity without changing its angles or velocity.
    fn teleport(&self, origin: Vector) -> Result<()>;

    /// Whether a trigger fires on start touch instead of on every touch.
    fn trigger_on_start_touch(&self) -> Result<bool>;

    /// A push trigger's direction, in its own space.
    fn push_direction(&self) -> Result<Vector>;

    fn push_speed(&self) -> Result<f32>;

    /// The gravity scale configured on the entity (`m_flGravityScale`).
    fn gravity_scale(&self) -> Result<f32>;

    /// Writes the gravity scale movement actually uses (`m_flActualGravityScale`).
    fn set_actual_gravity_scale(&self, scale: f32) -> Result<()>;

    fn weapons(&self) -> Result<Vec<Arc<dyn Weapon>>>;

    fn drop_weapon(&self, weapon: &dyn Weapon) -> Result<()>;

    /// Removes every item the pawn carries.
    fn remove_items(&self) -> Result<()>;

    fn give_item(&self, name: &str) -> Result<()>;
}

impl<'a> dyn Entity + 'a {
    /// The key this entity's side-table entries are stored under.
    pub fn key(&self) -> EntityKey {
        match self.unique_id() {
            Ok(id) => EntityKey::from_identifier(id.as_deref()),
            Err(err) => {
                log::debug!("Unable to read unique id of {:#x}: {err:?}", self.address());
                EntityKey::INVALID
            }
        }
    }

    /// Whether this is a player pawn that is still alive.
    pub fn is_live_pawn(&self) -> bool {
        if !self.is_valid() {
            return false;
        }

        matches!(self.designer_name(), Ok(name) if name == PLAYER_DESIGNER_NAME)
            && matches!(self.is_alive(), Ok(true))
    }
}

/// One sub-frame input event inside a user command.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct SubtickMove {
    pub button: u64,
    pub pressed: bool,
    pub when: f32,
    pub analog_forward_delta: f32,
    pub analog_left_delta: f32,
    pub pitch_delta: f32,
    pub yaw_delta: f32,
}

/// The subtick-related fields of a user command.
pub trait UserCmd {
    fn subtick_moves(&self) -> Vec<SubtickMove>;

    fn set_subtick_moves(&mut self, moves: Vec<SubtickMove>);

    /// Primary and secondary attack start history indices.
    fn attack_start_history_indices(&self) -> (i32, i32);

    fn set_attack_start_history_indices(&mut self, primary: i32, secondary: i32);

    fn input_history_len(&self) -> usize;

    fn clear_input_history(&mut self);
}
