//! Services the server plugin host provides: raw access to the server's memory, typed views of
//! entities, a scheduler and the player list.
//!
//! The crate never reads entity fields by offset itself; that's the schema layer's job, and it
//! lives behind `Host::entity`.

use std::sync::Arc;

use eyre::Result;

use crate::game::entity::{Entity, UserCmd};

/// A loaded module's code, as seen by the signature scanner.
pub struct ModuleImage<'a> {
    /// Address that `bytes[0]` lives at.
    pub base: usize,

    /// The bytes of the module's code.
    pub bytes: &'a [u8],
}

/// Access to the memory of the process we live in.
pub trait Memory: Send + Sync {
    /// Returns the code of the module the engine calls `name` (e.g. `"server"`).
    fn module(&self, name: &str) -> Option<ModuleImage<'_>>;

    /// Returns the address of the first virtual function of `class` in `module`.
    fn vtable(&self, module: &str, class: &str) -> Option<usize>;

    fn read_usize(&self, address: usize) -> Option<usize>;

    fn read_i32(&self, address: usize) -> Option<i32>;

    /// Reads a NUL-terminated string.
    fn read_c_str(&self, address: usize) -> Option<String>;

    fn read_bytes(&self, address: usize, len: usize) -> Option<Vec<u8>>;

    /// Writes over code, adjusting page protection as needed.
    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()>;

    /// Translates an address found in a module image into one that can be called from here.
    /// Modules mapped by the loader are callable in place.
    fn code_address(&self, address: usize) -> usize {
        address
    }
}

/// Everything else the plugin host gives us.
pub trait Host: Send + Sync {
    /// Returns a view of the entity at `address`, or `None` if there isn't a live entity there.
    fn entity(&self, address: usize) -> Option<Arc<dyn Entity>>;

    /// Returns the pawns of every connected player. Dead pawns are included.
    fn player_pawns(&self) -> Vec<Arc<dyn Entity>>;

    /// Runs `task` once, on the simulation thread, at the start of the next world update.
    fn next_world_update(&self, task: Box<dyn FnOnce() + Send>);

    /// Returns views of the `count` user commands starting at `commands`.
    fn user_cmds(&self, commands: usize, count: i32) -> Vec<Box<dyn UserCmd + '_>>;
}
