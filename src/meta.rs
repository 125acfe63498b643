//! What the fixes are configured with: the operator's settings, and the game data that describes
//! the server binary.

pub mod game_data;
pub mod settings;
