//! Runtime fixes for Source 2 dedicated servers.
//!
//! The plugin host creates a `Plugin` when it loads us, giving it the directory we live in and
//! access to the server's entities. Everything that is installed is removed again when the
//! `Plugin` is unloaded or dropped.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use eyre::Result;

pub mod entity_key;
pub mod error;
pub mod game;
pub mod hook;
pub mod host;
mod logging;
pub mod math;
#[cfg(target_os = "linux")]
pub mod memory;
pub mod meta;
pub mod resolver;

#[cfg(test)]
mod testing;

use game::{gravity::GravityTable, strip::EquipStripTable, Context, Fixes};
use hook::{Interceptor, Patcher};
use host::{Host, Memory};
use meta::{
    game_data::GameData,
    settings::{Options, Switches},
};

/// Everything the plugin has set up.
pub struct Plugin {
    directory: PathBuf,
    fixes: Fixes,
}

impl Plugin {
    /// Loads the settings and game data from `directory` and installs every fix that can be
    /// installed on the running server.
    #[cfg(target_os = "linux")]
    pub fn load(directory: &Path, host: Arc<dyn Host>) -> Result<Plugin> {
        let options = Options::load(directory);

        // Load the logging system before everything else so the rest of the setup is logged.
        logging::init(&options, directory);

        log::info!("s2fixes {} loading.", env!("CARGO_PKG_VERSION"));

        let library = Options::resolve(directory, Path::new(&options.hooking_library));
        let patcher = hook::DobbyPatcher::load(&library.to_string_lossy())?;

        let game_data = GameData::load(Options::resolve(directory, &options.game_data))?;

        Ok(Plugin::with_services(
            directory,
            options,
            host,
            Arc::new(memory::ProcessMemory::new()),
            Arc::new(patcher),
            game_data,
        ))
    }

    /// Installs the fixes using the given services.
    pub fn with_services(
        directory: &Path,
        options: Options,
        host: Arc<dyn Host>,
        memory: Arc<dyn Memory>,
        patcher: Arc<dyn Patcher>,
        game_data: GameData,
    ) -> Plugin {
        Options::set(options.clone());

        let context = Context {
            host,
            memory,
            game_data: Arc::new(game_data),
            interceptor: Arc::new(Interceptor::new(patcher)),
            switches: Switches::from_options(&options),
        };

        let mut fixes = Fixes::new(context, &options);
        fixes.install();

        Plugin {
            directory: directory.to_path_buf(),
            fixes,
        }
    }

    /// Names of the fixes that are installed.
    pub fn installed(&self) -> Vec<&str> {
        self.fixes.installed()
    }

    /// Changes the runtime switch called `name` (e.g. `cs2f_use_old_push`). Returns `false` if
    /// there is no such switch.
    pub fn set_switch(&self, name: &str, value: bool) -> bool {
        let switches = &self.fixes.context().switches;

        match switches.by_name(name) {
            Some(switch) => {
                switch.set(value);
                Options::update(|options| switches.apply(options));
                true
            }

            None => {
                log::warn!("No switch called '{name}'.");
                false
            }
        }
    }

    pub fn switch(&self, name: &str) -> Option<bool> {
        self.fixes
            .context()
            .switches
            .by_name(name)
            .map(|switch| switch.get())
    }

    /// Writes the current settings, including switch values, back to the settings file.
    pub fn save_settings(&self) {
        Options::save(&self.directory);
    }

    /// Gravity overrides for `trigger_gravity` entities.
    pub fn gravity(&self) -> &Arc<GravityTable> {
        self.fixes.gravity()
    }

    /// Weapon slots that each `game_player_equip` strips.
    pub fn strip_table(&self) -> &Arc<EquipStripTable> {
        self.fixes.strip_table()
    }

    /// Tries again to install the fixes that failed.
    pub fn retry(&mut self) -> usize {
        self.fixes.install()
    }

    /// Removes everything the plugin installed.
    pub fn unload(mut self) {
        self.fixes.uninstall();
        log::info!("s2fixes unloaded.");
    }
}
