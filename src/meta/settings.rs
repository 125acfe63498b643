//! Server operator settings, saved as JSON next to the plugin, and the runtime switches that the
//! fixes read while the server is running.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use eyre::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// The name of the settings file inside the plugin's directory.
const FILE_NAME: &str = "fixes.json";

fn default_patches() -> Vec<String> {
    vec![
        "ServerMovementUnlock".to_string(),
        "FixWaterFloorJump".to_string(),
    ]
}

fn default_game_data() -> PathBuf {
    PathBuf::from("gamedata.json")
}

fn default_hooking_library() -> String {
    "libdobby.so".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("fixes.log"))
}

/// The operator's settings.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Options {
    /// Apply trigger_push velocity the way CS:GO did.
    #[serde(default)]
    pub use_old_push: bool,

    /// Drop subtick movement input from user commands.
    #[serde(default)]
    pub disable_subtick_movement: bool,

    /// Drop subtick attack timing from user commands.
    #[serde(default)]
    pub disable_subtick_shooting: bool,

    /// Names of the game-data byte patches to apply.
    #[serde(default = "default_patches")]
    pub patches: Vec<String>,

    /// Game-data file, relative to the plugin directory unless absolute.
    #[serde(default = "default_game_data")]
    pub game_data: PathBuf,

    /// The hooking library to load.
    #[serde(default = "default_hooking_library")]
    pub hooking_library: String,

    /// Where log messages are written. `None` disables the log file.
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,

    /// Address to send log packets to when built with the `debug` feature.
    #[serde(default)]
    pub log_address: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            use_old_push: false,
            disable_subtick_movement: false,
            disable_subtick_shooting: false,
            patches: default_patches(),
            game_data: default_game_data(),
            hooking_library: default_hooking_library(),
            log_file: default_log_file(),
            log_address: None,
        }
    }
}

impl Options {
    /// Attempts to parse the contents of `reader` to get an `Options` value.
    pub fn parse_json(reader: impl Read) -> Result<Options> {
        Ok(serde_json::from_reader(reader)?)
    }

    fn global_mut() -> MutexGuard<'static, Option<Options>> {
        lazy_static::lazy_static! {
            static ref OPTIONS: Mutex<Option<Options>> = Mutex::new(None);
        }

        OPTIONS.lock()
    }

    /// Returns the current settings, or the defaults if none have been loaded.
    pub fn get() -> Options {
        Options::global_mut().clone().unwrap_or_default()
    }

    /// Changes the global settings with `change`.
    pub fn update(change: impl FnOnce(&mut Options)) {
        let mut options = Options::global_mut();
        change(options.get_or_insert_with(Options::default));
    }

    /// Returns the path of the settings file in `directory`.
    pub fn path(directory: &Path) -> PathBuf {
        directory.join(FILE_NAME)
    }

    /// Resolves `path` against `directory` if it's relative.
    pub fn resolve(directory: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            directory.join(path)
        }
    }

    fn load_from_file(directory: &Path) -> Result<Option<Options>> {
        let path = Options::path(directory);

        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)
            .wrap_err_with(|| format!("When opening settings '{}'", path.display()))?;

        Ok(Some(Options::parse_json(file)?))
    }

    /// Either loads the settings in `directory` or generates default values for them.
    pub fn load(directory: &Path) -> Options {
        match Options::load_from_file(directory) {
            Ok(Some(options)) => return options,

            Ok(None) => log::info!("No settings file found. Defaults will be used."),

            Err(err) => {
                log::error!("Error loading settings file: {err:?}. Defaults will be used.")
            }
        };

        Options::default()
    }

    fn try_save(&self, directory: &Path) -> Result<()> {
        std::fs::write(
            Options::path(directory),
            serde_json::to_string_pretty(self)?,
        )?;

        Ok(())
    }

    /// Saves the global settings to `directory`. Errors will be logged.
    pub fn save(directory: &Path) {
        if let Err(err) = Options::get().try_save(directory) {
            log::error!("Error saving options to file: {err:?}.");
        } else {
            log::info!("Settings saved.");
        }
    }

    /// Makes `options` the global settings.
    pub fn set(options: Options) {
        log::info!("Options: {options:#?}");
        *Options::global_mut() = Some(options);
    }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Identifies a listener added with `Switch::subscribe`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Subscription(u64);

/// A boolean setting that can change while the server runs.
pub struct Switch {
    name: &'static str,
    value: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(Subscription, Listener)>>,
}

impl Switch {
    pub fn new(name: &'static str, value: bool) -> Switch {
        Switch {
            name,
            value: AtomicBool::new(value),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Sets the value, notifying listeners if it changed.
    pub fn set(&self, value: bool) {
        if self.value.swap(value, Ordering::AcqRel) == value {
            return;
        }

        log::info!("{} = {value}", self.name);

        // Listeners may subscribe or unsubscribe, so don't hold the lock while they run.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    /// Calls `listener` with the new value every time the value changes.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .push((subscription, Arc::new(listener)));

        subscription
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.listeners
            .lock()
            .retain(|(existing, _)| *existing != subscription);
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.name, self.get())
    }
}

/// Every switch the fixes read.
#[derive(Clone, Debug)]
pub struct Switches {
    pub use_old_push: Arc<Switch>,
    pub disable_subtick_movement: Arc<Switch>,
    pub disable_subtick_shooting: Arc<Switch>,
}

impl Switches {
    pub fn from_options(options: &Options) -> Switches {
        Switches {
            use_old_push: Arc::new(Switch::new("cs2f_use_old_push", options.use_old_push)),

            disable_subtick_movement: Arc::new(Switch::new(
                "sw_disable_subtick_movement",
                options.disable_subtick_movement,
            )),

            disable_subtick_shooting: Arc::new(Switch::new(
                "sw_disable_subtick_shooting",
                options.disable_subtick_shooting,
            )),
        }
    }

    fn all(&self) -> [&Arc<Switch>; 3] {
        [
            &self.use_old_push,
            &self.disable_subtick_movement,
            &self.disable_subtick_shooting,
        ]
    }

    /// Finds a switch by its console variable name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Switch>> {
        self.all()
            .into_iter()
            .find(|switch| switch.name().eq_ignore_ascii_case(name))
    }

    /// Copies the switch values into `options`.
    pub fn apply(&self, options: &mut Options) {
        options.use_old_push = self.use_old_push.get();
        options.disable_subtick_movement = self.disable_subtick_movement.get();
        options.disable_subtick_shooting = self.disable_subtick_shooting.get();
    }
}
