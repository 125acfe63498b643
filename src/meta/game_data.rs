//! The game-data file: byte signatures, vtable slot offsets and byte patches for the running
//! server build, each with one value per platform.
//!
//! Game updates move functions around, so none of these are baked into the crate. A missing
//! entry is never fatal on its own; the fix that wanted it decides.

use std::{collections::HashMap, fs::File, io::Read, path::Path};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Platforms that a game-data entry can carry a value for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// The platform this crate was built for.
    pub const fn current() -> Platform {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Returns the file name of the shared library the engine calls `module`.
    pub fn library_file_name(self, module: &str) -> String {
        match self {
            Platform::Linux => format!("lib{module}.so"),
            Platform::Windows => format!("{module}.dll"),
        }
    }
}

/// A value that differs between platforms.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PerPlatform<T> {
    #[serde(default)]
    pub linux: Option<T>,

    #[serde(default)]
    pub windows: Option<T>,
}

impl<T> PerPlatform<T> {
    pub fn get(&self, platform: Platform) -> Option<&T> {
        match platform {
            Platform::Linux => self.linux.as_ref(),
            Platform::Windows => self.windows.as_ref(),
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.get(Platform::current())
    }
}

fn default_library() -> String {
    "server".to_string()
}

/// A byte pattern identifying the start of a function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// The module to scan, without platform prefix or extension.
    #[serde(default = "default_library")]
    pub library: String,

    #[serde(flatten)]
    pub patterns: PerPlatform<String>,
}

/// A sequence of bytes written over code found by a signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Name of the signature that locates the code.
    pub signature: String,

    /// Distance from the signature match to the first patched byte.
    #[serde(default)]
    pub offset: PerPlatform<isize>,

    /// The bytes to write, in the same hex format as signatures.
    #[serde(flatten)]
    pub bytes: PerPlatform<String>,
}

/// Everything loaded from a game-data file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GameData {
    #[serde(default)]
    pub signatures: HashMap<String, SignatureEntry>,

    #[serde(default)]
    pub offsets: HashMap<String, PerPlatform<usize>>,

    #[serde(default)]
    pub patches: HashMap<String, PatchEntry>,
}

impl GameData {
    /// Attempts to parse the contents of `reader` to get a `GameData` value.
    pub fn parse_json(reader: impl Read) -> Result<GameData> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Loads the game-data file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<GameData> {
        let path = path.as_ref();

        let file = File::open(path)
            .wrap_err_with(|| format!("When opening game data '{}'", path.display()))?;

        let game_data = GameData::parse_json(file)
            .wrap_err_with(|| format!("When parsing game data '{}'", path.display()))?;

        log::info!(
            "Loaded {} signatures, {} offsets and {} patches from '{}'.",
            game_data.signatures.len(),
            game_data.offsets.len(),
            game_data.patches.len(),
            path.display()
        );

        Ok(game_data)
    }

    /// Returns the signature called `name` for the current platform, along with the module it
    /// should be found in.
    pub fn signature(&self, name: &str) -> Option<(&str, &str)> {
        let entry = self.signatures.get(name)?;
        let pattern = entry.patterns.current()?;

        Some((entry.library.as_str(), pattern.as_str()))
    }

    /// Returns the offset called `name` for the current platform.
    pub fn offset(&self, name: &str) -> Option<usize> {
        self.offsets.get(name)?.current().copied()
    }

    pub fn patch(&self, name: &str) -> Option<&PatchEntry> {
        self.patches.get(name)
    }
}
