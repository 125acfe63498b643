//! Byte patches from the game-data file, such as `ServerMovementUnlock`. Each patch is its own
//! fix, so one that no longer matches the binary doesn't stop the others.

use eyre::{Context as _, Result};

use crate::{
    error::FixError,
    game::{Context, Fix},
    host::Memory,
    resolver::Pattern,
};

/// Bytes we wrote over, so they can be put back.
struct Applied {
    address: usize,
    original: Vec<u8>,
}

pub struct PatchFix {
    patch: String,
    name: String,
    applied: Option<Applied>,
}

impl PatchFix {
    pub fn new(patch: &str) -> PatchFix {
        PatchFix {
            patch: patch.to_string(),
            name: format!("GameDataPatch:{patch}"),
            applied: None,
        }
    }

    fn fail(&self, reason: impl Into<String>) -> FixError {
        FixError::Patch {
            name: self.patch.clone(),
            reason: reason.into(),
        }
    }

    fn apply(&self, context: &Context) -> Result<Applied> {
        let entry = context
            .game_data
            .patch(&self.patch)
            .ok_or_else(|| self.fail("not in game data"))?;

        let bytes = entry
            .bytes
            .current()
            .ok_or_else(|| self.fail("no bytes for this platform"))?;

        let bytes = bytes
            .parse::<Pattern>()
            .map_err(|err| self.fail(err))?
            .exact_bytes()
            .ok_or_else(|| self.fail("patch bytes can't contain wildcards"))?;

        let offset = entry.offset.current().copied().unwrap_or(0);

        let found = context
            .resolver()
            .scan(&entry.signature)
            .wrap_err_with(|| format!("When locating patch '{}'", self.patch))?;

        let address = found
            .checked_add_signed(offset)
            .ok_or_else(|| self.fail(format!("offset {offset} from {found:#x} overflows")))?;

        write(&*context.memory, address, &bytes)
            .map_err(|err| self.fail(format!("{err:#}")).into())
    }
}

/// Writes `bytes` at `address` and returns what was there before.
fn write(memory: &dyn Memory, address: usize, bytes: &[u8]) -> Result<Applied> {
    let original = memory
        .read_bytes(address, bytes.len())
        .ok_or_else(|| eyre::format_err!("{address:#x} is unreadable"))?;

    memory.write_bytes(address, bytes)?;

    Ok(Applied { address, original })
}

impl Fix for PatchFix {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&mut self, context: &Context) -> Result<()> {
        if self.applied.is_some() {
            return Ok(());
        }

        let applied = self.apply(context)?;

        log::info!(
            "Applied patch '{}' at {:#x} ({} bytes).",
            self.patch,
            applied.address,
            applied.original.len()
        );

        self.applied = Some(applied);
        Ok(())
    }

    fn uninstall(&mut self, context: &Context) {
        let applied = match self.applied.take() {
            Some(applied) => applied,
            None => return,
        };

        match context
            .memory
            .write_bytes(applied.address, &applied.original)
        {
            Ok(()) => log::info!("Restored patch '{}'.", self.patch),
            Err(err) => log::error!("Unable to restore patch '{}': {err:?}", self.patch),
        }
    }
}
