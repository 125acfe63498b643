//! Failure kinds shared by the resolver, the interception registry and the fixes.
//!
//! Everything is propagated as `eyre::Result`; these variants are what ends up inside the report
//! when the failure has a meaning callers care about (a missing signature is not the same thing
//! as a pawn that disappeared between two reads).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixError {
    /// A signature, offset or vtable could not be found for the running build.
    #[error("unable to resolve '{name}': {reason}")]
    Resolution { name: String, reason: String },

    /// A field was read on an entity that has since been destroyed.
    #[error("entity {address:#x} is no longer valid")]
    TransientState { address: usize },

    /// A mandatory interception point for a fix could not be created.
    #[error("unable to install {fix}: {reason}")]
    FatalInstall { fix: String, reason: String },

    /// The interception point already has a diversion attached.
    #[error("'{name}' is already diverted")]
    AlreadyDiverted { name: String },

    /// A game-data byte patch could not be written or restored.
    #[error("patch '{name}' failed: {reason}")]
    Patch { name: String, reason: String },
}

impl FixError {
    pub fn resolution(name: impl Into<String>, reason: impl Into<String>) -> FixError {
        FixError::Resolution {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(fix: impl Into<String>, reason: impl std::fmt::Display) -> FixError {
        FixError::FatalInstall {
            fix: fix.into(),
            reason: reason.to_string(),
        }
    }
}
