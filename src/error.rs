//! Error kinds for the init and persistence surface.
//!
//! Guest-time faults (invalid opcodes, ROM writes) never reach this type;
//! they bump counters on the CPU and execution continues.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A file on the persistence surface could not be read.
    #[error("cannot read {}", .0.display())]
    IoRead(PathBuf),

    /// A file on the persistence surface could not be written.
    #[error("cannot write {}", .0.display())]
    IoWrite(PathBuf),

    /// Snapshot magic/version mismatch beyond the accepted legacy forms.
    /// The caller falls back to a fresh init.
    #[error("unrecognized snapshot layout")]
    BadSnapshot,

    /// ROM file size is not one of the supported images.
    #[error("unsupported ROM size {0:#x}")]
    BadRomSize(usize),

    /// RAM or port backing could not be obtained.
    #[error("memory allocation failed")]
    AllocFailed,
}

pub type Result<T> = std::result::Result<T, Error>;
