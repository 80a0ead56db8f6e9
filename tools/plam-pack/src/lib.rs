//! Packaging tool for PLAM containers.
//!
//! The binary is a thin shell over these modules so the tests can drive
//! each command without spawning a process.

pub mod cli;
pub mod error;
pub mod inspect;
pub mod manifest;
pub mod output;
pub mod pack;

use crate::cli::Command;
use crate::error::PackError;

/// Dispatch a parsed command to its handler.
pub fn run(command: Command) -> Result<serde_json::Value, PackError> {
    match command {
        Command::Pack(args) => pack::pack(args),
        Command::Fat(args) => pack::fat(args),
        Command::Inspect(args) => inspect::inspect(args),
        Command::Verify(args) => inspect::verify(args),
    }
}
