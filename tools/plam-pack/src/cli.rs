use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// Packaging tool that assembles, inspects and verifies PLAM containers.
#[derive(Parser, Debug)]
#[command(name = "plam-pack", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format for all subcommands.
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a thin container from a TOML pack manifest.
    Pack(PackArgs),

    /// Combine thin containers into a fat (multi-architecture) container.
    Fat(FatArgs),

    /// Print the header, tables and resources of a container.
    Inspect(InspectArgs),

    /// Check integrity and signature, then link the container in a scratch address space.
    Verify(VerifyArgs),
}

// ── pack ─────────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct PackArgs {
    /// Pack manifest (TOML). Relative input paths resolve against its directory.
    pub manifest: PathBuf,

    /// Output container path.
    #[arg(short, long)]
    pub out: PathBuf,
}

// ── fat ──────────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct FatArgs {
    /// Thin containers, one per architecture.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output container path.
    #[arg(short, long)]
    pub out: PathBuf,

    /// Sub-image alignment as a power of two.
    #[arg(long, default_value_t = 12)]
    pub align_log2: u32,
}

// ── inspect ──────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct InspectArgs {
    /// Container to inspect.
    pub file: PathBuf,

    /// Architecture to select from a fat container.
    #[arg(long, default_value = "x86_64")]
    pub cpu: String,
}

// ── verify ───────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct VerifyArgs {
    /// Container to verify.
    pub file: PathBuf,

    /// Architecture to load for.
    #[arg(long, default_value = "x86_64")]
    pub cpu: String,

    /// Hex-encoded Ed25519 public key to trust (repeatable).
    #[arg(long = "trusted-key")]
    pub trusted_keys: Vec<String>,

    /// Refuse containers without a valid signature.
    #[arg(long)]
    pub require_signature: bool,

    /// Containers to load first so imports and dependencies resolve (repeatable).
    #[arg(long = "with")]
    pub with: Vec<PathBuf>,
}
