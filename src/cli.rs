use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "spectrad",
    version,
    about = r#"
spectrad is the real-time compute back end of an FPGA-based spectrometer.
It captures the digitizer's UDP stream, recovers spectra through a
PFB/FFT/accumulate pipeline, and hands integrated rows to the FITS writer
through a shared-memory ring.

EXAMPLES:
    # Run the supervisor and wait for commands on the control FIFO:
    spectrad serve

    # Start a scan from a shell:
    echo START > /tmp/spectrad_control

    # Look at the live status area:
    spectrad status
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the data-acquisition supervisor.
    Serve(ServeArgs),

    /// Inspect or clear the shared status area.
    Status(StatusArgs),

    /// Inspect or create a shared-memory ring.
    Ring(RingArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path of the command FIFO the manager writes to.
    #[arg(long, default_value = "/tmp/spectrad_control")]
    pub control_fifo: PathBuf,

    /// Status-area instance to attach to.
    #[arg(long, default_value_t = 0)]
    pub instance: u32,

    /// Build the PFB compute context at startup instead of lazily.
    #[arg(short = 'g', long)]
    pub init_gpu: bool,

    /// Emit per-heap diagnostics from the accumulator.
    #[arg(short = 'd', long)]
    pub accumulator_debug: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Status-area instance to attach to.
    #[arg(long, default_value_t = 0)]
    pub instance: u32,

    /// Print only this key's value.
    #[arg(long)]
    pub key: Option<String>,

    /// Reset the buffer to an empty card stream.
    #[arg(long)]
    pub clear: bool,
}

#[derive(Debug, Args)]
pub struct RingArgs {
    /// Ring id (1 = net, 2 = pfb, 3 = disk).
    #[arg(long)]
    pub id: u32,

    /// Create the ring instead of inspecting it.
    #[arg(long)]
    pub create: bool,

    /// Remove the ring's shared memory and semaphores.
    #[arg(long, conflicts_with = "create")]
    pub unlink: bool,

    /// Number of blocks when creating.
    #[arg(long, default_value_t = 8)]
    pub nblock: usize,

    /// Block size in bytes when creating.
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    pub block_size: usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn verify_cli_serve() {
        let opt = Opt::parse_from(["spectrad", "serve", "--instance", "2"]);
        assert!(matches!(opt.action, Action::Serve(args) if args.instance == 2));

        let opt = Opt::parse_from(["spectrad", "ring", "--id", "3", "--create"]);
        assert!(matches!(opt.action, Action::Ring(args) if args.id == 3 && args.create));

        let opt = Opt::parse_from(["spectrad", "status", "--key", "SCANSTAT"]);
        assert!(
            matches!(opt.action, Action::Status(args) if args.key.as_deref() == Some("SCANSTAT"))
        );
    }
}
