//! `jobq` command-line wiring.
//!
//! - `args.rs`: clap definitions
//! - `commands.rs`: one handler per subcommand, plain-text output

pub mod args;
pub mod commands;

pub use args::{Cli, Command};
pub use commands::{Context, run};
