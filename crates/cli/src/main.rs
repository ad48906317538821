use clap::Parser;

use jobq_cli::{Cli, Context};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = Context::open(cli.storage_dir())?;
    jobq_observability::init(&ctx.config.load().log_level);

    jobq_cli::run(&ctx, cli.command)
}
