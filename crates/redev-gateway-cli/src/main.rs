use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = redev_gateway_cli::Cli::parse();
    redev_gateway_cli::run_cli(cli)
}
