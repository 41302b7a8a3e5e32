mod cli;
mod host;
mod html;
mod server;
mod service;
mod store;

use clap::Parser;

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Settings { config }) => cli::print_settings(config),
        None => service::serve(cli.serve.try_into()?),
    }
}
