use std::process::exit;

use anyhow::Result;
use clap::Parser;

use crate::config::cmd::CmdArgs;
use crate::subcmd::config::ConfigCommand;
use crate::subcmd::join::JoinCommand;
use crate::subcmd::layer::LayerCommand;
use crate::subcmd::prune::PruneCommand;

mod adapter;
mod archive;
mod bundle;
mod compose;
mod config;
mod container;
mod error;
mod init;
mod layer;
mod prune;
mod subcmd;
mod util;

fn main() {
    if let Err(err) = run() {
        log::debug!("{:?}", err);
        exit(1);
    }
}

fn run() -> Result<()> {
    init::init()?;
    match CmdArgs::parse() {
        CmdArgs::Layer(layer_args) => LayerCommand::layer(&layer_args),
        CmdArgs::Config(config_args) => ConfigCommand::config(&config_args),
        CmdArgs::Join(join_args) => JoinCommand::join(&join_args),
        CmdArgs::Prune(prune_args) => PruneCommand::prune(&prune_args),
    }
}
