//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tripcache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Log filter, e.g. info or tripcache=debug")]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "check", about = "Validate a configuration file and print resolved settings")]
    Check(CheckArgs),

    #[command(name = "simulate", about = "Drive the realtime throttler with an in-process feed")]
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(short, long, help = "Path to the TOML configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "Output in JSON format")]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct SimulateArgs {
    #[arg(short, long, help = "Optional TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "trips", help = "Table the events are published on")]
    pub table: String,

    #[arg(short, long, default_value_t = 50, help = "Number of change events to publish")]
    pub events: u32,

    #[arg(long, default_value_t = 10, help = "Number of distinct record ids")]
    pub records: u32,

    #[arg(long, default_value_t = 200, help = "Window the events are spread over (ms)")]
    pub window_ms: u64,

    #[arg(short, long, help = "Explicit throttle for the subscription (ms)")]
    pub throttle_ms: Option<u64>,

    #[arg(short, long, help = "Print Prometheus metrics after the run")]
    pub prometheus: bool,
}

mod check;
mod simulate;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::telemetry::init_tracing("tripcache", cli.log.as_deref());

    match &cli.command {
        Commands::Check(args) => check::execute(args).await,
        Commands::Simulate(args) => simulate::execute(args).await,
    }
}
