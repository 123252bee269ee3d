/*
 * SPDX-FileCopyrightText: 2024 vbsign contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::sign;

#[derive(Debug, Subcommand)]
pub enum Command {
    Sign(sign::SignCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Sign(c) => sign::sign_main(&c),
    }
}
