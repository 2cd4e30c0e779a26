//! # LoRa Bandit Simulator - Main Entry Point
//!
//! Entry point for a discrete-event simulator of an uplink LoRa-style
//! network in which devices learn transmission settings (spreading factor,
//! frequency, power) via the EXP3 / EXP3-S adversarial bandit algorithms.
//!
//! ## Architecture Overview
//!
//! The whole simulation runs cooperatively on a single OS thread: a custom
//! `embassy_time_driver::Driver` (`time_driver`) maps the virtual simulated
//! clock onto an `embassy_executor::Executor`, so every device's
//! transmit/listen/ack cycle, and every periodic trace task, is an `async
//! fn` suspended on `Timer::after` rather than a real-time sleep. There is
//! no GUI and no second thread; this is a batch CLI tool.
//!
//! ## Exit codes
//!
//! - `0`: simulation reached its horizon and wrote its trace files.
//! - `2`: configuration or setup error (invalid CLI arguments, unusable
//!   topology cache, I/O failure) — the offending condition is logged
//!   before exit.

use std::process::ExitCode;

use clap::Parser;
use log::error;

mod cli;
mod device;
mod error;
mod gateway;
mod packet;
mod propagation;
mod scheduler;
mod time_driver;
mod topology;
mod trace;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Args::parse();

    match scheduler::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("simulation failed: {err:#}");
            ExitCode::from(2)
        }
    }
}
