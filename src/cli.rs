//! Command-line surface. Grounded on `frog_cli::run_sim::Args`'s derive
//! style and `ExitCode`-returning `main()`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::device::{Algorithm, InfoMode, InitialMode};
use crate::error::SimError;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum InitialArg {
    Uniform,
    Random,
}

impl From<InitialArg> for InitialMode {
    fn from(value: InitialArg) -> Self {
        match value {
            InitialArg::Uniform => InitialMode::Uniform,
            InitialArg::Random => InitialMode::Random,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum InfoModeArg {
    No,
    Partial,
    Full,
}

impl From<InfoModeArg> for InfoMode {
    fn from(value: InfoModeArg) -> Self {
        match value {
            InfoModeArg::No => InfoMode::No,
            InfoModeArg::Partial => InfoMode::Partial,
            InfoModeArg::Full => InfoMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AlgoArg {
    Exp3,
    Exp3s,
}

impl From<AlgoArg> for Algorithm {
    fn from(value: AlgoArg) -> Self {
        match value {
            AlgoArg::Exp3 => Algorithm::Exp3,
            AlgoArg::Exp3s => Algorithm::Exp3S,
        }
    }
}

/// A discrete-event simulator for an uplink LoRa-style network of
/// bandit-learning devices.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long)]
    pub nr_nodes: usize,

    #[arg(long)]
    pub nr_int_nodes: usize,

    #[arg(long)]
    pub nr_bs: usize,

    #[arg(long, value_enum)]
    pub initial: InitialArg,

    /// Absolute global disk cutoff, in metres, clipping every SF ring
    /// around the reference gateway regardless of its own bound.
    #[arg(long)]
    pub radius: f64,

    /// Six comma-separated floats summing to 1.
    #[arg(long, value_delimiter = ',')]
    pub distribution: Vec<f64>,

    #[arg(long)]
    pub avg_send_time: f64,

    #[arg(long)]
    pub horizon_time: f64,

    #[arg(long)]
    pub packet_length: u32,

    #[arg(long, value_delimiter = ',')]
    pub freq_set: Vec<u32>,

    #[arg(long, value_delimiter = ',')]
    pub sf_set: Vec<u8>,

    #[arg(long, value_delimiter = ',')]
    pub power_set: Vec<f64>,

    #[arg(long)]
    pub capture_effect: bool,

    #[arg(long)]
    pub inter_sf_interference: bool,

    #[arg(long, value_enum)]
    pub info_mode: InfoModeArg,

    #[arg(long, value_enum)]
    pub algo: AlgoArg,

    #[arg(long)]
    pub logdir: PathBuf,

    #[arg(long)]
    pub exp_name: String,

    /// Seed for the shared RNG stream. A random seed is drawn if omitted
    /// (and logged, for later reproduction).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Overrides the probability-clamp epsilon (default: algorithm-keyed,
    /// see DESIGN.md's resolution of the clamp-threshold open question).
    #[arg(long)]
    pub clamp_threshold: Option<f64>,
}

impl Args {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.nr_int_nodes > self.nr_nodes {
            return Err(SimError::InvalidConfig(
                "nr_int_nodes must not exceed nr_nodes".into(),
            ));
        }
        if self.nr_bs == 0 {
            return Err(SimError::InvalidConfig("nr_bs must be at least 1".into()));
        }
        if self.distribution.len() != 6 {
            return Err(SimError::InvalidConfig(
                "distribution must have exactly six entries".into(),
            ));
        }
        let sum: f64 = self.distribution.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(SimError::InvalidConfig(format!(
                "distribution entries must sum to 1, got {sum}"
            )));
        }
        if self.sf_set.is_empty() || self.sf_set.iter().any(|&sf| !(7..=12).contains(&sf)) {
            return Err(SimError::InvalidConfig(
                "sf_set entries must be spreading factors in 7..=12".into(),
            ));
        }
        if self.freq_set.is_empty() {
            return Err(SimError::InvalidConfig("freq_set must not be empty".into()));
        }
        if self.power_set.is_empty() {
            return Err(SimError::InvalidConfig("power_set must not be empty".into()));
        }
        if self.avg_send_time <= 0.0 || self.horizon_time <= 0.0 {
            return Err(SimError::InvalidConfig(
                "avg_send_time and horizon_time must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn distribution_array(&self) -> [f64; 6] {
        let mut out = [0.0; 6];
        out.copy_from_slice(&self.distribution[..6]);
        out
    }

    pub fn clamp_threshold_or_default(&self) -> f64 {
        // Newer EXP3/EXP3-S path defaults to 0.0005; see DESIGN.md.
        self.clamp_threshold.unwrap_or(0.0005)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            nr_nodes: 10,
            nr_int_nodes: 5,
            nr_bs: 1,
            initial: InitialArg::Uniform,
            radius: 1.0,
            distribution: vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            avg_send_time: 60_000.0,
            horizon_time: 100.0,
            packet_length: 20,
            freq_set: vec![868_100],
            sf_set: vec![7],
            power_set: vec![14.0],
            capture_effect: true,
            inter_sf_interference: true,
            info_mode: InfoModeArg::No,
            algo: AlgoArg::Exp3,
            logdir: PathBuf::from("/tmp/lora-sim-test"),
            exp_name: "test".into(),
            seed: Some(1),
            clamp_threshold: None,
        }
    }

    #[test]
    fn rejects_distribution_not_summing_to_one() {
        let mut args = base_args();
        args.distribution = vec![0.5, 0.5, 0.5, 0.0, 0.0, 0.0];
        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_nr_int_nodes_exceeding_nr_nodes() {
        let mut args = base_args();
        args.nr_int_nodes = 20;
        assert!(args.validate().is_err());
    }

    #[test]
    fn accepts_valid_args() {
        assert!(base_args().validate().is_ok());
    }
}
