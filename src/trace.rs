//! CSV trace writers for the persisted state layout of SPEC_FULL.md §6.
//! Files are append-only, one line per 100-hour snapshot, space- or
//! comma-separated with no header row (so "one line per snapshot" holds
//! exactly, matching the original's raw-append format).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct TraceWriters {
    dir: PathBuf,
    key: String,
}

impl TraceWriters {
    pub fn new(dir: PathBuf, key: String) -> Result<Self> {
        std::fs::create_dir_all(&dir).context("failed to create trace output directory")?;
        Ok(TraceWriters { dir, key })
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open trace file {path:?}"))?;
        if exists {
            writeln!(file)?;
        }
        write!(file, "{line}").with_context(|| format!("failed to write trace file {path:?}"))?;
        Ok(())
    }

    pub fn write_prob(&self, device_id: u32, prob: &[f64]) -> Result<()> {
        let path = self.dir.join(format!("prob_{}_id_{device_id}.csv", self.key));
        let line: Vec<String> = prob.iter().map(|p| p.to_string()).collect();
        self.append_line(&path, &line.join(","))
    }

    pub fn write_ratio(&self, ratio: f64) -> Result<()> {
        let path = self.dir.join(format!("ratio_{}.csv", self.key));
        self.append_line(&path, &ratio.to_string())
    }

    pub fn write_energy(&self, total_energy_j: f64, n_transmitted: u64, n_received: u64) -> Result<()> {
        let path = self.dir.join(format!("energy_{}.csv", self.key));
        self.append_line(&path, &format!("{total_energy_j} {n_transmitted} {n_received}"))
    }

    pub fn write_traffic(&self, offered_load: f64, throughput: f64) -> Result<()> {
        let path = self.dir.join(format!("traffic_{}.csv", self.key));
        self.append_line(&path, &format!("{offered_load} {throughput}"))
    }
}

/// Packet-reception ratio, reporting 0 rather than dividing by zero when no
/// transmissions have occurred yet.
pub fn reception_ratio(n_transmitted: u64, n_received: u64) -> f64 {
    if n_transmitted == 0 {
        0.0
    } else {
        n_received as f64 / n_transmitted as f64
    }
}

/// Canonical experiment key: `<nrIntNodes>_smartNodes_initial_<initial>_infoMode_<mode>_captureEffect_<b>_interSFMode_<b>`.
pub fn experiment_key(
    nr_int_nodes: usize,
    initial: &str,
    info_mode: &str,
    capture_effect: bool,
    inter_sf_interference: bool,
) -> String {
    format!(
        "{nr_int_nodes}_smartNodes_initial_{initial}_infoMode_{info_mode}_captureEffect_{capture_effect}_interSFMode_{inter_sf_interference}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reception_ratio_handles_zero_transmissions() {
        assert_eq!(reception_ratio(0, 0), 0.0);
    }

    #[test]
    fn experiment_key_matches_canonical_format() {
        let key = experiment_key(5, "UNIFORM", "NO", true, false);
        assert_eq!(key, "5_smartNodes_initial_UNIFORM_infoMode_NO_captureEffect_true_interSFMode_false");
    }
}
