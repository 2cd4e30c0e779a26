//! Base-station and device placement, with an on-disk cache keyed by
//! `(nrBS, nrNodes)` so repeated runs over the same topology size reuse
//! positions. Grounded on `placeRandomly` / `placeRandomlyInRange` from the
//! original simulator; the cache format is `serde_json` rather than the
//! original's NumPy `.npy` arrays (no Rust-ecosystem equivalent is worth
//! adopting for this).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::propagation::MaxRangeTable;

const GRID_SIZE: f64 = 10_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPlacement {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePlacement {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub gateways: Vec<GatewayPlacement>,
    pub devices: Vec<DevicePlacement>,
}

fn gateway_cache_path(logdir: &Path, nr_bs: usize, nr_nodes: usize) -> PathBuf {
    logdir.join(format!("bsList_bs{nr_bs}_nodes{nr_nodes}.json"))
}

fn device_cache_path(logdir: &Path, nr_bs: usize, nr_nodes: usize) -> PathBuf {
    logdir.join(format!("nodeList_bs{nr_bs}_nodes{nr_nodes}.json"))
}

/// Uniformly places `count` points within `[x_range] x [y_range]`.
fn place_randomly(rng: &mut impl Rng, count: usize, x_range: (f64, f64), y_range: (f64, f64)) -> Vec<(f64, f64)> {
    (0..count)
        .map(|_| {
            let x = x_range.0 + rng.r#gen::<f64>() * (x_range.1 - x_range.0);
            let y = y_range.0 + rng.r#gen::<f64>() * (y_range.1 - y_range.0);
            (x, y)
        })
        .collect()
}

/// Places devices within six concentric annuli around `reference`, sized
/// by `distribution` (six fractions summing to 1) and bounded by the
/// per-SF max-range table, rejecting and resampling until a point lands in
/// the chosen annulus. `radius` is an absolute, metre-valued global disk
/// cutoff clipping every ring regardless of its own bound — it is ANDed
/// against the per-SF ring bound, not multiplied into it.
fn place_randomly_in_range(
    rng: &mut impl Rng,
    count: usize,
    reference: (f64, f64),
    distribution: &[f64; 6],
    radius: f64,
    max_range: &MaxRangeTable,
) -> Vec<(f64, f64)> {
    let ring_bounds = max_range.distances_at_default_bw();
    let mut points = Vec::with_capacity(count);

    let mut remaining_by_ring: Vec<usize> = distribution
        .iter()
        .map(|frac| (frac * count as f64).round() as usize)
        .collect();
    while remaining_by_ring.iter().sum::<usize>() < count {
        *remaining_by_ring.last_mut().unwrap() += 1;
    }

    for (ring_idx, &n) in remaining_by_ring.iter().enumerate() {
        let ring_inner = if ring_idx == 0 { 0.0 } else { ring_bounds[ring_idx - 1] };
        let ring_outer = ring_bounds[ring_idx];
        let outer = ring_outer.min(radius);
        let inner = ring_inner.min(outer);
        for _ in 0..n {
            loop {
                let angle = rng.r#gen::<f64>() * std::f64::consts::TAU;
                let r = inner + rng.r#gen::<f64>() * (outer - inner).max(0.0);
                let x = reference.0 + r * angle.cos();
                let y = reference.1 + r * angle.sin();
                if x >= 0.0 && x <= GRID_SIZE && y >= 0.0 && y <= GRID_SIZE {
                    points.push((x, y));
                    break;
                }
            }
        }
    }
    points
}

/// Loads the cached topology if present, else generates and persists one.
pub fn load_or_generate(
    logdir: &Path,
    nr_bs: usize,
    nr_nodes: usize,
    distribution: &[f64; 6],
    radius: f64,
    max_range: &MaxRangeTable,
    rng: &mut impl Rng,
) -> Result<Topology> {
    let gw_path = gateway_cache_path(logdir, nr_bs, nr_nodes);
    let dev_path = device_cache_path(logdir, nr_bs, nr_nodes);

    if gw_path.exists() && dev_path.exists() {
        let gw_data = std::fs::read_to_string(&gw_path).context("failed to read gateway topology cache")?;
        let dev_data = std::fs::read_to_string(&dev_path).context("failed to read device topology cache")?;
        let gateways: Vec<GatewayPlacement> =
            serde_json::from_str(&gw_data).context("failed to parse gateway topology cache")?;
        let devices: Vec<DevicePlacement> =
            serde_json::from_str(&dev_data).context("failed to parse device topology cache")?;
        return Ok(Topology { gateways, devices });
    }

    let gateway_points = if nr_bs == 1 {
        vec![(GRID_SIZE * 0.5, GRID_SIZE * 0.5)]
    } else {
        place_randomly(rng, nr_bs, (GRID_SIZE * 0.1, GRID_SIZE * 0.9), (GRID_SIZE * 0.1, GRID_SIZE * 0.9))
    };
    let gateways: Vec<GatewayPlacement> = gateway_points
        .into_iter()
        .enumerate()
        .map(|(i, (x, y))| GatewayPlacement { id: i as u32, x, y })
        .collect();

    let reference = (gateways[0].x, gateways[0].y);
    let device_points = place_randomly_in_range(rng, nr_nodes, reference, distribution, radius, max_range);
    let devices: Vec<DevicePlacement> = device_points
        .into_iter()
        .enumerate()
        .map(|(i, (x, y))| DevicePlacement { id: i as u32, x, y })
        .collect();

    std::fs::create_dir_all(logdir).context("failed to create logdir")?;
    std::fs::write(&gw_path, serde_json::to_string(&gateways)?).context("failed to write gateway topology cache")?;
    std::fs::write(&dev_path, serde_json::to_string(&devices)?).context("failed to write device topology cache")?;

    Ok(Topology { gateways, devices })
}

pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn place_randomly_in_range_stays_within_grid() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let phy = crate::propagation::PhyParams::default();
        let max_range = crate::propagation::max_transmit_distance(14.0, 20, &phy).unwrap();
        let distribution = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let points = place_randomly_in_range(&mut rng, 20, (5000.0, 5000.0), &distribution, GRID_SIZE, &max_range);
        assert_eq!(points.len(), 20);
        for (x, y) in points {
            assert!((0.0..=GRID_SIZE).contains(&x));
            assert!((0.0..=GRID_SIZE).contains(&y));
        }
    }

    #[test]
    fn place_randomly_in_range_respects_absolute_radius_cutoff() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(9);
        let phy = crate::propagation::PhyParams::default();
        let max_range = crate::propagation::max_transmit_distance(14.0, 20, &phy).unwrap();
        let distribution = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let reference = (5000.0, 5000.0);
        let radius = 200.0;
        let points = place_randomly_in_range(&mut rng, 20, reference, &distribution, radius, &max_range);
        for point in points {
            assert!(distance(point, reference) <= radius + 1e-6);
        }
    }
}
