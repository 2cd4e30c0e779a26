//! `Device`: stateful transmitter owning the EXP3 / EXP3-S bandit state.

use std::collections::HashMap;

use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::packet::{build_action_set, Action, Packet};
use crate::propagation::{self, MaxRangeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Uniform,
    Random,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoMode {
    No,
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Exp3,
    Exp3S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialMode {
    Uniform,
    Random,
}

pub struct DeviceConfig<'a> {
    pub id: u32,
    pub position: (f64, f64),
    pub mode: DeviceMode,
    pub info_mode: InfoMode,
    pub initial: InitialMode,
    pub period_ms: f64,
    pub sf_set: &'a [u8],
    pub freq_set: &'a [u32],
    pub power_set: &'a [f64],
    pub gateways: Vec<(u32, f64)>,
    pub horizon: f64,
    pub algo: Algorithm,
    pub clamp_threshold: f64,
    pub max_range: &'a MaxRangeTable,
    pub payload_len: u32,
}

pub struct Device {
    pub id: u32,
    pub position: (f64, f64),
    pub mode: DeviceMode,
    pub info_mode: InfoMode,
    pub period_ms: f64,
    pub actions: Vec<Action>,
    pub weight: Vec<f64>,
    pub prob: Vec<f64>,
    pub learning_rate: f64,
    pub mixing_alpha: f64,
    pub clamp_threshold: f64,

    pub packets_transmitted: u64,
    pub packets_successful: u64,
    pub cumulative_airtime_ms: f64,
    pub cumulative_energy_j: f64,

    pub gateways: Vec<(u32, f64)>,
    pub packets: HashMap<u32, Packet>,
    pub last_acks: HashMap<u32, bool>,

    pub chosen_index: usize,
}

/// Restricts `sfSet` to spreading factors whose max range (at the default
/// bandwidth) covers `distance_to_gateway` — the "SF hopping from distance"
/// rule used under PARTIAL/FULL information. The distance passed in is
/// always to gateway id 0 specifically (`proximateBS[0]` in the original),
/// not the nearest proximate gateway.
fn restrict_sf_by_distance(sf_set: &[u8], distance_to_gateway: f64, max_range: &MaxRangeTable) -> Vec<u8> {
    let distances = max_range.distances_at_default_bw();
    let min_sf = (0..6u8)
        .find(|&idx| distance_to_gateway <= distances[idx as usize])
        .map(|idx| 7 + idx)
        .unwrap_or(13);
    sf_set.iter().copied().filter(|&sf| sf >= min_sf).collect()
}

fn sample_dirichlet_uniform(rng: &mut impl Rng, n: usize) -> Vec<f64> {
    let v: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
    let sum: f64 = v.iter().sum();
    v.into_iter().map(|x| x / sum).collect()
}

pub fn sample_categorical(rng: &mut impl Rng, prob: &[f64]) -> usize {
    let u: f64 = rng.r#gen();
    let mut acc = 0.0;
    for (i, &p) in prob.iter().enumerate() {
        acc += p;
        if u <= acc {
            return i;
        }
    }
    prob.len() - 1
}

/// Samples `Exp(1/period_ms)` — the device's inter-arrival time in ms.
pub fn sample_interarrival_ms(rng: &mut impl Rng, period_ms: f64) -> f64 {
    let exp = Exp::new(1.0 / period_ms).expect("period must be positive");
    exp.sample(rng)
}

impl Device {
    pub fn new(cfg: DeviceConfig, rng: &mut impl Rng) -> Self {
        let sf_set: Vec<u8> = match cfg.info_mode {
            InfoMode::No => cfg.sf_set.to_vec(),
            InfoMode::Partial | InfoMode::Full => {
                match cfg.gateways.iter().find(|(id, _)| *id == 0) {
                    Some(&(_, dist)) => restrict_sf_by_distance(cfg.sf_set, dist, cfg.max_range),
                    None => cfg.sf_set.to_vec(),
                }
            }
        };
        let sf_set = if sf_set.is_empty() { cfg.sf_set.to_vec() } else { sf_set };

        let actions = build_action_set(&sf_set, cfg.freq_set, cfg.power_set);
        let n = actions.len();

        let (learning_rate, mixing_alpha) = match cfg.algo {
            Algorithm::Exp3 => {
                let eta = (1.0_f64).min(
                    ((n as f64 * (n as f64).ln()) / (cfg.horizon * (std::f64::consts::E - 1.0)))
                        .sqrt(),
                );
                (eta, 0.0)
            }
            Algorithm::Exp3S => {
                let eta = (1.0_f64)
                    .min(((n as f64 * (n as f64 * cfg.horizon).ln()) / cfg.horizon).sqrt());
                (eta, 1.0 / cfg.horizon)
            }
        };

        let prob = match cfg.initial {
            InitialMode::Uniform => vec![1.0 / n as f64; n],
            InitialMode::Random => sample_dirichlet_uniform(rng, n),
        };

        let mut packets = HashMap::new();
        for &(gw_id, dist) in &cfg.gateways {
            packets.insert(gw_id, Packet::new(cfg.id, gw_id, dist, cfg.payload_len));
        }

        Device {
            id: cfg.id,
            position: cfg.position,
            mode: cfg.mode,
            info_mode: cfg.info_mode,
            period_ms: cfg.period_ms,
            actions,
            weight: vec![1.0; n],
            prob,
            learning_rate,
            mixing_alpha,
            clamp_threshold: cfg.clamp_threshold,
            packets_transmitted: 0,
            packets_successful: 0,
            cumulative_airtime_ms: 0.0,
            cumulative_energy_j: 0.0,
            gateways: cfg.gateways,
            packets,
            last_acks: HashMap::new(),
            chosen_index: 0,
        }
    }

    pub fn reset_acks(&mut self) {
        self.last_acks.clear();
    }

    pub fn record_ack(&mut self, gateway_id: u32, is_collision: bool) {
        self.last_acks.insert(gateway_id, is_collision);
    }

    /// Whether the most recently completed transmission counts as a success
    /// under the device's information mode.
    pub fn is_success(&self) -> bool {
        if self.last_acks.is_empty() {
            return false;
        }
        match self.info_mode {
            InfoMode::No | InfoMode::Partial => true,
            InfoMode::Full => self.last_acks.values().any(|&collided| !collided),
        }
    }

    pub fn account_energy(&mut self, airtime_ms: f64, tx_power_dbm: f64) {
        self.cumulative_energy_j += (airtime_ms / 1000.0) * propagation::dbm_to_mw(tx_power_dbm) * 3.0;
    }

    /// `updateProb`: forms the reward vector, updates weights, projects
    /// probabilities, and applies the clamp-and-renormalise step.
    pub fn update_bandit(&mut self, algo: Algorithm, rng: &mut impl Rng) {
        let n = self.actions.len();

        match self.mode {
            DeviceMode::Uniform => {
                self.prob = vec![1.0 / n as f64; n];
                return;
            }
            DeviceMode::Random => {
                self.prob = sample_dirichlet_uniform(rng, n);
                return;
            }
            DeviceMode::Smart => {}
        }

        let a = self.chosen_index;
        let r_a = match self.info_mode {
            InfoMode::No | InfoMode::Partial => {
                if !self.last_acks.is_empty() { 1.0 / self.prob[a] } else { 0.0 }
            }
            InfoMode::Full => {
                if self.last_acks.is_empty() {
                    0.0
                } else if self.last_acks.values().any(|&collided| !collided) {
                    1.0 / self.prob[a]
                } else {
                    0.5 / self.prob[a]
                }
            }
        };

        let sum_w_before: f64 = self.weight.iter().sum();
        let eta = self.learning_rate;
        let alpha = self.mixing_alpha;

        for j in 0..n {
            let r_j = if j == a { r_a } else { 0.0 };
            let updated = self.weight[j] * (eta * r_j / n as f64).exp();
            self.weight[j] = match algo {
                Algorithm::Exp3 => updated,
                Algorithm::Exp3S => {
                    updated + (std::f64::consts::E * alpha / n as f64) * sum_w_before
                }
            };
        }

        let max_w = self.weight.iter().cloned().fold(f64::MIN, f64::max);
        if max_w > 1e100 {
            let sum_w: f64 = self.weight.iter().sum();
            for w in self.weight.iter_mut() {
                *w /= sum_w;
            }
        }

        let sum_w: f64 = self.weight.iter().sum();
        for j in 0..n {
            self.prob[j] = (1.0 - eta) * (self.weight[j] / sum_w) + eta / n as f64;
        }

        for p in self.prob.iter_mut() {
            if *p < self.clamp_threshold {
                *p = 0.0;
            }
        }
        let sum_p: f64 = self.prob.iter().sum();
        for p in self.prob.iter_mut() {
            *p /= sum_p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::propagation::max_transmit_distance;

    fn table() -> MaxRangeTable {
        max_transmit_distance(14.0, 20, &propagation::PhyParams::default()).unwrap()
    }

    fn make_device(mode: DeviceMode, info_mode: InfoMode, algo: Algorithm) -> Device {
        let table = table();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let cfg = DeviceConfig {
            id: 0,
            position: (0.0, 0.0),
            mode,
            info_mode,
            initial: InitialMode::Uniform,
            period_ms: 60_000.0,
            sf_set: &[7, 8],
            freq_set: &[868_100],
            power_set: &[14.0],
            gateways: vec![(0, 500.0)],
            horizon: 1000.0,
            algo,
            clamp_threshold: 0.0005,
            max_range: &table,
            payload_len: 20,
        };
        Device::new(cfg, &mut rng)
    }

    use rand::SeedableRng;

    #[test]
    fn uniform_device_prob_never_drifts() {
        let mut device = make_device(DeviceMode::Uniform, InfoMode::No, Algorithm::Exp3);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(2);
        device.chosen_index = 0;
        device.record_ack(0, false);
        device.update_bandit(Algorithm::Exp3, &mut rng);
        let expected = 1.0 / device.actions.len() as f64;
        for p in &device.prob {
            assert!((p - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn probabilities_sum_to_one_after_update() {
        let mut device = make_device(DeviceMode::Smart, InfoMode::No, Algorithm::Exp3);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        device.chosen_index = 0;
        device.record_ack(0, false);
        device.update_bandit(Algorithm::Exp3, &mut rng);
        let sum: f64 = device.prob.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        assert!(device.prob.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn full_info_half_update_on_collision() {
        let mut device = make_device(DeviceMode::Smart, InfoMode::Full, Algorithm::Exp3);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(4);
        device.chosen_index = 0;
        device.record_ack(0, true);
        let before = device.weight[0];
        device.update_bandit(Algorithm::Exp3, &mut rng);
        assert!(device.weight[0] > before);
    }

    #[test]
    fn action_enumeration_is_stable_under_no_info_restriction() {
        let device = make_device(DeviceMode::Smart, InfoMode::No, Algorithm::Exp3);
        assert_eq!(device.actions.len(), 2);
    }

    #[test]
    fn sf_restriction_keys_off_gateway_zero_not_the_nearest() {
        let table = table();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        // Gateway 0 is far enough it only satisfies SF12's range; gateway 5 is
        // close enough to admit every SF. The original keys the restriction to
        // gateway 0 specifically (`proximateBS[0]`), so the nearby gateway 5
        // must not relax the restriction.
        let cfg = DeviceConfig {
            id: 0,
            position: (0.0, 0.0),
            mode: DeviceMode::Smart,
            info_mode: InfoMode::Full,
            initial: InitialMode::Uniform,
            period_ms: 60_000.0,
            sf_set: &[7, 8, 9, 10, 11, 12],
            freq_set: &[868_100],
            power_set: &[14.0],
            gateways: vec![(0, 4200.0), (5, 50.0)],
            horizon: 1000.0,
            algo: Algorithm::Exp3,
            clamp_threshold: 0.0005,
            max_range: &table,
            payload_len: 20,
        };
        let device = Device::new(cfg, &mut rng);
        let sf_set: Vec<u8> = device.actions.iter().map(|a| a.sf).collect();
        assert!(sf_set.iter().all(|&sf| sf == 12), "gateway 5's short distance must not leak into the restriction");
    }
}
