//! `Packet`: the value object carrying one transmission attempt's chosen
//! action and resulting received-power contribution from one device to one
//! gateway.

use crate::propagation::{self, PhyParams};

/// One point in the device's action space: spreading factor, carrier
/// frequency and transmit power. Bandwidth is not part of the action space
/// (see `propagation::BW_KHZ`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Action {
    pub sf: u8,
    pub freq: u32,
    pub power_dbm: f64,
}

/// Builds the action set in the required lexicographic order: SF outermost,
/// then frequency, then power, stride in SF fastest (Testable Property 8).
pub fn build_action_set(sf_set: &[u8], freq_set: &[u32], power_set: &[f64]) -> Vec<Action> {
    let mut actions = Vec::with_capacity(sf_set.len() * freq_set.len() * power_set.len());
    for &sf in sf_set {
        for &freq in freq_set {
            for &power_dbm in power_set {
                actions.push(Action { sf, freq, power_dbm });
            }
        }
    }
    actions
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub device_id: u32,
    pub gateway_id: u32,
    pub distance_m: f64,
    pub payload_len: u32,
    pub phy: PhyParams,

    pub chosen: Action,
    pub chosen_index: usize,
    pub rx_dbm: f64,
    pub airtime_ms: f64,

    pub is_lost: bool,
    pub is_critical: bool,
    pub is_collision: bool,
}

impl Packet {
    pub fn new(device_id: u32, gateway_id: u32, distance_m: f64, payload_len: u32) -> Self {
        Packet {
            device_id,
            gateway_id,
            distance_m,
            payload_len,
            phy: PhyParams::default(),
            chosen: Action { sf: 0, freq: 0, power_dbm: 0.0 },
            chosen_index: 0,
            rx_dbm: f64::NEG_INFINITY,
            airtime_ms: 0.0,
            is_lost: true,
            is_critical: false,
            is_collision: false,
        }
    }

    /// `updateTXSettings`: applies a freshly-sampled action, recomputes
    /// received power and airtime, and resets the per-attempt flags.
    pub fn update_tx_settings(&mut self, chosen_index: usize, action: Action) {
        self.chosen_index = chosen_index;
        self.chosen = action;
        self.rx_dbm = propagation::rx_power_dbm(action.power_dbm, self.distance_m);
        self.airtime_ms =
            propagation::airtime_ms(action.sf, propagation::BW_KHZ, self.payload_len, &self.phy);
        self.is_lost =
            self.rx_dbm < propagation::sensitivity_dbm(action.sf, propagation::BW_KHZ);
        self.is_critical = false;
        self.is_collision = false;
    }

    pub fn power_mw(&self) -> f64 {
        propagation::dbm_to_mw(self.rx_dbm)
    }

    pub fn bucket(&self) -> u32 {
        propagation::bucket_for(self.chosen.freq)
    }

    /// Slot `SF - 7` within the bucket's 6-entry per-SF power vector.
    pub fn sf_slot(&self) -> usize {
        (self.chosen.sf - 7) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_set_enumerates_lexicographically() {
        let sf = [7u8, 8];
        let freq = [868_100u32, 868_300];
        let pow = [14.0, 11.0];
        let actions = build_action_set(&sf, &freq, &pow);
        assert_eq!(actions.len(), 8);
        assert_eq!(actions[0], Action { sf: 7, freq: 868_100, power_dbm: 14.0 });
        assert_eq!(actions[1], Action { sf: 7, freq: 868_100, power_dbm: 11.0 });
        assert_eq!(actions[2], Action { sf: 7, freq: 868_300, power_dbm: 14.0 });
        assert_eq!(actions[4], Action { sf: 8, freq: 868_100, power_dbm: 14.0 });
    }

    #[test]
    fn update_tx_settings_marks_lost_when_below_sensitivity() {
        let mut pkt = Packet::new(0, 0, 1_000_000.0, 20);
        pkt.update_tx_settings(0, Action { sf: 7, freq: 868_100, power_dbm: 2.0 });
        assert!(pkt.is_lost);
    }
}
