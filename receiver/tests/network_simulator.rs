//! Network simulator for testing resilience.
//!
//! Applies packet loss, jitter and reordering to datagrams on a virtual
//! microsecond timeline, so tests stay deterministic and never sleep.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Network simulator configuration.
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulatorConfig {
    // ---
    /// Packet loss rate (0.0 to 1.0)
    pub loss_rate: f64,

    /// Extra delay drawn uniformly from `0..=2 × jitter_us`
    pub jitter_us: u64,

    /// Rate of packets pushed ahead of earlier ones (0.0 to 1.0)
    pub reorder_rate: f64,

    /// Random seed for deterministic testing
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    datagram: Vec<u8>,
    deliver_at_us: u64,
}

/// Simulates network conditions between a sender and the receive path.
pub struct NetworkSimulator {
    // ---
    config: NetworkSimulatorConfig,
    rng: StdRng,
    in_flight: Vec<InFlight>,
    packets_sent: u64,
    packets_lost: u64,
    packets_reordered: u64,
}

impl NetworkSimulator {
    // ---
    pub fn new(config: NetworkSimulatorConfig) -> Self {
        // ---
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            in_flight: Vec::new(),
            packets_sent: 0,
            packets_lost: 0,
            packets_reordered: 0,
        }
    }

    /// Sends a datagram at virtual time `now_us`; it may be dropped or delayed.
    pub fn send(&mut self, datagram: Vec<u8>, now_us: u64) {
        // ---
        self.packets_sent += 1;

        if self.rng.gen_bool(self.config.loss_rate) {
            self.packets_lost += 1;
            return;
        }

        let jitter = if self.config.jitter_us == 0 {
            0
        } else {
            self.rng.gen_range(0..=2 * self.config.jitter_us)
        };
        let mut deliver_at_us = now_us + jitter;

        // Reordering: overtake the earliest packet still in flight
        if self.rng.gen_bool(self.config.reorder_rate) {
            if let Some(earliest) = self.in_flight.iter().map(|p| p.deliver_at_us).min() {
                if earliest > now_us {
                    deliver_at_us = earliest - 1;
                    self.packets_reordered += 1;
                }
            }
        }

        self.in_flight.push(InFlight {
            datagram,
            deliver_at_us,
        });
    }

    /// Every datagram due at or before `now_us`, in delivery order.
    pub fn receive(&mut self, now_us: u64) -> Vec<Vec<u8>> {
        // ---
        self.in_flight.sort_by_key(|p| p.deliver_at_us);
        let due = self.in_flight.partition_point(|p| p.deliver_at_us <= now_us);
        self.in_flight.drain(..due).map(|p| p.datagram).collect()
    }

    pub fn in_flight(&self) -> usize {
        // ---
        self.in_flight.len()
    }

    pub fn stats(&self) -> NetworkSimulatorStats {
        // ---
        NetworkSimulatorStats {
            packets_sent: self.packets_sent,
            packets_lost: self.packets_lost,
            packets_reordered: self.packets_reordered,
            loss_rate: if self.packets_sent > 0 {
                self.packets_lost as f64 / self.packets_sent as f64
            } else {
                0.0
            },
        }
    }
}

/// Network simulator statistics.
#[derive(Debug, Clone)]
pub struct NetworkSimulatorStats {
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub loss_rate: f64,
}
