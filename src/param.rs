//! Latency parameters and samplers for the simulated network.
//!
//! All delays are integer microseconds. Propagation and per-packet
//! processing latencies are drawn from clamped Gaussians so a run shows
//! realistic jitter while staying inside hard bounds the tests can rely on;
//! transmission delay is a deterministic function of wire length over a
//! 10 Gbps link. Every draw takes the caller's seeded generator, so a run
//! is reproducible end to end.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::Time;

/// Ready-queue capacity of a drop-tail node, in messages.
pub const NODE_MSG_QUEUE_LENGTH: usize = 1024;

/// Median one-hop propagation delay.
pub const MED_PROPG_DELAY: Time = 50;
/// Standard deviation of the propagation delay.
pub const PROPG_DELAY_SD: f64 = 2.5;
/// Propagation delay clamped below at median - 2 sigma.
pub const MIN_PROPG_DELAY: Time = 45;
/// Propagation delay clamped above at median + 2 sigma.
pub const MAX_PROPG_DELAY: Time = 55;

/// Median per-packet processing latency.
pub const MED_PKT_PROC_LTC: Time = 5;
/// Standard deviation of the packet processing latency.
pub const PKT_PROC_LTC_SD: f64 = 0.5;
/// Packet processing latency clamped below at median - 2 sigma.
pub const MIN_PKT_PROC_LTC: Time = 4;
/// Packet processing latency clamped above at median + 2 sigma.
pub const MAX_PKT_PROC_LTC: Time = 6;

/// Link bandwidth in bits per microsecond (10 Gbps).
const LINK_BITS_PER_US: u64 = 10_000;

fn clamped_gauss(rng: &mut StdRng, median: Time, sd: f64, min: Time, max: Time) -> Time {
    let jitter = Normal::new(0.0, sd)
        .expect("standard deviation is a positive constant")
        .sample(rng);
    let sampled = (median as f64 + jitter).round();
    (sampled.max(min as f64).min(max as f64)) as Time
}

/// Samples a one-hop propagation delay in [MIN_PROPG_DELAY, MAX_PROPG_DELAY].
pub fn propg_delay(rng: &mut StdRng) -> Time {
    clamped_gauss(
        rng,
        MED_PROPG_DELAY,
        PROPG_DELAY_SD,
        MIN_PROPG_DELAY,
        MAX_PROPG_DELAY,
    )
}

/// Samples a per-packet processing latency in
/// [MIN_PKT_PROC_LTC, MAX_PKT_PROC_LTC].
pub fn pkt_proc_ltc(rng: &mut StdRng) -> Time {
    clamped_gauss(
        rng,
        MED_PKT_PROC_LTC,
        PKT_PROC_LTC_SD,
        MIN_PKT_PROC_LTC,
        MAX_PKT_PROC_LTC,
    )
}

/// Transmission delay of a `bytes`-long message over the 10 Gbps link.
pub fn trans_delay(bytes: usize) -> Time {
    (bytes as u64 * 8) / LINK_BITS_PER_US
}

/// End-to-end network latency of a message: `distance` propagation hops plus
/// the serialization time of its bytes.
pub fn size_distance_to_time(bytes: usize, distance: Time, rng: &mut StdRng) -> Time {
    distance * propg_delay(rng) + trans_delay(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_clamped() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let p = propg_delay(&mut rng);
            assert!((MIN_PROPG_DELAY..=MAX_PROPG_DELAY).contains(&p));
            let l = pkt_proc_ltc(&mut rng);
            assert!((MIN_PKT_PROC_LTC..=MAX_PKT_PROC_LTC).contains(&l));
        }
    }

    #[test]
    fn transmission_is_deterministic() {
        // 1250 bytes = 10000 bits = 1 us on a 10 Gbps link.
        assert_eq!(trans_delay(1250), 1);
        assert_eq!(trans_delay(0), 0);
        // Small control messages serialize in under a microsecond.
        assert_eq!(trans_delay(64), 0);
        assert_eq!(trans_delay(12_500), 10);
    }

    #[test]
    fn latency_respects_distance() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1000 {
            let near = size_distance_to_time(1024, 1, &mut rng);
            assert!(near >= MIN_PROPG_DELAY && near <= MAX_PROPG_DELAY);
            let far = size_distance_to_time(1024, 2, &mut rng);
            assert!(far >= 2 * MIN_PROPG_DELAY && far <= 2 * MAX_PROPG_DELAY);
        }
    }
}
