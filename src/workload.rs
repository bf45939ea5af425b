//! Synthetic workload generation: key popularity (uniform or Zipfian) and
//! request spacing (uniform or Poisson).

use std::collections::HashSet;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp, Zipf};

use crate::kv::{KVWorkloadGenerator, OpType, Operation};
use crate::{SimError, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDist {
    Uniform,
    Zipf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalDist {
    Uniform,
    Poisson,
}

/// Generates `(operation, issue_time)` pairs until the end of time; the
/// simulation duration bounds the run, not the generator.
pub struct WorkloadGenerator {
    keys: Vec<String>,
    value: String,
    get_ratio: f64,
    put_ratio: f64,
    key_dist: KeyDist,
    zipf: Option<Zipf<f64>>,
    interval_dist: IntervalDist,
    exp: Option<Exp<f64>>,
    mean_interval: f64,
    timer: f64,
    initkey: bool,
    initialized: HashSet<usize>,
}

impl WorkloadGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Vec<String>,
        value_len: usize,
        get_ratio: f64,
        put_ratio: f64,
        key_dist: KeyDist,
        interval_dist: IntervalDist,
        mean_interval: f64,
        alpha: f64,
        initkey: bool,
    ) -> Result<Self, SimError> {
        if keys.is_empty() {
            return Err(SimError::Config("workload needs at least one key".into()));
        }
        if !(0.0..=1.0).contains(&get_ratio)
            || !(0.0..=1.0).contains(&put_ratio)
            || get_ratio + put_ratio > 1.0
        {
            return Err(SimError::Config(format!(
                "invalid op mix: gets={get_ratio} puts={put_ratio}"
            )));
        }
        if mean_interval <= 0.0 {
            return Err(SimError::Config(format!(
                "mean request interval must be positive, got {mean_interval}"
            )));
        }
        let zipf = match key_dist {
            KeyDist::Zipf => Some(
                Zipf::new(keys.len() as u64, alpha)
                    .map_err(|e| SimError::Config(format!("bad zipf exponent {alpha}: {e}")))?,
            ),
            KeyDist::Uniform => None,
        };
        let exp = match interval_dist {
            IntervalDist::Poisson => Some(
                Exp::new(1.0 / mean_interval)
                    .map_err(|e| SimError::Config(format!("bad interval {mean_interval}: {e}")))?,
            ),
            IntervalDist::Uniform => None,
        };
        Ok(Self {
            keys,
            value: "v".repeat(value_len),
            get_ratio,
            put_ratio,
            key_dist,
            zipf,
            interval_dist,
            exp,
            mean_interval,
            timer: 0.0,
            initkey,
            initialized: HashSet::new(),
        })
    }

    fn next_key_index(&self, rng: &mut StdRng) -> usize {
        match self.key_dist {
            KeyDist::Uniform => rng.gen_range(0..self.keys.len()),
            KeyDist::Zipf => {
                let rank = self.zipf.as_ref().expect("zipf set for zipf keys").sample(rng);
                rank as usize - 1
            }
        }
    }
}

impl KVWorkloadGenerator for WorkloadGenerator {
    fn next_operation(&mut self, rng: &mut StdRng) -> Option<(Operation, Time)> {
        let key_index = self.next_key_index(rng);
        let key = &self.keys[key_index];

        let op_choice: f64 = rng.gen();
        let op_type = if op_choice < self.get_ratio {
            // Optionally turn the first access of a cold key into a PUT so
            // GETs afterwards can hit.
            if self.initkey && !self.initialized.contains(&key_index) {
                OpType::Put
            } else {
                OpType::Get
            }
        } else if op_choice < self.get_ratio + self.put_ratio {
            OpType::Put
        } else {
            OpType::Del
        };

        let op = match op_type {
            OpType::Put => {
                if self.initkey {
                    self.initialized.insert(key_index);
                }
                Operation::put(key.clone(), self.value.clone())
            }
            OpType::Get => Operation::get(key.clone()),
            OpType::Del => Operation::del(key.clone()),
        };

        self.timer += match self.interval_dist {
            IntervalDist::Uniform => self.mean_interval,
            IntervalDist::Poisson => self
                .exp
                .as_ref()
                .expect("exp set for poisson intervals")
                .sample(rng),
        };
        Some((op, self.timer.round() as Time))
    }
}

/// Random alphanumeric string of the given length.
pub fn rand_string(len: usize, rng: &mut StdRng) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
