use std::time::{Duration, Instant};

/// Sync progress against the chain head.
///
/// `synced <= observed` always holds; only the sync job advances `synced`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockCursor {
    observed: u64,
    synced: u64,
}

impl BlockCursor {
    pub fn new(height: u64) -> Self {
        Self {
            observed: height,
            synced: height,
        }
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn synced(&self) -> u64 {
        self.synced
    }

    /// Record a newly announced head. Returns `false` on a height
    /// regression (reorg), leaving the cursor untouched.
    pub fn observe(&mut self, height: u64) -> bool {
        if height < self.observed {
            return false;
        }
        self.observed = height;
        true
    }

    /// Advance the synced height after a completed sync job. Clamped to the
    /// observed height to preserve the invariant.
    pub fn advance(&mut self, height: u64) {
        debug_assert!(height <= self.observed);
        self.synced = self.synced.max(height.min(self.observed));
    }

    /// Re-baseline the synced height to the observed height. Used when a
    /// subscription is registered: there is no retroactive genesis scan.
    pub fn rebaseline(&mut self) {
        self.synced = self.observed;
    }
}

/// Continuous estimate of the chain's notion of "now".
///
/// Block time is discrete; the estimate bridges it to a continuous display
/// clock by advancing the prediction one resolution tick per period until a
/// fresh sample replaces it.
#[derive(Clone, Debug)]
pub struct ChainTimeEstimate {
    pub last_confirmed_time: u64,
    pub last_confirmed_at: Instant,
    pub predicted_time: u64,
    pub predicted_at: Instant,
    pub resolution: Duration,
    pub is_fresh: bool,
}

impl ChainTimeEstimate {
    pub fn new(sample: u64, resolution: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_confirmed_time: sample,
            last_confirmed_at: now,
            predicted_time: sample,
            predicted_at: now,
            resolution,
            is_fresh: true,
        }
    }

    /// Accept a new head-timestamp sample. A changed sample is fresh and
    /// resets the prediction; an unchanged one advances it one tick.
    pub fn sample(&mut self, observed: u64) {
        let now = Instant::now();
        if observed != self.last_confirmed_time {
            self.last_confirmed_time = observed;
            self.last_confirmed_at = now;
            self.predicted_time = observed;
            self.predicted_at = now;
            self.is_fresh = true;
        } else {
            self.predicted_time = self
                .predicted_time
                .saturating_add(self.resolution.as_secs());
            self.predicted_at = now;
            self.is_fresh = false;
        }
    }

    /// The current best estimate of chain time (unix seconds).
    pub fn now(&self) -> u64 {
        self.predicted_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_rejects_regression() {
        let mut cursor = BlockCursor::new(10);
        assert!(cursor.observe(12));
        assert!(!cursor.observe(11));
        assert_eq!(cursor.observed(), 12);
        assert_eq!(cursor.synced(), 10);

        cursor.advance(12);
        assert_eq!(cursor.synced(), 12);
    }

    #[test]
    fn estimate_ticks_until_fresh_sample() {
        let mut est = ChainTimeEstimate::new(1_000, Duration::from_secs(3));
        assert_eq!(est.now(), 1_000);

        // Same sample twice: prediction advances one tick each time.
        est.sample(1_000);
        assert!(!est.is_fresh);
        assert_eq!(est.now(), 1_003);
        est.sample(1_000);
        assert_eq!(est.now(), 1_006);

        // Fresh sample replaces the prediction entirely.
        est.sample(1_004);
        assert!(est.is_fresh);
        assert_eq!(est.now(), 1_004);
    }
}
