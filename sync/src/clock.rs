use crate::ledger::Ledger;
use ember_types::ChainTimeEstimate;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// Samples the head timestamp on its own timer and bridges discrete block
/// time to a continuous estimate.
///
/// A changed sample is accepted as fresh and resets the prediction; an
/// unchanged sample advances the prediction by one resolution tick. Probe
/// failures are treated as unchanged samples: the display clock keeps
/// ticking while the transport recovers.
pub struct ChainClock {
    estimate: watch::Receiver<ChainTimeEstimate>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for ChainClock {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ChainClock {
    pub fn spawn<L: Ledger>(ledger: L, resolution: Duration, probe_timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(ChainTimeEstimate::new(0, resolution));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(resolution);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let sample = match timeout(probe_timeout, ledger.latest_header()).await {
                    Ok(Ok(header)) => Some(header.timestamp),
                    Ok(Err(err)) => {
                        warn!(%err, "chain time probe failed");
                        None
                    }
                    Err(_) => {
                        warn!(?probe_timeout, "chain time probe timed out");
                        None
                    }
                };
                tx.send_modify(|estimate| {
                    let observed = sample.unwrap_or(estimate.last_confirmed_time);
                    estimate.sample(observed);
                    debug!(
                        predicted = estimate.predicted_time,
                        fresh = estimate.is_fresh,
                        "chain time updated"
                    );
                });
            }
        });
        Self {
            estimate: rx,
            handle,
        }
    }

    /// Current best estimate of chain time (unix seconds).
    pub fn now(&self) -> u64 {
        self.estimate.borrow().now()
    }

    pub fn estimate(&self) -> ChainTimeEstimate {
        self.estimate.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainTimeEstimate> {
        self.estimate.clone()
    }
}
