use crate::backoff::jittered_backoff;
use crate::heads::Heads;
use crate::ledger::{Ledger, LogFilter};
use ember_types::{Address, BlockCursor, DecodedEvent, EventBody, RawLog, Topic, TxHash};
use ember_world::{ApplyError, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decodes a raw contract log into a typed event, or reports that it cannot.
///
/// This is the opaque decode boundary: the engine never inspects contract
/// wire formats itself.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, log: &RawLog) -> Result<EventBody, DecodeError>;
}

#[derive(Error, Debug, Clone)]
#[error("failed to decode log: {0}")]
pub struct DecodeError(pub String);

/// A registered event source: logs from `emitter` whose first topic is in
/// `topics` (empty matches all) are routed to `decoder`.
#[derive(Clone)]
pub struct Subscription {
    pub emitter: Address,
    pub topics: Vec<Topic>,
    pub decoder: Arc<dyn EventDecoder>,
}

impl Subscription {
    fn matches(&self, log: &RawLog) -> bool {
        if self.emitter != log.address {
            return false;
        }
        if self.topics.is_empty() {
            return true;
        }
        log.topics
            .first()
            .map(|topic| self.topics.contains(topic))
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Bootstrapping,
    Live,
    Reconnecting,
    /// Terminal: requires an external reload, never auto-repaired.
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Initial backoff while waiting for the batch node to reach a target.
    #[serde(default = "default_probe_backoff_min_ms")]
    pub probe_backoff_min_ms: u64,
    #[serde(default = "default_probe_backoff_max_ms")]
    pub probe_backoff_max_ms: u64,
    /// Attempts before a lagging or failing fetch becomes terminal.
    #[serde(default = "default_fetch_retry_budget")]
    pub fetch_retry_budget: usize,
    #[serde(default = "default_reconnect_backoff_min_ms")]
    pub reconnect_backoff_min_ms: u64,
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,
    /// Consecutive failed reconnects before the engine goes terminal.
    #[serde(default = "default_reconnect_retry_budget")]
    pub reconnect_retry_budget: usize,
}

fn default_probe_backoff_min_ms() -> u64 {
    50
}

fn default_probe_backoff_max_ms() -> u64 {
    2_000
}

fn default_fetch_retry_budget() -> usize {
    32
}

fn default_reconnect_backoff_min_ms() -> u64 {
    200
}

fn default_reconnect_backoff_max_ms() -> u64 {
    10_000
}

fn default_reconnect_retry_budget() -> usize {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_backoff_min_ms: default_probe_backoff_min_ms(),
            probe_backoff_max_ms: default_probe_backoff_max_ms(),
            fetch_retry_budget: default_fetch_retry_budget(),
            reconnect_backoff_min_ms: default_reconnect_backoff_min_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
            reconnect_retry_budget: default_reconnect_retry_budget(),
        }
    }
}

impl SyncConfig {
    fn probe_backoff_min(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_min_ms)
    }

    fn probe_backoff_max(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_max_ms)
    }

    fn reconnect_backoff_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_min_ms)
    }

    fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("batch node stuck below target {target} after {attempts} attempts")]
    NodeLagged { target: u64, attempts: usize },
    #[error("log fetch failed after {attempts} attempts: {reason}")]
    Fetch { attempts: usize, reason: String },
    #[error("log at {block}:{index}: {source}")]
    Decode {
        block: u64,
        index: u64,
        source: DecodeError,
    },
    #[error(transparent)]
    CausalGap(#[from] ApplyError),
}

struct EngineState {
    cursor: BlockCursor,
    status: SyncStatus,
    /// Coalesced sync target: overlapping head notifications collapse here.
    target: Option<u64>,
    live: bool,
    /// Logs fetched while bootstrap is still loading; drained in order by
    /// `begin_live_processing`.
    buffered: Vec<RawLog>,
    subscriptions: Vec<Subscription>,
    watchers: HashMap<TxHash, Vec<oneshot::Sender<()>>>,
}

struct Inner<L: Ledger> {
    ledger: L,
    store: Store,
    config: SyncConfig,
    state: Mutex<EngineState>,
    wake: Notify,
    /// Held for the duration of every sync job; this is what makes the job
    /// queue single-slot and range fetches gap-free and non-overlapping.
    job_lock: tokio::sync::Mutex<()>,
}

impl<L: Ledger> Inner<L> {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The chain sync engine.
///
/// Orders event logs by `(block_number, log_index)`, applies them to the
/// world store exactly once, tracks the block cursor, and resolves
/// wait-for-transaction watchers.
pub struct SyncEngine<L: Ledger> {
    inner: Arc<Inner<L>>,
    _worker: Arc<AbortOnDrop>,
}

impl<L: Ledger> Clone for SyncEngine<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _worker: self._worker.clone(),
        }
    }
}

impl<L: Ledger> SyncEngine<L> {
    /// `ledger` is the batch channel; the push channel arrives via [`run`].
    ///
    /// [`run`]: SyncEngine::run
    pub fn new(ledger: L, store: Store, config: SyncConfig, start_height: u64) -> Self {
        let inner = Arc::new(Inner {
            ledger,
            store,
            config,
            state: Mutex::new(EngineState {
                cursor: BlockCursor::new(start_height),
                status: SyncStatus::Bootstrapping,
                target: None,
                live: false,
                buffered: Vec::new(),
                subscriptions: Vec::new(),
                watchers: HashMap::new(),
            }),
            wake: Notify::new(),
            job_lock: tokio::sync::Mutex::new(()),
        });
        let worker = tokio::spawn(worker(inner.clone()));
        Self {
            inner,
            _worker: Arc::new(AbortOnDrop(worker)),
        }
    }

    /// Register an event source.
    ///
    /// Re-baselines the synced height to the current observed height: there
    /// is no retroactive genesis scan, so callers must batch every
    /// `subscribe` call before [`begin_live_processing`].
    ///
    /// [`begin_live_processing`]: SyncEngine::begin_live_processing
    pub fn subscribe(&self, subscription: Subscription) {
        let mut state = self.inner.lock();
        state.subscriptions.push(subscription);
        state.cursor.rebaseline();
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.lock().status.clone()
    }

    pub fn cursor(&self) -> BlockCursor {
        self.inner.lock().cursor
    }

    /// Resolved once a synced block contains a log from `tx_hash`.
    pub fn wait_for_tx(&self, tx_hash: TxHash) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .watchers
            .entry(tx_hash)
            .or_default()
            .push(tx);
        rx
    }

    /// Record a pushed head. A height regression is a reorg: terminal, never
    /// auto-corrected. Overlapping notifications coalesce onto the single
    /// job slot, targeting the newest height.
    pub fn on_new_head(&self, height: u64) {
        let mut state = self.inner.lock();
        if matches!(state.status, SyncStatus::Error(_)) {
            return;
        }
        if !state.cursor.observe(height) {
            let observed = state.cursor.observed();
            error!(observed, reported = height, "height regression: reorg");
            state.status = SyncStatus::Error(format!(
                "reorg detected: height {observed} regressed to {height}"
            ));
            return;
        }
        if height > state.cursor.synced() {
            let target = state.target.map_or(height, |t| t.max(height));
            state.target = Some(target);
            drop(state);
            self.inner.wake.notify_one();
        }
    }

    /// Switch from buffering to live processing, draining buffered logs
    /// through the same ordered path.
    pub async fn begin_live_processing(&self) -> Result<(), EngineError> {
        let _guard = self.inner.job_lock.lock().await;
        let buffered = {
            let mut state = self.inner.lock();
            state.live = true;
            if !matches!(state.status, SyncStatus::Error(_)) {
                state.status = SyncStatus::Live;
            }
            std::mem::take(&mut state.buffered)
        };
        if buffered.is_empty() {
            return Ok(());
        }
        info!(logs = buffered.len(), "draining buffered logs");
        if let Err(err) = apply_logs(&self.inner, buffered) {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Drive the engine from a push head source, reconnecting with jittered
    /// backoff on transport failure. Returns when the status is terminal.
    pub async fn run<H: Heads>(&self, heads: H) {
        let config = self.inner.config.clone();
        let mut backoff = config.reconnect_backoff_min();
        let mut attempts = 0usize;
        loop {
            if matches!(self.status(), SyncStatus::Error(_)) {
                return;
            }
            match heads.connect().await {
                Ok(mut stream) => {
                    info!("head stream connected");
                    attempts = 0;
                    backoff = config.reconnect_backoff_min();
                    {
                        let mut state = self.inner.lock();
                        if !matches!(state.status, SyncStatus::Error(_)) {
                            state.status = if state.live {
                                SyncStatus::Live
                            } else {
                                SyncStatus::Bootstrapping
                            };
                        }
                    }
                    // Re-prime from the batch node's view of the head.
                    match self.inner.ledger.chain_height().await {
                        Ok(height) => self.on_new_head(height),
                        Err(err) => warn!(%err, "failed to re-prime height"),
                    }
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(height) => {
                                self.on_new_head(height);
                                if matches!(self.status(), SyncStatus::Error(_)) {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(%err, "head stream error");
                                break;
                            }
                        }
                    }
                    warn!("head stream ended");
                }
                Err(err) => {
                    warn!(%err, "failed to connect head stream");
                }
            }
            // Disconnected: clear the job queue and back off before retrying.
            {
                let mut state = self.inner.lock();
                state.target = None;
                if !matches!(state.status, SyncStatus::Error(_)) {
                    state.status = SyncStatus::Reconnecting;
                }
            }
            attempts += 1;
            if attempts > config.reconnect_retry_budget {
                error!(attempts, "reconnect budget exhausted");
                self.inner.lock().status =
                    SyncStatus::Error("reconnect budget exhausted".to_string());
                return;
            }
            let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
            tokio::time::sleep(delay).await;
            backoff = backoff.saturating_mul(2).min(config.reconnect_backoff_max());
        }
    }

    fn fail(&self, err: &EngineError) {
        error!(%err, "sync engine entering terminal error state");
        let mut state = self.inner.lock();
        state.status = SyncStatus::Error(err.to_string());
    }
}

async fn worker<L: Ledger>(inner: Arc<Inner<L>>) {
    loop {
        let target = loop {
            let notified = inner.wake.notified();
            let taken = {
                let mut state = inner.lock();
                if matches!(state.status, SyncStatus::Error(_)) {
                    state.target = None;
                    None
                } else {
                    let synced = state.cursor.synced();
                    state.target.take().filter(|target| *target > synced)
                }
            };
            if let Some(target) = taken {
                break target;
            }
            notified.await;
        };
        let _guard = inner.job_lock.lock().await;
        if let Err(err) = sync_to(&inner, target).await {
            error!(%err, target, "sync job failed");
            let mut state = inner.lock();
            state.status = SyncStatus::Error(err.to_string());
        }
    }
}

/// One sync job: fetch all logs for `(synced, target]` across the union of
/// registered filters in a single batched call, then apply them in order.
async fn sync_to<L: Ledger>(inner: &Arc<Inner<L>>, target: u64) -> Result<(), EngineError> {
    let (from, filter, live) = {
        let state = inner.lock();
        let from = state.cursor.synced() + 1;
        let addresses: Vec<Address> = {
            let mut addresses: Vec<Address> = state
                .subscriptions
                .iter()
                .map(|sub| sub.emitter)
                .collect();
            addresses.sort();
            addresses.dedup();
            addresses
        };
        let topics: Vec<Topic> = if state
            .subscriptions
            .iter()
            .any(|sub| sub.topics.is_empty())
        {
            Vec::new()
        } else {
            let mut topics: Vec<Topic> = state
                .subscriptions
                .iter()
                .flat_map(|sub| sub.topics.iter().copied())
                .collect();
            topics.sort();
            topics.dedup();
            topics
        };
        (
            from,
            LogFilter {
                from_block: from,
                to_block: target,
                addresses,
                topics,
            },
            state.live,
        )
    };
    if target < from {
        return Ok(());
    }
    if filter.addresses.is_empty() {
        // Nothing subscribed yet; just track the head.
        inner.lock().cursor.advance(target);
        return Ok(());
    }

    // Race the fetch against a height probe: the batch node may trail the
    // push channel, so retry with backoff until its own height reaches the
    // target.
    let config = &inner.config;
    let mut backoff = config.probe_backoff_min();
    let mut attempts = 0usize;
    let mut logs = loop {
        attempts += 1;
        let (logs, height) = tokio::join!(inner.ledger.logs(&filter), inner.ledger.chain_height());
        match (logs, height) {
            (Ok(logs), Ok(height)) if height >= target => break logs,
            (_, Ok(height)) if height < target => {
                debug!(height, target, "batch node behind target");
                if attempts >= config.fetch_retry_budget {
                    return Err(EngineError::NodeLagged { target, attempts });
                }
            }
            (Err(err), _) => {
                warn!(%err, "log fetch failed");
                if attempts >= config.fetch_retry_budget {
                    return Err(EngineError::Fetch {
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
            (_, Err(err)) => {
                warn!(%err, "height probe failed");
                if attempts >= config.fetch_retry_budget {
                    return Err(EngineError::Fetch {
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
            // `height >= target` and `height < target` are exhaustive over
            // u64, so an `(Ok, Ok)` pair always matches one of the guarded
            // arms above; this arm only satisfies the exhaustiveness checker.
            (Ok(_), Ok(_)) => unreachable!("height is either >= or < target"),
        }
        let delay = jittered_backoff(&mut rand::thread_rng(), backoff);
        tokio::time::sleep(delay).await;
        backoff = backoff.saturating_mul(2).min(config.probe_backoff_max());
    };

    logs.sort_by_key(|log| (log.block_number, log.log_index));
    debug!(from, target, logs = logs.len(), "sync job fetched range");

    if !live {
        let mut state = inner.lock();
        state.buffered.extend(logs);
        state.cursor.advance(target);
        return Ok(());
    }

    apply_logs(inner, logs)?;
    inner.lock().cursor.advance(target);
    Ok(())
}

/// Route each log to the first matching subscription's decoder and apply
/// the decoded events to the store, in order. Resolves transaction watchers
/// for every touched hash.
fn apply_logs<L: Ledger>(inner: &Arc<Inner<L>>, logs: Vec<RawLog>) -> Result<(), EngineError> {
    let subscriptions: Vec<Subscription> = inner.lock().subscriptions.clone();
    let mut touched: Vec<TxHash> = Vec::new();
    for log in logs {
        let Some(subscription) = subscriptions.iter().find(|sub| sub.matches(&log)) else {
            debug!(
                block = log.block_number,
                index = log.log_index,
                "log matched no subscription"
            );
            continue;
        };
        let body = subscription
            .decoder
            .decode(&log)
            .map_err(|source| EngineError::Decode {
                block: log.block_number,
                index: log.log_index,
                source,
            })?;
        let event = DecodedEvent {
            block_number: log.block_number,
            log_index: log.log_index,
            tx_hash: log.tx_hash,
            emitter: log.address,
            body,
        };
        inner.store.apply(&event)?;
        if !touched.contains(&log.tx_hash) {
            touched.push(log.tx_hash);
        }
    }
    if !touched.is_empty() {
        let mut state = inner.lock();
        for tx_hash in touched {
            if let Some(senders) = state.watchers.remove(&tx_hash) {
                for sender in senders {
                    let _ = sender.send(());
                }
            }
        }
    }
    Ok(())
}

impl<L: Ledger> crate::submitter::TxObserver for SyncEngine<L> {
    fn watch(&self, tx_hash: TxHash) -> oneshot::Receiver<()> {
        self.wait_for_tx(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BlockHeader, Receipt};
    use ember_types::Notification;
    use ember_world::WorldConfig;
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout, Duration};

    const EMITTER: Address = Address([0xaa; 20]);

    /// Scripted batch ledger. `gate` throttles `logs` so tests can hold a
    /// sync job mid-flight; calls are recorded before blocking.
    #[derive(Clone)]
    struct MockLedger {
        height: Arc<AtomicU64>,
        logs: Arc<Mutex<Vec<RawLog>>>,
        calls: Arc<Mutex<Vec<(u64, u64)>>>,
        gate: Arc<Semaphore>,
    }

    impl MockLedger {
        fn new(height: u64) -> Self {
            Self {
                height: Arc::new(AtomicU64::new(height)),
                logs: Arc::new(Mutex::new(Vec::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            }
        }

        fn gated(height: u64) -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                ..Self::new(height)
            }
        }

        fn push_log(&self, block: u64, index: u64, tx: u8, payload: u8) {
            self.logs.lock().unwrap().push(RawLog {
                block_number: block,
                log_index: index,
                tx_hash: TxHash([tx; 32]),
                address: EMITTER,
                topics: vec![[1; 32]],
                data: vec![payload],
            });
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Ledger for MockLedger {
        type Error = io::Error;

        async fn chain_height(&self) -> Result<u64, io::Error> {
            Ok(self.height.load(Ordering::SeqCst))
        }

        async fn latest_header(&self) -> Result<BlockHeader, io::Error> {
            let number = self.height.load(Ordering::SeqCst);
            Ok(BlockHeader {
                number,
                timestamp: number * 3,
            })
        }

        async fn account_nonce(&self, _: &Address) -> Result<u64, io::Error> {
            Ok(0)
        }

        async fn balance(&self, _: &Address) -> Result<u128, io::Error> {
            Ok(u128::MAX)
        }

        async fn transaction_receipt(&self, _: &TxHash) -> Result<Option<Receipt>, io::Error> {
            Ok(None)
        }

        async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, io::Error> {
            self.calls
                .lock()
                .unwrap()
                .push((filter.from_block, filter.to_block));
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    log.block_number >= filter.from_block && log.block_number <= filter.to_block
                })
                .cloned()
                .collect())
        }

        async fn call(&self, _: &Address, _: &[u8]) -> Result<Vec<u8>, io::Error> {
            Ok(Vec::new())
        }

        async fn send_raw_transaction(&self, _: &[u8]) -> Result<TxHash, io::Error> {
            Ok(TxHash([0; 32]))
        }
    }

    /// Decoder that turns each log into a player join keyed by the payload
    /// byte, recording decode order.
    struct JoinDecoder {
        order: Arc<Mutex<Vec<u64>>>,
    }

    impl EventDecoder for JoinDecoder {
        fn decode(&self, log: &RawLog) -> Result<EventBody, DecodeError> {
            let byte = *log
                .data
                .first()
                .ok_or_else(|| DecodeError("empty data".to_string()))?;
            self.order.lock().unwrap().push(log.log_index);
            Ok(EventBody::PlayerJoined {
                address: Address([byte; 20]),
                gold_capacity: 100,
                at: log.block_number,
            })
        }
    }

    struct Setup {
        ledger: MockLedger,
        store: Store,
        engine: SyncEngine<MockLedger>,
        order: Arc<Mutex<Vec<u64>>>,
    }

    fn setup(ledger: MockLedger, start_height: u64) -> Setup {
        let store = Store::new(WorldConfig::default());
        let engine = SyncEngine::new(
            ledger.clone(),
            store.clone(),
            SyncConfig::default(),
            start_height,
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        engine.subscribe(Subscription {
            emitter: EMITTER,
            topics: vec![[1; 32]],
            decoder: Arc::new(JoinDecoder {
                order: order.clone(),
            }),
        });
        Setup {
            ledger,
            store,
            engine,
            order,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn overlapping_heads_coalesce_into_one_job() {
        let Setup { ledger, engine, .. } = setup(MockLedger::gated(100), 5);
        engine.begin_live_processing().await.unwrap();

        // First job starts and blocks inside the log fetch.
        engine.on_new_head(9);
        wait_until(|| ledger.calls().len() == 1).await;

        // Three more heads arrive mid-flight.
        engine.on_new_head(10);
        engine.on_new_head(11);
        engine.on_new_head(12);

        // Release both fetches: exactly one follow-up job covering
        // [synced + 1, 12].
        ledger.gate.add_permits(2);
        wait_until(|| ledger.calls().len() == 2).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(ledger.calls(), vec![(6, 9), (10, 12)]);
        assert_eq!(engine.cursor().synced(), 12);
    }

    #[tokio::test]
    async fn logs_apply_in_log_index_order() {
        let Setup {
            ledger,
            store,
            engine,
            order,
        } = setup(MockLedger::new(100), 7);
        engine.begin_live_processing().await.unwrap();

        // Fetch order is [5, 3]; application order must be [3, 5].
        ledger.push_log(8, 5, 1, 9);
        ledger.push_log(8, 3, 1, 8);

        engine.on_new_head(8);
        wait_until(|| engine.cursor().synced() == 8).await;

        assert_eq!(*order.lock().unwrap(), vec![3, 5]);
        assert!(store.read(|world| world.players.contains_key(&Address([8; 20]))));
        assert!(store.read(|world| world.players.contains_key(&Address([9; 20]))));
    }

    #[tokio::test]
    async fn height_regression_is_terminal() {
        let Setup { engine, .. } = setup(MockLedger::new(100), 5);
        engine.begin_live_processing().await.unwrap();

        engine.on_new_head(8);
        wait_until(|| engine.cursor().synced() == 8).await;

        engine.on_new_head(6);
        assert!(matches!(engine.status(), SyncStatus::Error(_)));

        // Further heads are ignored.
        engine.on_new_head(20);
        assert_eq!(engine.cursor().synced(), 8);
    }

    #[tokio::test]
    async fn bootstrap_logs_buffer_then_drain_in_order() {
        let Setup {
            ledger,
            store,
            engine,
            order,
        } = setup(MockLedger::new(100), 5);

        ledger.push_log(6, 0, 1, 1);
        ledger.push_log(7, 2, 2, 2);

        // Heads arrive while still bootstrapping: fetched but not applied.
        engine.on_new_head(7);
        wait_until(|| engine.cursor().synced() == 7).await;
        assert!(store.read(|world| world.players.is_empty()));
        assert!(order.lock().unwrap().is_empty());
        assert_eq!(engine.status(), SyncStatus::Bootstrapping);

        // Going live drains the buffer through the ordered path.
        engine.begin_live_processing().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 2]);
        assert_eq!(store.read(|world| world.players.len()), 2);
        assert_eq!(engine.status(), SyncStatus::Live);
    }

    #[tokio::test]
    async fn wait_for_tx_resolves_when_effects_land() {
        let Setup { ledger, engine, .. } = setup(MockLedger::new(100), 5);
        engine.begin_live_processing().await.unwrap();

        let watcher = engine.wait_for_tx(TxHash([9; 32]));
        ledger.push_log(6, 0, 9, 1);
        engine.on_new_head(6);

        timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher timed out")
            .expect("watcher dropped");
    }

    #[tokio::test]
    async fn subscribe_rebaselines_synced_height() {
        let Setup { engine, .. } = setup(MockLedger::new(100), 5);
        engine.on_new_head(40);
        wait_until(|| engine.cursor().synced() == 40).await;

        // A late subscription must not trigger a retroactive scan.
        engine.subscribe(Subscription {
            emitter: Address([0xbb; 20]),
            topics: Vec::new(),
            decoder: Arc::new(JoinDecoder {
                order: Arc::new(Mutex::new(Vec::new())),
            }),
        });
        assert_eq!(engine.cursor().synced(), engine.cursor().observed());
    }

    #[tokio::test]
    async fn causal_gap_escalates_to_error() {
        let Setup { ledger, engine, .. } = setup(MockLedger::new(100), 5);
        engine.begin_live_processing().await.unwrap();

        // A vault change for a player the world has never seen.
        struct GapDecoder;
        impl EventDecoder for GapDecoder {
            fn decode(&self, _: &RawLog) -> Result<EventBody, DecodeError> {
                Ok(EventBody::PlayerVaultChanged {
                    address: Address([7; 20]),
                    gold: 1,
                    souls: 0,
                })
            }
        }
        let gap_emitter = Address([0xcc; 20]);
        engine.subscribe(Subscription {
            emitter: gap_emitter,
            topics: Vec::new(),
            decoder: Arc::new(GapDecoder),
        });
        ledger.logs.lock().unwrap().push(RawLog {
            block_number: 6,
            log_index: 0,
            tx_hash: TxHash([1; 32]),
            address: gap_emitter,
            topics: vec![[2; 32]],
            data: Vec::new(),
        });

        engine.on_new_head(6);
        wait_until(|| matches!(engine.status(), SyncStatus::Error(_))).await;
        let SyncStatus::Error(reason) = engine.status() else {
            panic!("expected error status");
        };
        assert!(reason.contains("unknown player"));
    }

    #[tokio::test]
    async fn world_state_notifications_flow_from_applied_events() {
        let Setup { ledger, store, engine, .. } = setup(MockLedger::new(100), 5);
        engine.begin_live_processing().await.unwrap();
        let mut notifications = store.subscribe();

        ledger.push_log(6, 0, 1, 5);
        engine.on_new_head(6);

        let notification = timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification timed out")
            .expect("channel closed");
        assert_eq!(
            notification,
            Notification::PlayerChanged(Address([5; 20]))
        );
    }
}
