use crate::ledger::{Ledger, Receipt};
use ember_types::TxHash;
use futures::future::{pending, BoxFuture};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

/// Per-transaction knobs forwarded to the generator.
#[derive(Clone, Debug, Default)]
pub struct TxOverrides {
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    pub value: Option<u128>,
}

/// Error surface of a transaction generator.
///
/// The generator owns signing and encoding (key management is out of scope
/// here); it reports nonce conflicts distinctly so the executor can re-fetch
/// the authoritative nonce instead of retrying with a stale one.
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("nonce conflict")]
    NonceConflict,
    #[error("{0}")]
    Fatal(String),
}

/// Builds a signed raw transaction for the given nonce.
pub type Generator =
    Box<dyn Fn(u64, TxOverrides) -> BoxFuture<'static, Result<Vec<u8>, GeneratorError>> + Send + Sync>;

/// A queued submission. Created when an action is admitted; destroyed once
/// submission and confirmation resolve.
pub struct TxRequest {
    pub tx_id: String,
    pub action_id: u64,
    pub overrides: TxOverrides,
    pub generator: Generator,
    pub on_submitted: Option<Box<dyn FnOnce(&TxHash) + Send + Sync>>,
    pub on_confirmed: Option<Box<dyn FnOnce(&Receipt) + Send + Sync>>,
}

/// A submission error: the transaction was never broadcast (or cannot be
/// assumed broadcast, for timeouts), so retrying is safe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("balance {balance} below minimum {minimum}")]
    InsufficientBalance { balance: u128, minimum: u128 },
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
    #[error("nonce conflict persisted after refresh")]
    NonceConflict,
    #[error("transaction generation failed: {0}")]
    Generator(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("recovery hook invoked; transaction not submitted")]
    RecoveryTriggered,
    #[error("executor dropped")]
    Dropped,
}

/// A confirmation error: the transaction was broadcast but its inclusion is
/// unknown or failed, so blind retries may double-spend the intent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    #[error("executor dropped")]
    Dropped,
}

/// Handles for one submission: resolve `submitted` first, `confirmed` later.
pub struct TxHandle {
    pub tx_id: String,
    pub submitted: oneshot::Receiver<Result<TxHash, SubmitError>>,
    pub confirmed: oneshot::Receiver<Result<Receipt, ConfirmError>>,
}

/// Push-notification source for confirmations; the sync engine implements
/// this by resolving once a synced block carries the transaction's logs.
pub trait TxObserver: Send + Sync + 'static {
    fn watch(&self, tx_hash: TxHash) -> oneshot::Receiver<()>;
}

/// Invoked instead of submitting when the balance check fails.
pub type RecoveryHook = Arc<dyn Fn(u128) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: u32,
    /// Minimum balance required before submitting.
    #[serde(default)]
    pub min_balance: u128,
    /// Zero-fee deployments skip the balance check entirely.
    #[serde(default)]
    pub skip_balance_check: bool,
    #[serde(default = "default_submission_timeout_ms")]
    pub submission_timeout_ms: u64,
    #[serde(default = "default_confirm_poll_initial_ms")]
    pub confirm_poll_initial_ms: u64,
    #[serde(default = "default_confirm_poll_max_ms")]
    pub confirm_poll_max_ms: u64,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_rate_per_sec() -> u32 {
    2
}

fn default_submission_timeout_ms() -> u64 {
    15_000
}

fn default_confirm_poll_initial_ms() -> u64 {
    500
}

fn default_confirm_poll_max_ms() -> u64 {
    8_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            rate_per_sec: default_rate_per_sec(),
            min_balance: 0,
            skip_balance_check: false,
            submission_timeout_ms: default_submission_timeout_ms(),
            confirm_poll_initial_ms: default_confirm_poll_initial_ms(),
            confirm_poll_max_ms: default_confirm_poll_max_ms(),
        }
    }
}

impl ExecutorConfig {
    fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    fn confirm_poll_initial(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_initial_ms)
    }

    fn confirm_poll_max(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_max_ms)
    }
}

struct ExecutorInner<L: Ledger> {
    ledger: L,
    sender: ember_types::Address,
    config: ExecutorConfig,
    /// The single-writer submission lock. `None` until first use; reset to
    /// the node's authoritative value only on nonce conflicts.
    nonce: tokio::sync::Mutex<Option<u64>>,
    limiter: DefaultDirectRateLimiter,
    in_flight: Arc<Semaphore>,
    observer: Option<Arc<dyn TxObserver>>,
    recovery: Option<RecoveryHook>,
}

/// The transaction executor: nonce assignment, rate-limited submission,
/// retry classification, and confirmation tracking.
pub struct Executor<L: Ledger> {
    inner: Arc<ExecutorInner<L>>,
}

impl<L: Ledger> Clone for Executor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Ledger> Executor<L> {
    pub fn new(
        ledger: L,
        sender: ember_types::Address,
        config: ExecutorConfig,
        observer: Option<Arc<dyn TxObserver>>,
        recovery: Option<RecoveryHook>,
    ) -> Self {
        let rate = NonZeroU32::new(config.rate_per_sec.max(1)).unwrap_or(NonZeroU32::MIN);
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            inner: Arc::new(ExecutorInner {
                ledger,
                sender,
                config,
                nonce: tokio::sync::Mutex::new(None),
                limiter: RateLimiter::direct(Quota::per_second(rate)),
                in_flight: Arc::new(Semaphore::new(max_in_flight)),
                observer,
                recovery,
            }),
        }
    }

    /// Enqueue a submission. Returns immediately with handles for the
    /// "submitted" and "confirmed" outcomes.
    pub fn submit(&self, request: TxRequest) -> TxHandle {
        let (submitted_tx, submitted_rx) = oneshot::channel();
        let (confirmed_tx, confirmed_rx) = oneshot::channel();
        let tx_id = request.tx_id.clone();
        tokio::spawn(drive(
            self.inner.clone(),
            request,
            submitted_tx,
            confirmed_tx,
        ));
        TxHandle {
            tx_id,
            submitted: submitted_rx,
            confirmed: confirmed_rx,
        }
    }
}

async fn drive<L: Ledger>(
    inner: Arc<ExecutorInner<L>>,
    mut request: TxRequest,
    submitted_tx: oneshot::Sender<Result<TxHash, SubmitError>>,
    confirmed_tx: oneshot::Sender<Result<Receipt, ConfirmError>>,
) {
    let Ok(_permit) = inner.in_flight.clone().acquire_owned().await else {
        let _ = submitted_tx.send(Err(SubmitError::Dropped));
        return;
    };
    inner.limiter.until_ready().await;

    if !inner.config.skip_balance_check {
        match inner.ledger.balance(&inner.sender).await {
            Ok(balance) if balance < inner.config.min_balance => {
                if let Some(recovery) = &inner.recovery {
                    warn!(
                        tx_id = %request.tx_id,
                        balance,
                        "balance below minimum; invoking recovery hook"
                    );
                    recovery(balance).await;
                    let _ = submitted_tx.send(Err(SubmitError::RecoveryTriggered));
                } else {
                    let _ = submitted_tx.send(Err(SubmitError::InsufficientBalance {
                        balance,
                        minimum: inner.config.min_balance,
                    }));
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = submitted_tx.send(Err(SubmitError::Transport(err.to_string())));
                return;
            }
        }
    }

    let result = match submit_once(&inner, &request).await {
        Err(SubmitError::NonceConflict) => {
            // Self-heal: re-acquire the lock, reset the counter from the
            // node, and retry once with the refreshed value.
            match refresh_nonce(&inner).await {
                Ok(()) => submit_once(&inner, &request).await,
                Err(err) => Err(err),
            }
        }
        other => other,
    };
    let tx_hash = match result {
        Ok(tx_hash) => tx_hash,
        Err(err) => {
            warn!(tx_id = %request.tx_id, %err, "submission failed");
            let _ = submitted_tx.send(Err(err));
            return;
        }
    };
    debug!(tx_id = %request.tx_id, %tx_hash, "transaction submitted");
    if let Some(callback) = request.on_submitted.take() {
        callback(&tx_hash);
    }
    let _ = submitted_tx.send(Ok(tx_hash));

    let result = confirm(&inner, tx_hash).await;
    if let Ok(receipt) = &result {
        debug!(tx_id = %request.tx_id, block = receipt.block_number, "transaction confirmed");
        if let Some(callback) = request.on_confirmed.take() {
            callback(receipt);
        }
    }
    let _ = confirmed_tx.send(result);
}

/// One submission attempt. The nonce read-increment and the generator call
/// happen under a single lock hold; a failed attempt rolls the nonce back
/// before releasing, so no other waiter can observe the gap.
async fn submit_once<L: Ledger>(
    inner: &ExecutorInner<L>,
    request: &TxRequest,
) -> Result<TxHash, SubmitError> {
    let mut guard = inner.nonce.lock().await;
    let nonce = match *guard {
        Some(nonce) => nonce,
        None => inner
            .ledger
            .account_nonce(&inner.sender)
            .await
            .map_err(|err| SubmitError::Transport(err.to_string()))?,
    };
    *guard = Some(nonce + 1);

    let timeout = inner.config.submission_timeout();
    let attempt = async {
        let raw = (request.generator)(nonce, request.overrides.clone())
            .await
            .map_err(|err| match err {
                GeneratorError::NonceConflict => SubmitError::NonceConflict,
                GeneratorError::Fatal(message) => SubmitError::Generator(message),
            })?;
        inner
            .ledger
            .send_raw_transaction(&raw)
            .await
            .map_err(classify_send_error)
    };
    let result = match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        // A timed-out submission is a submission error even if the request
        // later lands; callers judge retry safety from the variant.
        Err(_) => Err(SubmitError::Timeout(timeout)),
    };
    if result.is_err() {
        *guard = Some(nonce);
    }
    result
}

fn classify_send_error(err: impl std::error::Error) -> SubmitError {
    let message = err.to_string();
    if message.to_ascii_lowercase().contains("nonce") {
        SubmitError::NonceConflict
    } else {
        SubmitError::Transport(message)
    }
}

/// The only path that resets the counter to an externally observed value.
async fn refresh_nonce<L: Ledger>(inner: &ExecutorInner<L>) -> Result<(), SubmitError> {
    let mut guard = inner.nonce.lock().await;
    let nonce = inner
        .ledger
        .account_nonce(&inner.sender)
        .await
        .map_err(|err| SubmitError::Transport(err.to_string()))?;
    info!(nonce, "nonce refreshed from node after conflict");
    *guard = Some(nonce);
    Ok(())
}

/// Await confirmation: race the push notification (when available) against
/// capped exponential-backoff receipt polling; first to resolve wins.
async fn confirm<L: Ledger>(
    inner: &ExecutorInner<L>,
    tx_hash: TxHash,
) -> Result<Receipt, ConfirmError> {
    let mut push: BoxFuture<'static, bool> = match &inner.observer {
        Some(observer) => {
            let watcher = observer.watch(tx_hash);
            Box::pin(async move { watcher.await.is_ok() })
        }
        None => Box::pin(pending()),
    };
    let mut delay = inner.config.confirm_poll_initial();
    loop {
        tokio::select! {
            resolved = &mut push => {
                push = Box::pin(pending());
                if resolved {
                    // Effects observed on-chain; fetch the receipt now.
                    delay = Duration::ZERO;
                }
            }
            _ = tokio::time::sleep(delay) => {
                match inner.ledger.transaction_receipt(&tx_hash).await {
                    Ok(Some(receipt)) => {
                        return if receipt.success {
                            Ok(receipt)
                        } else {
                            Err(ConfirmError::Reverted(tx_hash))
                        };
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, %tx_hash, "receipt poll failed"),
                }
                delay = delay
                    .max(inner.config.confirm_poll_initial())
                    .saturating_mul(2)
                    .min(inner.config.confirm_poll_max());
            }
        }
    }
}
