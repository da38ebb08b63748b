pub mod backoff;
pub mod clock;
pub mod engine;
pub mod heads;
pub mod ledger;
pub mod rpc;
pub mod submitter;

pub use clock::ChainClock;
pub use engine::{
    DecodeError, EngineError, EventDecoder, Subscription, SyncConfig, SyncEngine, SyncStatus,
};
pub use heads::{HeadError, HeadStream, Heads, PollingHeads, WsHeads};
pub use ledger::{BlockHeader, Ledger, LogFilter, Receipt};
pub use rpc::{HttpLedger, RpcError};
pub use submitter::{
    ConfirmError, Executor, ExecutorConfig, GeneratorError, SubmitError, TxHandle, TxObserver,
    TxOverrides, TxRequest,
};
