use ember_types::{Address, RawLog, Topic, TxHash};
use std::future::Future;

/// Header fields of a ledger block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

/// Outcome of an included transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// A filtered log query over an inclusive block range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// Accepted first topics; empty matches every topic.
    pub topics: Vec<Topic>,
}

/// RPC access to the ledger.
///
/// The sync engine holds two independent instances: a batch channel for bulk
/// reads and log queries, and a push channel for new-head notifications (see
/// [`crate::heads`]), so bootstrap traffic never queues behind live traffic.
pub trait Ledger: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn chain_height(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    fn latest_header(&self) -> impl Future<Output = Result<BlockHeader, Self::Error>> + Send;

    fn account_nonce(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    fn balance(&self, address: &Address)
        -> impl Future<Output = Result<u128, Self::Error>> + Send;

    fn transaction_receipt(
        &self,
        tx_hash: &TxHash,
    ) -> impl Future<Output = Result<Option<Receipt>, Self::Error>> + Send;

    fn logs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<Vec<RawLog>, Self::Error>> + Send;

    fn call(
        &self,
        to: &Address,
        data: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;

    fn send_raw_transaction(
        &self,
        raw: &[u8],
    ) -> impl Future<Output = Result<TxHash, Self::Error>> + Send;
}
