//! EIP-1559 transaction pipeline and contract event subscriber
//!
//! Two independent pipelines over one Ethereum JSON-RPC client:
//!
//! - **Transactions**: resolve nonce, fees and gas limit, sign with a local
//!   secp256k1 key, submit the typed envelope and wait for the receipt.
//! - **Events**: backfill a contract's logs in block chunks, then follow the
//!   chain head, persisting a cursor and retracting logs dropped by reorgs.
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_pipeline::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = HttpRpcClient::new("http://localhost:8545", Duration::from_secs(30), RetryPolicy::default())?;
//!     let client = EthClient::from_transport(transport);
//!
//!     let account = Account::from_hex("0x...")?;
//!     let builder = TransactionBuilder::new(client.clone(), account.address());
//!
//!     let request = TransactionRequest::transfer(client.chain_id().await?, Address::repeat_byte(0x42), U256::from(1u64));
//!     let signed = account.sign_transaction(builder.build(request).await?)?;
//!
//!     let tracker = ConfirmationTracker::new(client, Duration::from_secs(2));
//!     let receipt = tracker
//!         .send_and_confirm(&signed, Duration::from_secs(120), &CancellationToken::new())
//!         .await?;
//!
//!     println!("mined in block {} with status {:?}", receipt.block_number, receipt.status);
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod builder;
pub mod config;
pub mod confirmation;
pub mod cursor;
pub mod error;
pub mod eth;
pub mod events;
pub mod rpc;
pub mod subscriber;
pub mod transaction;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use account::{derive_address, Account};
pub use builder::{FeePolicy, TransactionBuilder, TransactionRequest};
pub use confirmation::{ConfirmationTracker, PendingTransaction, Receipt, ReceiptStatus};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use error::{PipelineError, Result};
pub use eth::{BlockTag, EthClient};
pub use events::{DecodeWarning, EventFilter, EventSignature, LogDecode, LogEvent, LogKey};
pub use rpc::{HttpRpcClient, RetryPolicy, RpcTransport};
pub use subscriber::{
    BatchPhase, EventSubscriber, LogBatch, LogHandler, LogNotice, SubscriptionConfig,
    SubscriptionState,
};
pub use transaction::{FeeParameters, SignedTransaction, Transaction};

// Re-export Alloy types for convenience
pub use alloy_dyn_abi::DynSolValue;
pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::account::Account;
    pub use crate::builder::{FeePolicy, TransactionBuilder, TransactionRequest};
    pub use crate::confirmation::{ConfirmationTracker, Receipt, ReceiptStatus};
    pub use crate::cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
    pub use crate::error::{PipelineError, Result};
    pub use crate::eth::EthClient;
    pub use crate::events::{EventFilter, EventSignature, LogEvent};
    pub use crate::rpc::{HttpRpcClient, RetryPolicy};
    pub use crate::subscriber::{EventSubscriber, LogBatch, LogHandler, LogNotice};
    pub use alloy_dyn_abi::DynSolValue;
    pub use alloy_primitives::{Address, B256, U256};
    pub use tokio_util::sync::CancellationToken;
}
