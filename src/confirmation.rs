//! Transaction submission and receipt polling

use std::time::Duration;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::eth::{EthClient, RpcReceipt};
use crate::transaction::SignedTransaction;

/// Upper bound used when a timeout does not fit the clock
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Execution outcome recorded in a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    /// Mined but reverted
    Failure,
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub status: ReceiptStatus,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub gas_used: u64,
    pub effective_gas_price: Option<u128>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub logs_count: usize,
}

impl Receipt {
    /// Whether execution succeeded
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }

    /// Convert a node receipt; `None` while it is not yet in a block
    pub fn from_rpc(receipt: RpcReceipt) -> Result<Option<Self>> {
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let status = match receipt.status.map(|s| s.to::<u64>()) {
            Some(1) => ReceiptStatus::Success,
            Some(0) => ReceiptStatus::Failure,
            Some(other) => {
                return Err(PipelineError::decode(
                    "transaction receipt",
                    format!("unknown status {}", other),
                ))
            }
            None => {
                return Err(PipelineError::decode(
                    "transaction receipt",
                    "receipt has no status field",
                ))
            }
        };

        Ok(Some(Self {
            transaction_hash: receipt.transaction_hash,
            status,
            block_number: block_number.to::<u64>(),
            block_hash: receipt.block_hash,
            gas_used: receipt.gas_used.to::<u64>(),
            effective_gas_price: receipt.effective_gas_price.map(|p| p.to::<u128>()),
            from: receipt.from,
            to: receipt.to,
            logs_count: receipt.logs.len(),
        }))
    }
}

/// Handle to a submitted, not yet confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub tx_hash: B256,
    pub nonce: u64,
    /// When the node accepted the transaction
    pub submitted_at: Instant,
}

/// Submits signed transactions and waits for their receipts
#[derive(Clone)]
pub struct ConfirmationTracker {
    client: EthClient,
    poll_interval: Duration,
}

impl ConfirmationTracker {
    /// Create a tracker polling every `poll_interval`
    pub fn new(client: EthClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Send the serialized transaction and return without waiting.
    ///
    /// Node rejections are returned as [`PipelineError::Submission`] with the
    /// node's code and message unchanged.
    pub async fn submit(&self, signed: &SignedTransaction) -> Result<PendingTransaction> {
        let raw = signed.encode();
        let node_hash = self
            .client
            .send_raw_transaction(&raw)
            .await
            .map_err(|e| match e {
                PipelineError::Rpc { code, message, .. } => PipelineError::Submission { code, message },
                other => other,
            })?;

        let tx_hash = signed.hash();
        if node_hash != tx_hash {
            warn!("Node returned hash {} for transaction {}", node_hash, tx_hash);
        }

        info!(
            "Submitted transaction {} (nonce {}, {} bytes)",
            tx_hash,
            signed.transaction().nonce,
            raw.len()
        );

        Ok(PendingTransaction {
            tx_hash,
            nonce: signed.transaction().nonce,
            submitted_at: Instant::now(),
        })
    }

    /// Poll for the receipt of `pending` until `timeout` elapses.
    ///
    /// A reverted transaction is a successful confirmation with
    /// [`ReceiptStatus::Failure`]. [`PipelineError::Timeout`] means only that
    /// no receipt was seen in time.
    pub async fn await_receipt(
        &self,
        pending: &PendingTransaction,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Receipt> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let tx_hash = pending.tx_hash;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = tokio::time::timeout_at(deadline, self.client.get_transaction_receipt(tx_hash)) => result,
            };

            if let Ok(result) = polled {
                if let Some(receipt) = result?.map(Receipt::from_rpc).transpose()?.flatten() {
                    info!(
                        "Transaction {} mined in block {} ({:?}, gas used {}) {:?} after submission",
                        tx_hash,
                        receipt.block_number,
                        receipt.status,
                        receipt.gas_used,
                        pending.submitted_at.elapsed()
                    );
                    return Ok(receipt);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "No receipt for {} (nonce {}) {:?} after submission",
                    tx_hash,
                    pending.nonce,
                    now.duration_since(pending.submitted_at)
                );
                return Err(PipelineError::Timeout {
                    tx_hash,
                    waited: now.duration_since(started),
                });
            }

            debug!("No receipt yet for {}, polling again in {:?}", tx_hash, self.poll_interval);
            let wait = self.poll_interval.min(deadline.duration_since(now));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Submit and wait for the receipt
    pub async fn send_and_confirm(
        &self,
        signed: &SignedTransaction,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Receipt> {
        let pending = self.submit(signed).await?;
        self.await_receipt(&pending, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node_error, ScriptedTransport};
    use crate::transaction::{FeeParameters, Transaction};
    use alloy_primitives::{Bytes, Signature, U256};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn signed_tx() -> SignedTransaction {
        Transaction {
            chain_id: 1,
            nonce: 3,
            to: Address::repeat_byte(0xaa),
            value: U256::from(1u64),
            fees: FeeParameters {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000,
                gas_limit: 21_000,
            },
            data: Bytes::new(),
            access_list: vec![],
        }
        .into_signed(Signature::new(U256::from(1u64), U256::from(2u64), false))
    }

    fn receipt_json(hash: B256, status: &str, block: Option<&str>) -> Value {
        json!({
            "transactionHash": hash,
            "status": status,
            "blockNumber": block,
            "blockHash": B256::repeat_byte(0xbb),
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "from": Address::repeat_byte(0x11),
            "to": Address::repeat_byte(0xaa),
            "logs": []
        })
    }

    fn setup() -> (Arc<ScriptedTransport>, ConfirmationTracker) {
        let transport = ScriptedTransport::new();
        let tracker = ConfirmationTracker::new(EthClient::new(transport.clone()), Duration::from_millis(10));
        (transport, tracker)
    }

    fn pending(hash: B256) -> PendingTransaction {
        PendingTransaction {
            tx_hash: hash,
            nonce: 3,
            submitted_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_local_hash() {
        let (transport, tracker) = setup();
        let signed = signed_tx();
        transport.push("eth_sendRawTransaction", json!(signed.hash()));

        let before = Instant::now();
        let handle = tracker.submit(&signed).await.unwrap();
        assert_eq!(handle.tx_hash, signed.hash());
        assert_eq!(handle.nonce, 3);
        assert!(handle.submitted_at >= before && handle.submitted_at <= Instant::now());

        let params = transport.calls("eth_sendRawTransaction");
        assert_eq!(params[0][0], json!(signed.raw_hex()));
    }

    #[tokio::test]
    async fn test_submit_rejection_is_verbatim() {
        let (transport, tracker) = setup();
        transport.push_err(
            "eth_sendRawTransaction",
            node_error("eth_sendRawTransaction", -32000, "insufficient funds for gas * price + value"),
        );

        let err = tracker.submit(&signed_tx()).await.unwrap_err();
        match err {
            PipelineError::Submission { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "insufficient funds for gas * price + value");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(transport.calls("eth_sendRawTransaction").len(), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_without_receipt_times_out() {
        let (transport, tracker) = setup();
        transport.respond("eth_getTransactionReceipt", |_| Ok(Value::Null));
        let hash = B256::repeat_byte(0x01);

        let err = tracker
            .await_receipt(&pending(hash), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::Timeout { tx_hash, .. } => assert_eq!(tx_hash, hash),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receipt_found_after_polling() {
        let (transport, tracker) = setup();
        let hash = B256::repeat_byte(0x02);
        transport.push("eth_getTransactionReceipt", Value::Null);
        transport.push("eth_getTransactionReceipt", receipt_json(hash, "0x1", None));
        transport.push("eth_getTransactionReceipt", receipt_json(hash, "0x1", Some("0x10")));

        let receipt = tracker
            .await_receipt(&pending(hash), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert!(receipt.is_success());
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.effective_gas_price, Some(1_000_000_000));
        assert_eq!(transport.calls("eth_getTransactionReceipt").len(), 3);
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_confirmation() {
        let (transport, tracker) = setup();
        let hash = B256::repeat_byte(0x03);
        transport.push("eth_getTransactionReceipt", receipt_json(hash, "0x0", Some("0x20")));

        let receipt = tracker
            .await_receipt(&pending(hash), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Failure);
        assert!(!receipt.is_success());
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting() {
        let (transport, tracker) = setup();
        transport.respond("eth_getTransactionReceipt", |_| Ok(Value::Null));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = tracker
            .await_receipt(&pending(B256::repeat_byte(0x04)), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_receipt_without_status_is_rejected() {
        let mut raw = receipt_json(B256::ZERO, "0x1", Some("0x1"));
        raw.as_object_mut().unwrap().remove("status");
        let rpc: RpcReceipt = serde_json::from_value(raw).unwrap();

        assert!(matches!(Receipt::from_rpc(rpc), Err(PipelineError::Decode { .. })));
    }
}
