//! Chain Transport
//!
//! Minimal Ethereum JSON-RPC surface used by the escrow client: `eth_call`,
//! `eth_sendTransaction` and `eth_getTransactionReceipt`. Signing is left to
//! the node or wallet behind the RPC endpoint.
//!
//! Every wait on the chain goes through [`wait_for_receipt`]. There are no
//! fixed delays anywhere in the crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, TxHash, B256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::config::ChainConfig;

/// Contract ABIs.
pub mod abi {
    #![allow(missing_docs)]

    use alloy_sol_types::sol;

    sol! {
        interface IBettingEscrow {
            function createBet(uint256 betAmount, uint256 targetDistance, uint256 deadline, string activityType) external returns (uint256);
            function placeBet(uint256 betId) external;
            function submitZKProof(uint256 betId, bytes zkProof, uint256 claimedDistance) external;
            function claimWinnings(uint256 betId) external;
            function getBetDetails(uint256 betId) external view returns (uint256 betAmount, uint256 targetDistance, uint256 deadline, address[] participants, uint256 totalPool, bool isActive, uint256 winnerCount);
            function hasProof(uint256 betId, address participant) external view returns (bool);
        }

        interface IERC20 {
            function approve(address spender, uint256 amount) external returns (bool);
            function allowance(address owner, address spender) external view returns (uint256);
            function balanceOf(address account) external view returns (uint256);
        }
    }
}

/// Chain errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Transport or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },
    /// Response carried neither result nor error.
    #[error("empty result for {0}")]
    EmptyResult(&'static str),
    /// Transaction was mined but reverted.
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    /// No receipt within the confirmation window.
    #[error("no receipt for {tx} after {waited:?}")]
    ReceiptTimeout {
        /// Transaction hash.
        tx: TxHash,
        /// Time waited.
        waited: Duration,
    },
}

// =============================================================================
// RECEIPTS
// =============================================================================

/// Log entry of a receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcLog {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; the first is the event signature.
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Non-indexed data.
    #[serde(default)]
    pub data: Bytes,
}

/// Mined transaction receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Transaction hash.
    pub transaction_hash: TxHash,
    /// `0x1` on success, `0x0` on revert.
    #[serde(default)]
    pub status: Option<U64>,
    /// Inclusion block.
    #[serde(default)]
    pub block_number: Option<U64>,
    /// Emitted logs.
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl TxReceipt {
    /// Execution succeeded.
    pub fn succeeded(&self) -> bool {
        self.status != Some(U64::ZERO)
    }

    /// Logs emitted by `address`.
    pub fn logs_from(&self, address: Address) -> impl Iterator<Item = &RpcLog> {
        self.logs.iter().filter(move |log| log.address == address)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// JSON-RPC operations the escrow client needs.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Read-only call against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

    /// Send a transaction from an account unlocked at the endpoint.
    async fn send_transaction(&self, from: Address, to: Address, data: Bytes) -> Result<TxHash, ChainError>;

    /// Receipt, or `None` while pending.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

/// HTTP JSON-RPC client.
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Create a client for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "JSON-RPC request");
        let response: JsonRpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result)
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?
            .ok_or(ChainError::EmptyResult("eth_call"))
    }

    #[instrument(skip(self, data))]
    async fn send_transaction(&self, from: Address, to: Address, data: Bytes) -> Result<TxHash, ChainError> {
        let hash: TxHash = self
            .request(
                "eth_sendTransaction",
                json!([{ "from": from, "to": to, "data": data }]),
            )
            .await?
            .ok_or(ChainError::EmptyResult("eth_sendTransaction"))?;
        info!(tx = %hash, "Transaction sent");
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        self.request("eth_getTransactionReceipt", json!([hash])).await
    }
}

// =============================================================================
// CONFIRMATION
// =============================================================================

/// How receipts are awaited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Delay between receipt polls.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(180),
        }
    }
}

impl ConfirmationPolicy {
    /// Policy from chain config.
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            poll_interval: config.receipt_poll,
            timeout: config.receipt_timeout,
        }
    }
}

/// Poll until `hash` is mined. A reverted receipt is an error.
#[instrument(skip(rpc, policy))]
pub async fn wait_for_receipt(
    rpc: &dyn ChainRpc,
    hash: TxHash,
    policy: &ConfirmationPolicy,
) -> Result<TxReceipt, ChainError> {
    let poll = async {
        loop {
            if let Some(receipt) = rpc.transaction_receipt(hash).await? {
                return Ok::<_, ChainError>(receipt);
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    };

    let receipt = match tokio::time::timeout(policy.timeout, poll).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(tx = %hash, "Timed out waiting for receipt");
            return Err(ChainError::ReceiptTimeout {
                tx: hash,
                waited: policy.timeout,
            });
        }
    };

    if !receipt.succeeded() {
        warn!(tx = %hash, "Transaction reverted");
        return Err(ChainError::Reverted(hash));
    }

    info!(tx = %hash, block = ?receipt.block_number, "Transaction confirmed");
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct PendingThenMined {
        polls: AtomicUsize,
        pending_polls: usize,
        status: U64,
    }

    #[async_trait]
    impl ChainRpc for PendingThenMined {
        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes, ChainError> {
            Ok(Bytes::new())
        }

        async fn send_transaction(&self, _from: Address, _to: Address, _data: Bytes) -> Result<TxHash, ChainError> {
            Ok(B256::repeat_byte(1))
        }

        async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                return Ok(None);
            }
            Ok(Some(TxReceipt {
                transaction_hash: hash,
                status: Some(self.status),
                block_number: Some(U64::from(10)),
                logs: vec![],
            }))
        }
    }

    fn fast_policy() -> ConfirmationPolicy {
        ConfirmationPolicy {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_waits_until_mined() {
        let rpc = PendingThenMined {
            polls: AtomicUsize::new(0),
            pending_polls: 3,
            status: U64::from(1),
        };
        let hash = B256::repeat_byte(9);

        let receipt = wait_for_receipt(&rpc, hash, &fast_policy()).await.unwrap();

        assert_eq!(receipt.transaction_hash, hash);
        assert_eq!(rpc.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_error() {
        let rpc = PendingThenMined {
            polls: AtomicUsize::new(0),
            pending_polls: 0,
            status: U64::ZERO,
        };
        let result = wait_for_receipt(&rpc, B256::repeat_byte(9), &fast_policy()).await;
        assert!(matches!(result, Err(ChainError::Reverted(_))));
    }

    #[tokio::test]
    async fn test_receipt_timeout() {
        let rpc = PendingThenMined {
            polls: AtomicUsize::new(0),
            pending_polls: usize::MAX,
            status: U64::from(1),
        };
        let policy = ConfirmationPolicy {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
        };
        let result = wait_for_receipt(&rpc, B256::repeat_byte(9), &policy).await;
        assert!(matches!(result, Err(ChainError::ReceiptTimeout { .. })));
    }

    #[test]
    fn test_receipt_deserialize() {
        let json = r#"{
            "transactionHash": "0x0101010101010101010101010101010101010101010101010101010101010101",
            "status": "0x1",
            "blockNumber": "0x1b4",
            "logs": [{
                "address": "0x1111111111111111111111111111111111111111",
                "topics": ["0x0202020202020202020202020202020202020202020202020202020202020202"],
                "data": "0x"
            }]
        }"#;
        let receipt: TxReceipt = serde_json::from_str(json).unwrap();
        assert!(receipt.succeeded());
        assert_eq!(receipt.block_number, Some(U64::from(436)));
        assert_eq!(receipt.logs.len(), 1);
    }

    #[test]
    fn test_abi_selectors() {
        use alloy_sol_types::SolCall;
        assert_eq!(abi::IERC20::approveCall::SELECTOR, [0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(abi::IERC20::balanceOfCall::SELECTOR, [0x70, 0xa0, 0x82, 0x31]);
    }
}
