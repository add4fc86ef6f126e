//! Private-key account and deterministic secp256k1 signing

use std::fmt;

use alloy_primitives::{Address, Signature, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;

use crate::error::{PipelineError, Result};
use crate::transaction::{SignedTransaction, Transaction};

/// Derive the account address of `private_key`
pub fn derive_address(private_key: &B256) -> Result<Address> {
    PrivateKeySigner::from_bytes(private_key)
        .map(|signer| signer.address())
        .map_err(|_| PipelineError::InvalidKey)
}

/// Account backed by a local private key.
///
/// The key never leaves this type: `Debug` prints only the address and
/// errors carry no key material.
#[derive(Clone)]
pub struct Account {
    signer: PrivateKeySigner,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.signer.address())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Account {
    /// Create an account from a 32-byte secret
    pub fn from_private_key(private_key: &B256) -> Result<Self> {
        let signer = PrivateKeySigner::from_bytes(private_key).map_err(|_| PipelineError::InvalidKey)?;
        Ok(Self { signer })
    }

    /// Create an account from a hex secret, with or without `0x`
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits).map_err(|_| PipelineError::InvalidKey)?;
        if bytes.len() != 32 {
            return Err(PipelineError::InvalidKey);
        }
        Self::from_private_key(&B256::from_slice(&bytes))
    }

    /// Account address
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign a 32-byte prehash (RFC 6979 deterministic nonce, low-s)
    pub fn sign_hash(&self, hash: &B256) -> Result<Signature> {
        self.signer
            .sign_hash_sync(hash)
            .map_err(|e| PipelineError::Signature(e.to_string()))
    }

    /// Sign `tx` over its EIP-1559 signing hash
    pub fn sign_transaction(&self, tx: Transaction) -> Result<SignedTransaction> {
        let signature = self.sign_hash(&tx.signing_hash())?;
        Ok(tx.into_signed(signature))
    }
}
