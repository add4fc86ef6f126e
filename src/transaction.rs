//! EIP-1559 transaction model and typed-envelope codec
//!
//! Signing payload: `0x02 || rlp([chain_id, nonce, max_priority_fee_per_gas,
//! max_fee_per_gas, gas_limit, to, value, data, access_list])`.
//! Signed envelope: the same list followed by `y_parity, r, s`.

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use alloy_rlp::{BufMut, Decodable, Encodable, Header, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Transaction type byte of the fee-market envelope
pub const EIP1559_TX_TYPE: u8 = 0x02;

/// Intrinsic gas of a plain value transfer
pub const MIN_TRANSFER_GAS: u64 = 21_000;

/// Access list entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct AccessListItem {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

/// Fee and gas caps of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeParameters {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_limit: u64,
}

impl FeeParameters {
    /// Check the EIP-1559 fee invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_fee_per_gas == 0 || self.max_priority_fee_per_gas == 0 {
            return Err(PipelineError::InvalidFee(format!(
                "fee caps must be positive (max fee {}, priority fee {})",
                self.max_fee_per_gas, self.max_priority_fee_per_gas
            )));
        }
        if self.max_priority_fee_per_gas > self.max_fee_per_gas {
            return Err(PipelineError::InvalidFee(format!(
                "max priority fee {} exceeds max fee {}",
                self.max_priority_fee_per_gas, self.max_fee_per_gas
            )));
        }
        if self.gas_limit < MIN_TRANSFER_GAS {
            return Err(PipelineError::InvalidFee(format!(
                "gas limit {} is below the {} intrinsic minimum",
                self.gas_limit, MIN_TRANSFER_GAS
            )));
        }
        Ok(())
    }
}

/// Unsigned EIP-1559 transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub fees: FeeParameters,
    pub data: Bytes,
    pub access_list: Vec<AccessListItem>,
}

impl Transaction {
    /// Transaction type byte, always [`EIP1559_TX_TYPE`]
    pub const fn tx_type(&self) -> u8 {
        EIP1559_TX_TYPE
    }

    fn fields_len(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.fees.max_priority_fee_per_gas.length()
            + self.fees.max_fee_per_gas.length()
            + self.fees.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + self.access_list.length()
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.fees.max_priority_fee_per_gas.encode(out);
        self.fees.max_fee_per_gas.encode(out);
        self.fees.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        self.access_list.encode(out);
    }

    fn decode_fields(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let chain_id = u64::decode(buf)?;
        let nonce = u64::decode(buf)?;
        let max_priority_fee_per_gas = u128::decode(buf)?;
        let max_fee_per_gas = u128::decode(buf)?;
        let gas_limit = u64::decode(buf)?;
        let to = Address::decode(buf)?;
        let value = U256::decode(buf)?;
        let data = Bytes::decode(buf)?;
        let access_list = Vec::<AccessListItem>::decode(buf)?;

        Ok(Self {
            chain_id,
            nonce,
            to,
            value,
            fees: FeeParameters {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                gas_limit,
            },
            data,
            access_list,
        })
    }

    /// Bytes covered by the signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let header = Header {
            list: true,
            payload_length: self.fields_len(),
        };
        let mut out = Vec::with_capacity(1 + header.length() + header.payload_length);
        out.put_u8(self.tx_type());
        header.encode(&mut out);
        self.encode_fields(&mut out);
        out
    }

    /// Keccak-256 of the signing payload
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    /// Attach a signature produced over [`Transaction::signing_hash`]
    pub fn into_signed(self, signature: Signature) -> SignedTransaction {
        let encoded = encode_envelope(&self, &signature);
        let hash = keccak256(&encoded);
        SignedTransaction {
            tx: self,
            signature,
            hash,
        }
    }
}

fn signature_len(signature: &Signature) -> usize {
    signature.v().length() + signature.r().length() + signature.s().length()
}

fn encode_envelope(tx: &Transaction, signature: &Signature) -> Vec<u8> {
    let header = Header {
        list: true,
        payload_length: tx.fields_len() + signature_len(signature),
    };
    let mut out = Vec::with_capacity(1 + header.length() + header.payload_length);
    out.put_u8(tx.tx_type());
    header.encode(&mut out);
    tx.encode_fields(&mut out);
    signature.v().encode(&mut out);
    signature.r().encode(&mut out);
    signature.s().encode(&mut out);
    out
}

/// Signed transaction; immutable once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    tx: Transaction,
    signature: Signature,
    hash: B256,
}

impl SignedTransaction {
    /// The signed transaction body
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Signature `(r, s, y_parity)`
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Transaction hash (keccak-256 of the envelope)
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// Serialized typed envelope
    pub fn encode(&self) -> Bytes {
        Bytes::from(encode_envelope(&self.tx, &self.signature))
    }

    /// `0x`-prefixed envelope as sent to `eth_sendRawTransaction`
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(encode_envelope(&self.tx, &self.signature)))
    }

    /// Address recovered from the signature
    pub fn recover_signer(&self) -> Result<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx.signing_hash())
            .map_err(|e| PipelineError::Signature(format!("Failed to recover signer: {}", e)))
    }

    /// Parse a serialized envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tx_type, mut buf) = bytes
            .split_first()
            .ok_or_else(|| PipelineError::decode("transaction envelope", "empty input"))?;
        if tx_type != EIP1559_TX_TYPE {
            return Err(PipelineError::decode(
                "transaction envelope",
                format!("unsupported transaction type {:#04x}", tx_type),
            ));
        }

        let header = Header::decode(&mut buf).map_err(rlp_error)?;
        if !header.list {
            return Err(PipelineError::decode("transaction envelope", "payload is not a list"));
        }
        if header.payload_length != buf.len() {
            return Err(PipelineError::decode(
                "transaction envelope",
                format!(
                    "list length {} does not match remaining {} bytes",
                    header.payload_length,
                    buf.len()
                ),
            ));
        }

        let tx = Transaction::decode_fields(&mut buf).map_err(rlp_error)?;
        let y_parity = bool::decode(&mut buf).map_err(rlp_error)?;
        let r = U256::decode(&mut buf).map_err(rlp_error)?;
        let s = U256::decode(&mut buf).map_err(rlp_error)?;
        if !buf.is_empty() {
            return Err(PipelineError::decode(
                "transaction envelope",
                format!("{} trailing bytes", buf.len()),
            ));
        }

        Ok(tx.into_signed(Signature::new(r, s, y_parity)))
    }
}

fn rlp_error(error: alloy_rlp::Error) -> PipelineError {
    PipelineError::decode("transaction envelope", error)
}
