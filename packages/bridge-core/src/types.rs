use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// 桥合约中配置的链标识
pub type ChainId = u8;

/// 32 字节资源标识，两条链的 handler 配置共用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub [u8; 32]);

impl ResourceId {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_hex(s)?;
        if bytes.len() != 32 {
            return Err(Error::Config(format!(
                "resource id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Fungible,
    NonFungible,
    Generic,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Fungible => "fungible",
            TransferKind::NonFungible => "non_fungible",
            TransferKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// [`Message`] 中随转账类型变化的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Fungible {
        amount: U256,
        recipient: Vec<u8>,
    },
    NonFungible {
        token_id: U256,
        recipient: Vec<u8>,
        metadata: Vec<u8>,
    },
    Generic {
        data_hash: H256,
    },
}

impl Payload {
    pub fn kind(&self) -> TransferKind {
        match self {
            Payload::Fungible { .. } => TransferKind::Fungible,
            Payload::NonFungible { .. } => TransferKind::NonFungible,
            Payload::Generic { .. } => TransferKind::Generic,
        }
    }

    /// 以有序字节数组形式返回载荷：
    /// 同质化 `[amount, recipient]`，非同质化 `[tokenId, recipient, metadata]`，
    /// 通用 `[dataHash]`。数值为最短大端编码
    pub fn buffers(&self) -> Vec<Vec<u8>> {
        match self {
            Payload::Fungible { amount, recipient } => {
                vec![u256_to_minimal_be(amount), recipient.clone()]
            }
            Payload::NonFungible {
                token_id,
                recipient,
                metadata,
            } => vec![
                u256_to_minimal_be(token_id),
                recipient.clone(),
                metadata.clone(),
            ],
            Payload::Generic { data_hash } => vec![data_hash.as_bytes().to_vec()],
        }
    }
}

/// 跨链消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub source: ChainId,
    pub destination: ChainId,
    pub deposit_nonce: u64,
    pub resource_id: ResourceId,
    pub payload: Payload,
}

impl Message {
    pub fn kind(&self) -> TransferKind {
        self.payload.kind()
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            source: self.source,
            deposit_nonce: self.deposit_nonce,
            resource_id: self.resource_id,
        }
    }
}

/// 消息的幂等键，键相同即为同一笔存款
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub source: ChainId,
    pub deposit_nonce: u64,
    pub resource_id: ResourceId,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source, self.deposit_nonce, self.resource_id
        )
    }
}

/// 由 [`crate::chain_adapter::TxFabric`] 构造的未签名交易，
/// `to == None` 表示部署合约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub to: Option<H160>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: U256,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub status: bool,
    pub contract_address: Option<H160>,
    pub gas_used: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: H256,
    pub transactions: Vec<H256>,
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| Error::Serialization(format!("invalid hex {}: {}", s, e)))
}

pub fn parse_address(s: &str) -> Result<H160> {
    let bytes = decode_hex(s)?;
    if bytes.len() != 20 {
        return Err(Error::Serialization(format!("invalid address: {}", s)));
    }
    Ok(H160::from_slice(&bytes))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let bytes = decode_hex(s)?;
    if bytes.len() != 32 {
        return Err(Error::Serialization(format!("invalid 32-byte hash: {}", s)));
    }
    Ok(H256::from_slice(&bytes))
}

fn u256_to_minimal_be(value: &U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(32);
    buf[first..].to_vec()
}
