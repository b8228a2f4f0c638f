//! 源链存款事件、[`Message`] 与目标链 handler 调用数据之间的转换
//!
//! 存款数据（`deposit` 的 `bytes data` 参数）按转账类型布局：
//!
//! - 同质化: `amount (32) || len(recipient) (32) || recipient`
//! - 非同质化: `tokenId (32) || len(recipient) (32) || recipient || len(metadata) (32) || metadata`
//! - 通用: `len(hash) (32) || hash (32)`
//!
//! 提案调用数据由目标链 handler 解码，中继者对其哈希投票，
//! 因此 [`encode_proposal_data`] 的输出必须逐字节稳定

pub mod substrate;

use primitive_types::{H160, H256, U256};
use std::collections::HashMap;

use crate::abi::{self, left_pad_32, uint_word};
use crate::types::{ChainId, Log, Message, Payload, ResourceId, TransferKind};
use crate::{Error, Result};

pub const DEPOSIT_EVENT: &str = "Deposit(uint8,bytes32,uint64,bytes)";

/// 按给定转账类型将桥合约 `Deposit` 日志解码为 [`Message`]
pub fn decode_deposit(source: ChainId, kind: TransferKind, log: &Log) -> Result<Message> {
    if log.topics.len() != 4 || log.topics[0] != abi::event_topic(DEPOSIT_EVENT) {
        return Err(Error::MalformedEvent(format!(
            "not a deposit event (tx {:?}, {} topics)",
            log.transaction_hash,
            log.topics.len()
        )));
    }
    let destination = topic_to_u64(&log.topics[1], u8::MAX as u64, "destination chain id")? as u8;
    let resource_id = ResourceId(log.topics[2].to_fixed_bytes());
    let deposit_nonce = topic_to_u64(&log.topics[3], u64::MAX, "deposit nonce")?;

    let data = abi::decode_bytes(&log.data, 0)
        .map_err(|e| Error::MalformedEvent(format!("deposit data: {}", e)))?;
    let payload = decode_deposit_data(kind, &data)?;

    Ok(Message {
        source,
        destination,
        deposit_nonce,
        resource_id,
        payload,
    })
}

/// 解码前按资源标识确定转账类型
#[derive(Debug, Clone)]
pub struct DepositDecoder {
    source: ChainId,
    kinds: HashMap<ResourceId, TransferKind>,
}

impl DepositDecoder {
    pub fn new(source: ChainId, kinds: HashMap<ResourceId, TransferKind>) -> Self {
        Self { source, kinds }
    }

    pub fn decode(&self, log: &Log) -> Result<Message> {
        let resource_id = log
            .topics
            .get(2)
            .map(|t| ResourceId(t.to_fixed_bytes()))
            .ok_or_else(|| Error::MalformedEvent("deposit event without resource id".into()))?;
        let kind = self.kinds.get(&resource_id).copied().ok_or_else(|| {
            Error::MalformedEvent(format!("unknown resource id {}", resource_id))
        })?;
        decode_deposit(self.source, kind, log)
    }
}

pub fn decode_deposit_data(kind: TransferKind, data: &[u8]) -> Result<Payload> {
    let mut reader = Reader::new(data);
    let payload = match kind {
        TransferKind::Fungible => {
            let amount = reader.word()?;
            let recipient = reader.sized(32)?;
            Payload::Fungible { amount, recipient }
        }
        TransferKind::NonFungible => {
            let token_id = reader.word()?;
            let recipient = reader.sized(32)?;
            let metadata = reader.sized(usize::MAX)?;
            Payload::NonFungible {
                token_id,
                recipient,
                metadata,
            }
        }
        TransferKind::Generic => {
            let hash = reader.sized(32)?;
            if hash.len() != 32 {
                return Err(Error::MalformedEvent(format!(
                    "generic deposit carries {} bytes, expected a 32-byte hash",
                    hash.len()
                )));
            }
            Payload::Generic {
                data_hash: H256::from_slice(&hash),
            }
        }
    };
    if !reader.is_empty() {
        return Err(Error::MalformedEvent(format!(
            "{} trailing bytes in {} deposit data",
            reader.remaining(),
            kind
        )));
    }
    Ok(payload)
}

/// 目标链 handler 的调用数据，同一消息的结果恒定
pub fn encode_proposal_data(message: &Message) -> Result<Vec<u8>> {
    match &message.payload {
        Payload::Fungible { amount, recipient } => {
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&uint_word(*amount));
            data.extend_from_slice(&pad_recipient(recipient)?);
            Ok(data)
        }
        Payload::NonFungible {
            token_id,
            recipient,
            metadata,
        } => {
            let mut data = Vec::with_capacity(96 + metadata.len());
            data.extend_from_slice(&uint_word(*token_id));
            data.extend_from_slice(&pad_recipient(recipient)?);
            data.extend_from_slice(&uint_word(U256::from(metadata.len())));
            data.extend_from_slice(metadata);
            Ok(data)
        }
        Payload::Generic { data_hash } => Ok(data_hash.as_bytes().to_vec()),
    }
}

pub fn data_hash(call_data: &[u8]) -> H256 {
    abi::keccak256(call_data)
}

fn pad_recipient(recipient: &[u8]) -> Result<[u8; 32]> {
    left_pad_32(recipient).ok_or_else(|| {
        Error::MalformedMessage(format!(
            "recipient of {} bytes does not fit a 32-byte word",
            recipient.len()
        ))
    })
}

pub fn construct_erc20_deposit_data(recipient: &[u8], amount: U256) -> Vec<u8> {
    let mut data = uint_word(amount).to_vec();
    data.extend_from_slice(&uint_word(U256::from(recipient.len())));
    data.extend_from_slice(recipient);
    data
}

pub fn construct_erc721_deposit_data(token_id: U256, recipient: &[u8], metadata: &[u8]) -> Vec<u8> {
    let mut data = uint_word(token_id).to_vec();
    data.extend_from_slice(&uint_word(U256::from(recipient.len())));
    data.extend_from_slice(recipient);
    data.extend_from_slice(&uint_word(U256::from(metadata.len())));
    data.extend_from_slice(metadata);
    data
}

pub fn construct_generic_deposit_data(hash: H256) -> Vec<u8> {
    let mut data = uint_word(U256::from(32u8)).to_vec();
    data.extend_from_slice(hash.as_bytes());
    data
}

/// EVM 地址在存款数据中的接收者字节
pub fn recipient_bytes(address: H160) -> Vec<u8> {
    address.as_bytes().to_vec()
}

fn topic_to_u64(topic: &H256, max: u64, what: &str) -> Result<u64> {
    let value = U256::from_big_endian(topic.as_bytes());
    if value > U256::from(max) {
        return Err(Error::MalformedEvent(format!("{} out of range: {}", what, value)));
    }
    Ok(value.low_u64())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let chunk = &self.data[self.pos..end];
                self.pos = end;
                Ok(chunk)
            }
            None => Err(Error::MalformedEvent(format!(
                "deposit data truncated: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.data.len()
            ))),
        }
    }

    fn word(&mut self) -> Result<U256> {
        Ok(U256::from_big_endian(self.take(32)?))
    }

    /// 带长度前缀的字节串，最多 `max` 字节
    fn sized(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.word()?;
        if len > U256::from(max.min(u32::MAX as usize)) {
            return Err(Error::MalformedEvent(format!("length prefix {} too large", len)));
        }
        Ok(self.take(len.as_usize())?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
