//! 目标链上单个跨链提案的生命周期
//!
//! ```text
//! Inactive --first vote--> Active --threshold votes--> Passed --execute--> Executed
//!                            \--expired--> Cancelled
//! ```
//!
//! 状态与投票以目标链桥合约为准，这里保存的只是链上查询结果的缓存

use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::abi;
use crate::types::{ChainId, Log, MessageKey, ResourceId};
use crate::{Error, Result};

/// 索引字段：源链、存款 nonce、状态；data：资源标识、数据哈希
pub const PROPOSAL_EVENT: &str = "ProposalEvent(uint8,uint64,uint8,bytes32,bytes32)";

/// 桥合约事件中的状态字节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProposalStatus {
    Inactive = 0,
    Active = 1,
    Passed = 2,
    Executed = 3,
    Cancelled = 4,
}

impl ProposalStatus {
    /// 不会再有投票或执行
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }
}

impl TryFrom<u8> for ProposalStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ProposalStatus::Inactive),
            1 => Ok(ProposalStatus::Active),
            2 => Ok(ProposalStatus::Passed),
            3 => Ok(ProposalStatus::Executed),
            4 => Ok(ProposalStatus::Cancelled),
            other => Err(Error::MalformedResponse(format!(
                "unknown proposal status {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub status: ProposalStatus,
    pub vote_count: u32,
    pub data_hash: H256,
    pub proposed_block: u64,
}

impl Proposal {
    /// 链上不存在的提案：尚无人投票
    pub fn inactive(data_hash: H256) -> Self {
        Self {
            status: ProposalStatus::Inactive,
            vote_count: 0,
            data_hash,
            proposed_block: 0,
        }
    }

    /// 超过 `expiry` 个区块仍处于 Active 的提案只能被取消，
    /// `expiry == 0` 时不检查
    pub fn is_expired(&self, current_block: u64, expiry: u64) -> bool {
        expiry > 0
            && self.status == ProposalStatus::Active
            && current_block.saturating_sub(self.proposed_block) > expiry
    }
}

pub fn should_vote(proposal: &Proposal, self_has_voted: bool) -> bool {
    matches!(
        proposal.status,
        ProposalStatus::Inactive | ProposalStatus::Active
    ) && !self_has_voted
}

pub fn should_execute(proposal: &Proposal) -> bool {
    proposal.status == ProposalStatus::Passed
}

/// 解码后的 `ProposalEvent` 状态变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalEvent {
    pub source: ChainId,
    pub deposit_nonce: u64,
    pub status: ProposalStatus,
    pub resource_id: ResourceId,
    pub data_hash: H256,
}

pub fn decode_proposal_event(log: &Log) -> Result<ProposalEvent> {
    if log.topics.len() != 4 || log.topics[0] != abi::event_topic(PROPOSAL_EVENT) {
        return Err(Error::MalformedEvent(format!(
            "not a proposal event (tx {:?})",
            log.transaction_hash
        )));
    }
    let source = small_topic(&log.topics[1], u8::MAX as u64)? as u8;
    let deposit_nonce = small_topic(&log.topics[2], u64::MAX)?;
    let status = ProposalStatus::try_from(small_topic(&log.topics[3], u8::MAX as u64)? as u8)
        .map_err(|e| Error::MalformedEvent(e.to_string()))?;
    let resource_id = abi::decode_word(&log.data, 0)
        .map(ResourceId)
        .map_err(|e| Error::MalformedEvent(e.to_string()))?;
    let data_hash = abi::decode_word(&log.data, 1)
        .map(H256::from)
        .map_err(|e| Error::MalformedEvent(e.to_string()))?;
    Ok(ProposalEvent {
        source,
        deposit_nonce,
        status,
        resource_id,
        data_hash,
    })
}

fn small_topic(topic: &H256, max: u64) -> Result<u64> {
    let value = U256::from_big_endian(topic.as_bytes());
    if value > U256::from(max) {
        return Err(Error::MalformedEvent(format!("topic value {} out of range", value)));
    }
    Ok(value.low_u64())
}

/// 单个中继者在某条目标链上处理中的提案视图
///
/// 投票按消息记录，因为载荷相同、nonce 不同的存款数据哈希相同。
/// 状态缓存仅供参考，每次链上查询都会覆盖。消息处理完毕后由
/// [`ProposalTracker::forget`] 一并清除
#[derive(Debug, Default)]
pub struct ProposalTracker {
    voted: HashMap<MessageKey, H256>,
    cache: HashMap<MessageKey, Proposal>,
}

impl ProposalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_voted(&self, key: &MessageKey, data_hash: H256) -> bool {
        self.voted.get(key) == Some(&data_hash)
    }

    pub fn record_vote(&mut self, key: MessageKey, data_hash: H256) {
        self.voted.insert(key, data_hash);
    }

    pub fn observe(&mut self, key: MessageKey, proposal: Proposal) {
        self.cache.insert(key, proposal);
    }

    pub fn cached(&self, key: &MessageKey) -> Option<&Proposal> {
        self.cache.get(key)
    }

    pub fn forget(&mut self, key: &MessageKey) {
        self.cache.remove(key);
        self.voted.remove(key);
    }

    /// 没有缓存，也没有投票记录
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.voted.is_empty()
    }
}
