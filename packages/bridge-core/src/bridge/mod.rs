//! 桥合约访问：目标链上的提案查询与投票，源链上的存款

use async_trait::async_trait;
use log::debug;
use primitive_types::{H160, H256, U256};
use std::sync::Arc;

use crate::abi::{self, Token};
use crate::chain_adapter::{ChainClient, TxFabric};
use crate::proposal::{Proposal, ProposalStatus};
use crate::retry::{retry, RetryPolicy};
use crate::transactor::{transact, Submitted, TxOptions};
use crate::types::{ChainId, Message, ResourceId, Transaction};
use crate::Result;

pub mod erc20;

pub const VOTE_PROPOSAL: &str = "voteProposal(uint8,uint64,bytes32,bytes32)";
pub const EXECUTE_PROPOSAL: &str = "executeProposal(uint8,uint64,bytes,bytes32)";
pub const GET_PROPOSAL: &str = "getProposal(uint8,uint64,bytes32)";
pub const HAS_VOTED: &str = "_hasVotedOnProposal(uint72,bytes32,address)";
pub const DEPOSIT: &str = "deposit(uint8,bytes32,bytes)";

/// 函数指针形式的 [`TxFabric`]，便于存放在结构体中
pub type FabricFn = fn(u64, Option<H160>, U256, u64, U256, Vec<u8>) -> Transaction;

/// 路由器在目标链桥合约上需要的操作
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeContract: Send + Sync {
    /// 桥合约所在链
    fn chain_id(&self) -> ChainId;

    /// 本中继者投票使用的账户
    fn relayer(&self) -> H160;

    /// 不存在的提案返回无投票的 `Inactive`
    async fn get_proposal(
        &self,
        source: ChainId,
        deposit_nonce: u64,
        data_hash: H256,
    ) -> Result<Proposal>;

    async fn has_voted(
        &self,
        source: ChainId,
        deposit_nonce: u64,
        data_hash: H256,
        relayer: H160,
    ) -> Result<bool>;

    async fn vote_proposal(&self, message: &Message, data_hash: H256) -> Result<H256>;

    async fn execute_proposal(&self, message: &Message, call_data: Vec<u8>) -> Result<H256>;

    async fn current_block(&self) -> Result<u64>;
}

pub fn prepare_vote_proposal_input(
    source: ChainId,
    deposit_nonce: u64,
    resource_id: ResourceId,
    data_hash: H256,
) -> Vec<u8> {
    abi::encode_call(
        VOTE_PROPOSAL,
        &[
            Token::Uint(U256::from(source)),
            Token::Uint(U256::from(deposit_nonce)),
            Token::FixedBytes(resource_id.0.to_vec()),
            Token::FixedBytes(data_hash.as_bytes().to_vec()),
        ],
    )
}

pub fn prepare_execute_proposal_input(
    source: ChainId,
    deposit_nonce: u64,
    call_data: Vec<u8>,
    resource_id: ResourceId,
) -> Vec<u8> {
    abi::encode_call(
        EXECUTE_PROPOSAL,
        &[
            Token::Uint(U256::from(source)),
            Token::Uint(U256::from(deposit_nonce)),
            Token::Bytes(call_data),
            Token::FixedBytes(resource_id.0.to_vec()),
        ],
    )
}

pub fn prepare_get_proposal_input(source: ChainId, deposit_nonce: u64, data_hash: H256) -> Vec<u8> {
    abi::encode_call(
        GET_PROPOSAL,
        &[
            Token::Uint(U256::from(source)),
            Token::Uint(U256::from(deposit_nonce)),
            Token::FixedBytes(data_hash.as_bytes().to_vec()),
        ],
    )
}

/// 投票以 `(depositNonce << 8) | chainId` 为键
pub fn prepare_has_voted_input(
    source: ChainId,
    deposit_nonce: u64,
    data_hash: H256,
    relayer: H160,
) -> Vec<u8> {
    let nonce_and_id = U256::from(deposit_nonce) * U256::from(256u32) + U256::from(source);
    abi::encode_call(
        HAS_VOTED,
        &[
            Token::Uint(nonce_and_id),
            Token::FixedBytes(data_hash.as_bytes().to_vec()),
            Token::Address(relayer),
        ],
    )
}

pub fn prepare_deposit_input(destination: ChainId, resource_id: ResourceId, data: Vec<u8>) -> Vec<u8> {
    abi::encode_call(
        DEPOSIT,
        &[
            Token::Uint(U256::from(destination)),
            Token::FixedBytes(resource_id.0.to_vec()),
            Token::Bytes(data),
        ],
    )
}

/// 解码 `getProposal` 返回数据：
/// `(uint8 status, uint200 yesVotes, uint8 yesVotesTotal, uint40 proposedBlock)`.
pub fn decode_proposal(data: &[u8], data_hash: H256) -> Result<Proposal> {
    if data.is_empty() {
        return Ok(Proposal::inactive(data_hash));
    }
    let status = abi::decode_uint(data, 0)?;
    let status = ProposalStatus::try_from(status.low_u64().min(u8::MAX as u64) as u8)?;
    let vote_count = abi::decode_uint(data, 2)?.low_u32();
    let proposed_block = abi::decode_uint(data, 3)?.low_u64();
    Ok(Proposal {
        status,
        vote_count,
        data_hash,
        proposed_block,
    })
}

/// 基于任意链客户端、按桥合约 ABI 实现的 [`BridgeContract`]
pub struct EvmBridge<C: ?Sized, F> {
    client: Arc<C>,
    fabric: F,
    address: H160,
    read_policy: RetryPolicy,
    tx_options: TxOptions,
}

impl<C, F> EvmBridge<C, F>
where
    C: ChainClient + ?Sized,
    F: TxFabric,
{
    pub fn new(client: Arc<C>, fabric: F, address: H160) -> Self {
        Self {
            client,
            fabric,
            address,
            read_policy: RetryPolicy::default(),
            tx_options: TxOptions::default(),
        }
    }

    pub fn with_read_policy(mut self, policy: RetryPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_tx_options(mut self, options: TxOptions) -> Self {
        self.tx_options = options;
        self
    }

    pub fn address(&self) -> H160 {
        self.address
    }

    async fn read(&self, label: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        retry(&self.read_policy, label, || {
            self.client.call(self.address, &data, None)
        })
        .await
    }
}

#[async_trait]
impl<C, F> BridgeContract for EvmBridge<C, F>
where
    C: ChainClient + ?Sized,
    F: TxFabric,
{
    fn chain_id(&self) -> ChainId {
        self.client.chain_id()
    }

    fn relayer(&self) -> H160 {
        self.client.from()
    }

    async fn get_proposal(
        &self,
        source: ChainId,
        deposit_nonce: u64,
        data_hash: H256,
    ) -> Result<Proposal> {
        let input = prepare_get_proposal_input(source, deposit_nonce, data_hash);
        let output = self.read("getProposal", input).await?;
        let proposal = decode_proposal(&output, data_hash)?;
        debug!(
            "chain={} proposal {}/{} {:?}: status={} votes={}",
            self.chain_id(),
            source,
            deposit_nonce,
            data_hash,
            proposal.status,
            proposal.vote_count
        );
        Ok(proposal)
    }

    async fn has_voted(
        &self,
        source: ChainId,
        deposit_nonce: u64,
        data_hash: H256,
        relayer: H160,
    ) -> Result<bool> {
        let input = prepare_has_voted_input(source, deposit_nonce, data_hash, relayer);
        let output = self.read("hasVoted", input).await?;
        if output.is_empty() {
            return Ok(false);
        }
        abi::decode_bool(&output, 0)
    }

    async fn vote_proposal(&self, message: &Message, data_hash: H256) -> Result<H256> {
        let input = prepare_vote_proposal_input(
            message.source,
            message.deposit_nonce,
            message.resource_id,
            data_hash,
        );
        let submitted = transact(
            self.client.as_ref(),
            &self.fabric,
            Some(self.address),
            input,
            &self.tx_options,
        )
        .await?;
        Ok(submitted.hash)
    }

    async fn execute_proposal(&self, message: &Message, call_data: Vec<u8>) -> Result<H256> {
        let input = prepare_execute_proposal_input(
            message.source,
            message.deposit_nonce,
            call_data,
            message.resource_id,
        );
        let submitted = transact(
            self.client.as_ref(),
            &self.fabric,
            Some(self.address),
            input,
            &self.tx_options,
        )
        .await?;
        Ok(submitted.hash)
    }

    async fn current_block(&self) -> Result<u64> {
        retry(&self.read_policy, "blockNumber", || self.client.block_number()).await
    }
}

/// 在源链桥合约上向 `destination` 存入 `data`
#[allow(clippy::too_many_arguments)]
pub async fn deposit<C, F>(
    client: &C,
    fabric: &F,
    bridge: H160,
    destination: ChainId,
    resource_id: ResourceId,
    data: Vec<u8>,
    opts: &TxOptions,
) -> Result<Submitted>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    let input = prepare_deposit_input(destination, resource_id, data);
    transact(client, fabric, Some(bridge), input, opts).await
}
