//! 带模拟桥合约的内存链，可供任意数量的中继账户共用

use async_trait::async_trait;
use primitive_types::{H160, H256, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::abi::{self, Token};
use crate::bridge::{EXECUTE_PROPOSAL, GET_PROPOSAL, HAS_VOTED, VOTE_PROPOSAL};
use crate::chain_adapter::{ChainClient, NonceManager};
use crate::codec::data_hash;
use crate::proposal::ProposalStatus;
use crate::retry::RetryPolicy;
use crate::types::{Block, ChainId, Log, Receipt, Transaction};
use crate::{Error, Result};

pub(crate) const BRIDGE: H160 = H160([0xbe; 20]);

#[derive(Debug, Clone)]
pub(crate) struct SimProposal {
    pub status: ProposalStatus,
    pub voters: Vec<H160>,
    pub proposed_block: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ChainState {
    pub block: u64,
    pub threshold: usize,
    pub gas_price: U256,
    account_nonces: HashMap<H160, u64>,
    broadcasts: Vec<(H160, u64)>,
    receipts: HashMap<H256, Receipt>,
    blocks: HashMap<u64, Vec<H256>>,
    pub code: HashMap<H160, Vec<u8>>,
    pub proposals: HashMap<(ChainId, u64, H256), SimProposal>,
    pub executed: Vec<(ChainId, u64, Vec<u8>)>,
    pub logs: Vec<Log>,
    /// 部署合约地址上留下的代码
    pub deploy_code: Vec<u8>,
    /// 接下来 N 次发送返回 `RpcUnavailable`
    pub fail_sends: u32,
    /// 接下来 N 次回执查询返回 `RpcUnavailable`
    pub fail_receipts: u32,
    /// 接下来 N 次桥合约读取返回 `RpcUnavailable`
    pub fail_calls: u32,
    pub never_mine: bool,
    pub revert_next: bool,
    pub receipt_delay_polls: u32,
    pub receipt_polls: u32,
}

impl ChainState {
    pub fn set_account_nonce(&mut self, account: H160, nonce: u64) {
        self.account_nonces.insert(account, nonce);
    }

    /// `account` 每笔被接受广播的 nonce，按广播顺序
    pub fn broadcast_nonces(&self, account: H160) -> Vec<u64> {
        self.broadcasts
            .iter()
            .filter(|(from, _)| *from == account)
            .map(|(_, nonce)| *nonce)
            .collect()
    }

    pub fn proposal(&self, source: ChainId, nonce: u64, hash: H256) -> Option<&SimProposal> {
        self.proposals.get(&(source, nonce, hash))
    }

    fn apply(&mut self, from: H160, tx: &Transaction) -> bool {
        match tx.to {
            None => {
                if !self.deploy_code.is_empty() {
                    let address = abi::create_address(from, tx.nonce);
                    self.code.insert(address, self.deploy_code.clone());
                }
                true
            }
            Some(to) if to == BRIDGE => self.apply_bridge(from, &tx.data),
            Some(_) => true,
        }
    }

    fn apply_bridge(&mut self, from: H160, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let (selector, args) = data.split_at(4);
        if selector == abi::selector(VOTE_PROPOSAL) {
            let (Ok(source), Ok(nonce), Ok(hash)) = (
                abi::decode_uint(args, 0),
                abi::decode_uint(args, 1),
                abi::decode_word(args, 3),
            ) else {
                return false;
            };
            let key = (source.low_u64() as u8, nonce.low_u64(), H256::from(hash));
            let block = self.block;
            let threshold = self.threshold.max(1);
            let proposal = self.proposals.entry(key).or_insert(SimProposal {
                status: ProposalStatus::Active,
                voters: Vec::new(),
                proposed_block: block,
            });
            if proposal.status != ProposalStatus::Active || proposal.voters.contains(&from) {
                return false;
            }
            proposal.voters.push(from);
            if proposal.voters.len() >= threshold {
                proposal.status = ProposalStatus::Passed;
            }
            true
        } else if selector == abi::selector(EXECUTE_PROPOSAL) {
            let (Ok(source), Ok(nonce), Ok(call_data)) = (
                abi::decode_uint(args, 0),
                abi::decode_uint(args, 1),
                abi::decode_bytes(args, 2),
            ) else {
                return false;
            };
            let key = (
                source.low_u64() as u8,
                nonce.low_u64(),
                data_hash(&call_data),
            );
            match self.proposals.get_mut(&key) {
                Some(p) if p.status == ProposalStatus::Passed => {
                    p.status = ProposalStatus::Executed;
                    self.executed.push((key.0, key.1, call_data));
                    true
                }
                _ => false,
            }
        } else {
            true
        }
    }

    fn bridge_call(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < 4 {
            return Vec::new();
        }
        let (selector, args) = data.split_at(4);
        if selector == abi::selector(GET_PROPOSAL) {
            let source = abi::decode_uint(args, 0).map(|v| v.low_u64() as u8).unwrap_or_default();
            let nonce = abi::decode_uint(args, 1).map(|v| v.low_u64()).unwrap_or_default();
            let hash = abi::decode_word(args, 2).map(H256::from).unwrap_or_default();
            let (status, votes, block) = match self.proposal(source, nonce, hash) {
                Some(p) => (p.status as u8, p.voters.len(), p.proposed_block),
                None => (0, 0, 0),
            };
            abi::encode(&[
                Token::Uint(U256::from(status)),
                Token::Uint(U256::from((1u64 << votes) - 1)),
                Token::Uint(U256::from(votes)),
                Token::Uint(U256::from(block)),
            ])
        } else if selector == abi::selector(HAS_VOTED) {
            let nonce_and_id = abi::decode_uint(args, 0).unwrap_or_default();
            let hash = abi::decode_word(args, 1).map(H256::from).unwrap_or_default();
            let voter = abi::decode_address(args, 2).unwrap_or_default();
            let source = (nonce_and_id.low_u64() & 0xff) as u8;
            let nonce = (nonce_and_id.low_u128() >> 8) as u64;
            let voted = self
                .proposal(source, nonce, hash)
                .map(|p| p.voters.contains(&voter))
                .unwrap_or(false);
            abi::encode(&[Token::Bool(voted)])
        } else {
            Vec::new()
        }
    }
}

/// 连接到共享内存链的单个中继账户
pub(crate) struct MemoryChain {
    chain_id: ChainId,
    from: H160,
    shared: Arc<Mutex<ChainState>>,
    nonce: NonceManager,
    receipt_policy: RetryPolicy,
}

impl MemoryChain {
    pub fn new(from: H160) -> Self {
        let state = ChainState {
            block: 1,
            threshold: 1,
            gas_price: U256::from(20u64),
            ..ChainState::default()
        };
        Self {
            chain_id: 2,
            from,
            shared: Arc::new(Mutex::new(state)),
            nonce: NonceManager::new(),
            receipt_policy: RetryPolicy::immediate(5),
        }
    }

    pub fn with_chain_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_receipt_policy(mut self, policy: RetryPolicy) -> Self {
        self.receipt_policy = policy;
        self
    }

    /// 同一条链上的另一个账户
    pub fn connect(&self, from: H160) -> Self {
        Self {
            chain_id: self.chain_id,
            from,
            shared: self.shared.clone(),
            nonce: NonceManager::new(),
            receipt_policy: self.receipt_policy.clone(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ChainState> {
        self.shared.lock().unwrap()
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    fn chain_type(&self) -> &str {
        "memory"
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn from(&self) -> H160 {
        self.from
    }

    fn nonce_manager(&self) -> &NonceManager {
        &self.nonce
    }

    fn receipt_policy(&self) -> &RetryPolicy {
        &self.receipt_policy
    }

    async fn gas_price(&self) -> Result<U256> {
        Ok(self.state().gas_price)
    }

    async fn pending_nonce(&self) -> Result<u64> {
        Ok(*self.state().account_nonces.get(&self.from).unwrap_or(&0))
    }

    async fn sign_and_send_transaction(&self, tx: &Transaction) -> Result<H256> {
        let mut state = self.state();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(Error::RpcUnavailable("connection refused".into()));
        }
        let expected = *state.account_nonces.get(&self.from).unwrap_or(&0);
        if tx.nonce < expected {
            return Err(Error::Rejected("nonce too low".into()));
        }
        if tx.nonce > expected {
            return Err(Error::Rejected(format!(
                "nonce gap: got {}, expected {}",
                tx.nonce, expected
            )));
        }
        state.account_nonces.insert(self.from, expected + 1);
        state.broadcasts.push((self.from, tx.nonce));

        let mut preimage = self.from.as_bytes().to_vec();
        preimage.extend_from_slice(&tx.nonce.to_be_bytes());
        let hash = abi::keccak256(&preimage);

        let reverted = std::mem::take(&mut state.revert_next);
        let status = !reverted && state.apply(self.from, tx);
        state.block += 1;
        let block = state.block;
        state.blocks.entry(block).or_default().push(hash);
        let contract_address = match tx.to {
            None => Some(abi::create_address(self.from, tx.nonce)),
            Some(_) => None,
        };
        state.receipts.insert(
            hash,
            Receipt {
                transaction_hash: hash,
                block_number: block,
                status,
                contract_address,
                gas_used: U256::from(21_000u64),
            },
        );
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>> {
        let mut state = self.state();
        state.receipt_polls += 1;
        if state.fail_receipts > 0 {
            state.fail_receipts -= 1;
            return Err(Error::RpcUnavailable("connection reset".into()));
        }
        if state.never_mine {
            return Ok(None);
        }
        if state.receipt_delay_polls > 0 {
            state.receipt_delay_polls -= 1;
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn code_at(&self, address: H160, _block: Option<u64>) -> Result<Vec<u8>> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }

    async fn call(&self, to: H160, data: &[u8], _block: Option<u64>) -> Result<Vec<u8>> {
        let mut state = self.state();
        if state.fail_calls > 0 {
            state.fail_calls -= 1;
            return Err(Error::RpcUnavailable("connection refused".into()));
        }
        if to == BRIDGE {
            Ok(state.bridge_call(data))
        } else {
            Ok(Vec::new())
        }
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.state().block)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let state = self.state();
        if number > state.block {
            return Ok(None);
        }
        Ok(Some(Block {
            number,
            hash: H256::from_low_u64_be(number),
            transactions: state.blocks.get(&number).cloned().unwrap_or_default(),
        }))
    }

    async fn fetch_event_logs(
        &self,
        contract: H160,
        event: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>> {
        let topic = abi::event_topic(event);
        Ok(self
            .state()
            .logs
            .iter()
            .filter(|log| {
                log.address == contract
                    && log.topics.first() == Some(&topic)
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }
}
