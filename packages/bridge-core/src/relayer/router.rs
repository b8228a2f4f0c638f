//! 单条目标链的中继路由器
//!
//! 每轮先并发读取所有待处理消息的链上提案，再逐条提交投票或执行交易。
//! 消息会一直留在队列中，直到提案被执行、取消或过期，或者遇到永久性错误

use futures::future::join_all;
use log::{debug, error, info, warn};
use primitive_types::H256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::bridge::BridgeContract;
use crate::codec::{data_hash, encode_proposal_data};
use crate::proposal::{should_execute, should_vote, Proposal, ProposalStatus, ProposalTracker};
use crate::types::{ChainId, Message, MessageKey};
use crate::Result;

/// 一轮处理对消息的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Voted(H256),
    Executed(H256),
    /// 已投票，等待其他中继者
    Waiting,
    /// 提案已到终态
    Finished(ProposalStatus),
    Expired,
    /// 永久性错误，丢弃消息
    Dropped,
    /// 瞬时错误，下一轮重试
    Requeued,
}

impl Step {
    fn keeps_pending(&self) -> bool {
        matches!(
            self,
            Step::Voted(_) | Step::Waiting | Step::Requeued
        )
    }
}

struct ProposalView {
    call_data: Vec<u8>,
    proposal: Proposal,
    voted: bool,
}

pub struct Router<B: ?Sized> {
    bridge: Arc<B>,
    tracker: ProposalTracker,
    pending: VecDeque<Message>,
    /// 每条源链已接收的最大存款 nonce
    accepted: HashMap<ChainId, u64>,
    proposal_expiry: u64,
}

impl<B> Router<B>
where
    B: BridgeContract + ?Sized,
{
    pub fn new(bridge: Arc<B>, proposal_expiry: u64) -> Self {
        Self {
            bridge,
            tracker: ProposalTracker::new(),
            pending: VecDeque::new(),
            accepted: HashMap::new(),
            proposal_expiry,
        }
    }

    /// 存款 nonce 大于该源链已接收的最大值时才入队。
    /// 存款 nonce 按源链和目标链递增，监听器按顺序投递
    pub fn submit(&mut self, message: Message) -> bool {
        if message.destination != self.bridge.chain_id() {
            warn!(
                "chain={} ignoring message {} for chain {}",
                self.bridge.chain_id(),
                message.key(),
                message.destination
            );
            return false;
        }
        let last = self.accepted.get(&message.source).copied();
        if last.map_or(false, |last| message.deposit_nonce <= last) {
            debug!(
                "chain={} duplicate message {}",
                self.bridge.chain_id(),
                message.key()
            );
            return false;
        }
        self.accepted.insert(message.source, message.deposit_nonce);
        self.pending.push_back(message);
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn view(&self, message: &Message) -> Result<ProposalView> {
        let call_data = encode_proposal_data(message)?;
        let hash = data_hash(&call_data);
        let proposal = self
            .bridge
            .get_proposal(message.source, message.deposit_nonce, hash)
            .await?;
        let voted = match proposal.status {
            ProposalStatus::Inactive | ProposalStatus::Active
                if !self.tracker.has_voted(&message.key(), hash) =>
            {
                self.bridge
                    .has_voted(
                        message.source,
                        message.deposit_nonce,
                        hash,
                        self.bridge.relayer(),
                    )
                    .await?
            }
            _ => self.tracker.has_voted(&message.key(), hash),
        };
        Ok(ProposalView {
            call_data,
            proposal,
            voted,
        })
    }

    async fn act(&mut self, message: &Message, view: ProposalView, current_block: u64) -> Result<Step> {
        let ProposalView {
            call_data,
            proposal,
            voted,
        } = view;
        let key = message.key();
        let hash = proposal.data_hash;
        self.tracker.observe(key, proposal.clone());

        if proposal.status.is_terminal() {
            return Ok(Step::Finished(proposal.status));
        }
        if proposal.is_expired(current_block, self.proposal_expiry) {
            return Ok(Step::Expired);
        }
        if should_execute(&proposal) {
            let tx = self.bridge.execute_proposal(message, call_data).await?;
            return Ok(Step::Executed(tx));
        }
        if should_vote(&proposal, voted) {
            let tx = self.bridge.vote_proposal(message, hash).await?;
            self.tracker.record_vote(key, hash);
            return Ok(Step::Voted(tx));
        }
        if voted {
            self.tracker.record_vote(key, hash);
        }
        Ok(Step::Waiting)
    }

    /// 处理一轮待处理队列，返回每条消息的结果
    pub async fn poll(&mut self) -> Vec<(MessageKey, Step)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let chain = self.bridge.chain_id();
        let batch: Vec<Message> = self.pending.drain(..).collect();

        let current_block = if self.proposal_expiry > 0 {
            match self.bridge.current_block().await {
                Ok(block) => block,
                Err(e) => {
                    warn!("chain={} block number unavailable: {}", chain, e);
                    self.pending.extend(batch);
                    return Vec::new();
                }
            }
        } else {
            0
        };

        // 并发读取提案状态
        let views = join_all(batch.iter().map(|message| self.view(message))).await;

        // 逐条提交，交易按 nonce 顺序发出
        let mut steps = Vec::with_capacity(batch.len());
        for (message, view) in batch.into_iter().zip(views) {
            let key = message.key();
            let result = match view {
                Ok(view) => self.act(&message, view, current_block).await,
                Err(e) => Err(e),
            };
            let step = match result {
                Ok(step) => step,
                Err(e) if e.is_permanent() => {
                    error!("chain={} dropping message {}: {}", chain, key, e);
                    Step::Dropped
                }
                Err(e) => {
                    warn!("chain={} message {} requeued: {}", chain, key, e);
                    Step::Requeued
                }
            };
            match &step {
                Step::Voted(tx) => info!("chain={} message {} voted in {:?}", chain, key, tx),
                Step::Executed(tx) => {
                    info!("chain={} message {} executed in {:?}", chain, key, tx)
                }
                Step::Finished(status) => {
                    info!("chain={} message {} done: proposal {}", chain, key, status)
                }
                Step::Expired => warn!("chain={} message {} expired", chain, key),
                _ => {}
            }
            if step.keeps_pending() {
                self.pending.push_back(message);
            } else {
                self.tracker.forget(&key);
            }
            steps.push((key, step));
        }
        steps
    }

    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<Message>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(poll_interval);
        let mut open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = messages.recv(), if open => match message {
                    Some(message) => {
                        self.submit(message);
                    }
                    None => open = false,
                },
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
        info!(
            "chain={} router stopped with {} pending messages",
            self.bridge.chain_id(),
            self.pending.len()
        );
    }
}
