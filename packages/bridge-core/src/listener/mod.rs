//! 源链存款监听器
//!
//! 扫描源链已确认区块中的桥合约 `Deposit` 日志，解码后交给目标链的路由器。
//! 配置 [`Blockstore`] 后，最后扫描的区块在重启后仍然保留

mod blockstore;

pub use blockstore::Blockstore;

use log::{debug, error, info, warn};
use primitive_types::H160;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::chain_adapter::ChainClient;
use crate::codec::{DepositDecoder, DEPOSIT_EVENT};
use crate::config::ChainConfig;
use crate::retry::{retry, RetryPolicy};
use crate::types::{parse_address, ChainId, Message};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub bridge: H160,
    pub start_block: u64,
    pub block_confirmations: u64,
    pub max_block_range: u64,
    /// 从链头开始而非 `start_block`
    pub latest_block: bool,
    /// 选择起始区块时忽略 blockstore
    pub fresh_start: bool,
}

impl ListenerSettings {
    pub fn from_config(config: &ChainConfig) -> Result<Self> {
        Ok(Self {
            bridge: parse_address(&config.bridge_address)?,
            start_block: config.start_block,
            block_confirmations: config.block_confirmations,
            max_block_range: config.max_block_range.max(1),
            latest_block: config.latest_block,
            fresh_start: config.fresh_start,
        })
    }
}

pub struct Listener<C: ?Sized> {
    client: Arc<C>,
    settings: ListenerSettings,
    decoder: DepositDecoder,
    routes: HashMap<ChainId, mpsc::Sender<Message>>,
    policy: RetryPolicy,
    blockstore: Option<Blockstore>,
    cursor: Option<u64>,
}

impl<C> Listener<C>
where
    C: ChainClient + ?Sized,
{
    pub fn new(
        client: Arc<C>,
        settings: ListenerSettings,
        decoder: DepositDecoder,
        routes: HashMap<ChainId, mpsc::Sender<Message>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            settings,
            decoder,
            routes,
            policy,
            blockstore: None,
            cursor: None,
        }
    }

    pub fn with_blockstore(mut self, blockstore: Blockstore) -> Self {
        self.blockstore = Some(blockstore);
        self
    }

    /// 下一个待扫描区块
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    async fn head(&self) -> Result<u64> {
        let latest = retry(&self.policy, "blockNumber", || self.client.block_number()).await?;
        Ok(latest.saturating_sub(self.settings.block_confirmations))
    }

    async fn start_cursor(&self) -> Result<u64> {
        if self.settings.latest_block {
            return self.head().await;
        }
        let start = self.settings.start_block;
        match &self.blockstore {
            Some(store) if !self.settings.fresh_start => {
                let resume = store.get_last_block_number().await?.map(|last| last + 1);
                Ok(resume.map_or(start, |resume| resume.max(start)))
            }
            _ => Ok(start),
        }
    }

    /// 最多扫描一个区块范围并转发找到的消息，返回转发数量
    pub async fn poll_once(&mut self) -> Result<usize> {
        let from = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let start = self.start_cursor().await?;
                info!(
                    "chain={} listening for deposits from block {}",
                    self.client.chain_id(),
                    start
                );
                self.cursor = Some(start);
                start
            }
        };

        let head = self.head().await?;
        if from > head {
            debug!(
                "chain={} block {} not confirmed yet (head {})",
                self.client.chain_id(),
                from,
                head
            );
            return Ok(0);
        }
        let to = head.min(from.saturating_add(self.settings.max_block_range - 1));

        let logs = retry(&self.policy, "getLogs", || {
            self.client
                .fetch_event_logs(self.settings.bridge, DEPOSIT_EVENT, from, to)
        })
        .await?;

        let mut forwarded = 0;
        for log in &logs {
            let message = match self.decoder.decode(log) {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        "chain={} skipping deposit in tx {:?}: {}",
                        self.client.chain_id(),
                        log.transaction_hash,
                        e
                    );
                    continue;
                }
            };
            let Some(route) = self.routes.get(&message.destination) else {
                warn!(
                    "chain={} no route to chain {} for deposit {}",
                    self.client.chain_id(),
                    message.destination,
                    message.key()
                );
                continue;
            };
            info!(
                "chain={} deposit {} to chain {} ({})",
                self.client.chain_id(),
                message.key(),
                message.destination,
                message.kind()
            );
            route.send(message).await.map_err(|e| {
                Error::Chain(format!("router for chain {} is gone", e.0.destination))
            })?;
            forwarded += 1;
        }

        self.cursor = Some(to + 1);
        if let Some(store) = &self.blockstore {
            if let Err(e) = store.set_last_block_number(to).await {
                warn!("chain={} {}", self.client.chain_id(), e);
            }
        }
        Ok(forwarded)
    }

    pub async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            let idle = match self.poll_once().await {
                Ok(_) => !self.behind().await,
                Err(e) => {
                    error!("chain={} listener pass failed: {}", self.client.chain_id(), e);
                    true
                }
            };
            if *shutdown.borrow() {
                break;
            }
            if idle {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
        }
        info!("chain={} listener stopped", self.client.chain_id());
    }

    /// 待扫描的已确认区块超过一轮的范围
    async fn behind(&self) -> bool {
        match (self.cursor, self.head().await) {
            (Some(cursor), Ok(head)) => cursor <= head,
            _ => false,
        }
    }
}
