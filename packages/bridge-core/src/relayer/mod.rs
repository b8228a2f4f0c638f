pub mod router;

use futures::future::join_all;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::{
    bridge::{BridgeContract, EvmBridge, FabricFn},
    chain_adapter::{legacy_transaction, ChainAdapterFactory, ChainClient, DefaultChainAdapterFactory},
    codec::DepositDecoder,
    config::Config,
    listener::{Blockstore, Listener, ListenerSettings},
    retry::RetryPolicy,
    transactor::TxOptions,
    types::{parse_address, ChainId, Message},
    Error, Result,
};

pub use router::{Router, Step};

const CHANNEL_CAPACITY: usize = 256;

/// 中继器，为每条配置的链运行一个监听器和一个路由器
pub struct Relayer {
    config: Config,
    chain_adapters: HashMap<ChainId, Arc<dyn ChainClient>>,
    poll_interval: Duration,
}

impl Relayer {
    pub async fn new(config: Config) -> Result<Self> {
        let factory = DefaultChainAdapterFactory {
            receipt_policy: config.relayer.receipt_policy(),
            rpc_policy: config.relayer.rpc_policy(),
        };
        Self::with_factory(config, &factory).await
    }

    pub async fn with_factory(config: Config, factory: &dyn ChainAdapterFactory) -> Result<Self> {
        let mut chain_adapters = HashMap::new();
        for chain in &config.chains {
            let adapter = factory.create_adapter(chain).await?;
            info!(
                "chain={} connected to {} ({}) as {:?}",
                chain.id,
                chain.name,
                adapter.chain_type(),
                adapter.from()
            );
            chain_adapters.insert(chain.id, adapter);
        }

        let poll_interval = config.relayer.poll_interval();
        Ok(Self {
            config,
            chain_adapters,
            poll_interval,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn adapter(&self, chain_id: ChainId) -> Result<Arc<dyn ChainClient>> {
        self.chain_adapters
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| Error::Chain(format!("Chain adapter not found: {}", chain_id)))
    }

    /// 先从链上同步所有账户 nonce，然后持续中继直到 `shutdown` 为 true
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting relayer...");

        for (chain_id, adapter) in &self.chain_adapters {
            let nonce = adapter.resync_nonce().await?;
            info!("chain={} nonce={} status=resynced", chain_id, nonce);
        }

        // 链适配器自身会重试读取
        let read_policy = RetryPolicy::immediate(1);
        let kinds = self.config.resource_kinds()?;

        let mut senders = HashMap::new();
        let mut handles = Vec::new();
        // 每条目标链一个路由器
        for chain in &self.config.chains {
            let (tx, rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
            senders.insert(chain.id, tx);

            let bridge: Arc<dyn BridgeContract> = Arc::new(
                EvmBridge::new(
                    self.adapter(chain.id)?,
                    legacy_transaction as FabricFn,
                    parse_address(&chain.bridge_address)?,
                )
                .with_read_policy(read_policy.clone())
                .with_tx_options(TxOptions::with_gas_limit(chain.gas_limit)),
            );
            let router = Router::new(bridge, self.config.relayer.proposal_expiry);
            handles.push(tokio::spawn(router.run(
                rx,
                self.poll_interval,
                shutdown.clone(),
            )));
        }

        // 每条源链一个监听器，路由到其他链
        for chain in &self.config.chains {
            let routes = senders
                .iter()
                .filter(|(id, _)| **id != chain.id)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            let mut listener = Listener::new(
                self.adapter(chain.id)?,
                ListenerSettings::from_config(chain)?,
                DepositDecoder::new(chain.id, kinds.clone()),
                routes,
                read_policy.clone(),
            );
            if let Some(dir) = &self.config.relayer.blockstore_path {
                listener = listener.with_blockstore(Blockstore::new(dir, chain.id));
            }
            handles.push(tokio::spawn(listener.run(self.poll_interval, shutdown.clone())));
        }
        drop(senders);

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("relayer task failed: {}", e);
            }
        }
        info!("Relayer stopped");
        Ok(())
    }
}
