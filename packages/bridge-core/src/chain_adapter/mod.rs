use async_trait::async_trait;
use log::{debug, warn};
use primitive_types::{H160, H256, U256};
use std::sync::Arc;
use tokio::time::sleep;

use crate::{
    config::ChainConfig,
    retry::{with_deadline, RetryPolicy},
    types::{Block, ChainId, Log, Receipt, Transaction},
    Error, Result,
};

pub mod evm;
pub mod nonce;

pub use evm::EvmClient;
pub use nonce::{NonceGuard, NonceManager};

/// 链适配器特征，定义了中继器读写链所需的基本功能
///
/// 每个实例对应一个签名账户。写操作经由 [`ChainClient::lock_nonce`] 串行化，
/// 读操作不加锁
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// 获取链的类型标识，例如 `"evm"`
    fn chain_type(&self) -> &str;

    /// 所连接链在桥合约中的链标识
    fn chain_id(&self) -> ChainId;

    /// 发送交易的中继账户
    fn from(&self) -> H160;

    fn nonce_manager(&self) -> &NonceManager;

    fn receipt_policy(&self) -> &RetryPolicy;

    async fn gas_price(&self) -> Result<U256>;

    /// 链上 [`ChainClient::from`] 的下一个 nonce，包含 pending 交易
    async fn pending_nonce(&self) -> Result<u64>;

    async fn sign_and_send_transaction(&self, tx: &Transaction) -> Result<H256>;

    /// 查询一次交易回执，未上链时返回 `None`
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>>;

    /// `block == None` 表示最新区块
    async fn code_at(&self, address: H160, block: Option<u64>) -> Result<Vec<u8>>;

    async fn call(&self, to: H160, data: &[u8], block: Option<u64>) -> Result<Vec<u8>>;

    async fn block_number(&self) -> Result<u64>;

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>>;

    async fn fetch_event_logs(
        &self,
        contract: H160,
        event: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>>;

    /// 获取账户 nonce 锁，guard drop 时释放
    async fn lock_nonce<'a>(&'a self) -> Result<NonceGuard<'a>> {
        self.nonce_manager().lock(|| self.pending_nonce()).await
    }

    /// 用链上 nonce 覆盖缓存，启动时调用
    async fn resync_nonce(&self) -> Result<u64> {
        self.nonce_manager().resync(|| self.pending_nonce()).await
    }

    /// 按 [`ChainClient::receipt_policy`] 轮询 `hash` 的回执，
    /// 始终查不到返回 `Timeout`，执行失败返回 `Reverted`
    async fn wait_and_return_tx_receipt(&self, hash: H256) -> Result<Receipt> {
        let policy = self.receipt_policy().clone();
        let poll = async {
            if !policy.grace_delay.is_zero() {
                sleep(policy.grace_delay).await;
            }
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => debug!("receipt for {:?} not available yet", hash),
                    Err(e) if e.is_transient() => {
                        warn!("receipt lookup for {:?} failed: {}", hash, e)
                    }
                    Err(e) => return Err(e),
                }
                if attempt >= policy.max_attempts {
                    return Err(Error::Timeout(format!(
                        "no receipt for {:?} after {} attempts",
                        hash, attempt
                    )));
                }
                sleep(policy.backoff(attempt)).await;
            }
        };
        let receipt = with_deadline(policy.deadline, "receipt wait", poll).await?;
        if !receipt.status {
            return Err(Error::Reverted(hash));
        }
        Ok(receipt)
    }
}

/// 按目标链的格式构造未签名交易，`to == None` 表示部署合约
pub trait TxFabric: Send + Sync {
    fn new_transaction(
        &self,
        nonce: u64,
        to: Option<H160>,
        value: U256,
        gas_limit: u64,
        gas_price: U256,
        data: Vec<u8>,
    ) -> Transaction;
}

impl<F> TxFabric for F
where
    F: Fn(u64, Option<H160>, U256, u64, U256, Vec<u8>) -> Transaction + Send + Sync,
{
    fn new_transaction(
        &self,
        nonce: u64,
        to: Option<H160>,
        value: U256,
        gas_limit: u64,
        gas_price: U256,
        data: Vec<u8>,
    ) -> Transaction {
        self(nonce, to, value, gas_limit, gas_price, data)
    }
}

/// 传统（EIP-1559 之前）EVM 交易
pub fn legacy_transaction(
    nonce: u64,
    to: Option<H160>,
    value: U256,
    gas_limit: u64,
    gas_price: U256,
    data: Vec<u8>,
) -> Transaction {
    Transaction {
        nonce,
        to,
        value,
        gas_limit,
        gas_price,
        data,
    }
}

/// 链适配器工厂，根据配置创建不同链的适配器实例
#[async_trait]
pub trait ChainAdapterFactory: Send + Sync {
    async fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainClient>>;
}

pub struct DefaultChainAdapterFactory {
    pub receipt_policy: RetryPolicy,
    pub rpc_policy: RetryPolicy,
}

#[async_trait]
impl ChainAdapterFactory for DefaultChainAdapterFactory {
    async fn create_adapter(&self, config: &ChainConfig) -> Result<Arc<dyn ChainClient>> {
        match config.adapter_type.as_str() {
            "evm" => {
                let client = EvmClient::new(
                    config,
                    self.receipt_policy.clone(),
                    self.rpc_policy.clone(),
                )?;
                Ok(Arc::new(client))
            }
            _ => Err(Error::Chain(format!(
                "Unsupported adapter type: {}",
                config.adapter_type
            ))),
        }
    }
}
