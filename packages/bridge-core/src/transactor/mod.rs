//! nonce 安全的交易提交，部署、投票、执行和存款共用这一条写路径
//!
//! 1. 锁定账户 nonce
//! 2. 用缓存的 nonce 构造交易
//! 3. 广播，失败则解锁且不消耗 nonce
//! 4. 等待交易回执
//! 5. 成功后提交 `nonce + 1` 并解锁
//!
//! 锁以 guard 形式贯穿 1-5 步，提前返回或被取消时都会释放

use log::{info, warn};
use primitive_types::{H160, H256, U256};

use crate::chain_adapter::{ChainClient, TxFabric};
use crate::types::Receipt;
use crate::{Error, Result};

pub const DEFAULT_GAS_LIMIT: u64 = 6_721_975;
pub const DEFAULT_DEPLOY_GAS_LIMIT: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOptions {
    pub value: U256,
    pub gas_limit: u64,
    /// 固定 gas 价格，`None` 时从链上查询
    pub gas_price: Option<U256>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            value: U256::zero(),
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_price: None,
        }
    }
}

impl TxOptions {
    pub fn with_gas_limit(gas_limit: u64) -> Self {
        Self {
            gas_limit,
            ..Self::default()
        }
    }
}

/// 已广播并成功上链的交易
#[derive(Debug, Clone)]
pub struct Submitted {
    pub hash: H256,
    pub nonce: u64,
    pub receipt: Receipt,
}

pub async fn transact<C, F>(
    client: &C,
    fabric: &F,
    to: Option<H160>,
    data: Vec<u8>,
    opts: &TxOptions,
) -> Result<Submitted>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    let gas_price = match opts.gas_price {
        Some(price) => price,
        None => client.gas_price().await?,
    };

    let mut guard = client.lock_nonce().await?;
    let nonce = guard.unsafe_nonce();
    let tx = fabric.new_transaction(nonce, to, opts.value, opts.gas_limit, gas_price, data);

    let hash = match client.sign_and_send_transaction(&tx).await {
        Ok(hash) => hash,
        Err(e) => {
            if is_stale_nonce(&e) {
                guard.invalidate();
            }
            warn!(
                "chain={} nonce={} status=send_failed error={}",
                client.chain_id(),
                nonce,
                e
            );
            return Err(e);
        }
    };
    info!(
        "chain={} nonce={} hash={:?} status=broadcast",
        client.chain_id(),
        nonce,
        hash
    );

    match client.wait_and_return_tx_receipt(hash).await {
        Ok(receipt) => {
            guard.unsafe_increase_nonce();
            info!(
                "chain={} nonce={} hash={:?} block={} status=mined",
                client.chain_id(),
                nonce,
                hash,
                receipt.block_number
            );
            Ok(Submitted {
                hash,
                nonce,
                receipt,
            })
        }
        // 已上链，调用虽失败但 nonce 已消耗
        Err(Error::Reverted(reverted)) => {
            guard.unsafe_increase_nonce();
            warn!(
                "chain={} nonce={} hash={:?} status=reverted",
                client.chain_id(),
                nonce,
                reverted
            );
            Err(Error::Reverted(reverted))
        }
        Err(e) => {
            warn!(
                "chain={} nonce={} hash={:?} status=receipt_failed error={}",
                client.chain_id(),
                nonce,
                hash,
                e
            );
            Err(e)
        }
    }
}

fn is_stale_nonce(e: &Error) -> bool {
    matches!(e, Error::Rejected(reason) if reason.to_lowercase().contains("nonce too low"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::legacy_transaction;
    use crate::retry::RetryPolicy;
    use crate::test_utils::MemoryChain;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn opts() -> TxOptions {
        TxOptions {
            gas_price: Some(U256::one()),
            ..TxOptions::default()
        }
    }

    fn target() -> Option<H160> {
        Some(H160::repeat_byte(0x42))
    }

    #[tokio::test]
    async fn test_success_commits_nonce() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        let first = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        let second = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        assert_eq!(first.nonce, 0);
        assert_eq!(second.nonce, 1);
        assert_eq!(chain.nonce_manager().cached().await, Some(2));
        assert!(!chain.nonce_manager().is_locked());
    }

    #[tokio::test]
    async fn test_broadcast_failure_keeps_nonce() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();

        chain.state().fail_sends = 1;
        let result = transact(&chain, &legacy_transaction, target(), vec![], &opts()).await;
        assert!(matches!(result, Err(Error::RpcUnavailable(_))));
        assert!(!chain.nonce_manager().is_locked());
        assert_eq!(chain.nonce_manager().cached().await, Some(1));

        let retried = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        assert_eq!(retried.nonce, 1);
    }

    #[tokio::test]
    async fn test_receipt_timeout_keeps_nonce() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        chain.state().never_mine = true;
        let result = transact(&chain, &legacy_transaction, target(), vec![], &opts()).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!chain.nonce_manager().is_locked());
        assert_eq!(chain.nonce_manager().cached().await, Some(0));
    }

    #[tokio::test]
    async fn test_cancelled_receipt_wait_releases_lock() {
        let chain = MemoryChain::new(H160::repeat_byte(1)).with_receipt_policy(
            RetryPolicy::receipt(
                Duration::from_secs(30),
                Duration::from_secs(1),
                Duration::from_secs(120),
            ),
        );
        chain.state().never_mine = true;

        let result = timeout(
            Duration::from_millis(20),
            transact(&chain, &legacy_transaction, target(), vec![], &opts()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(chain.state().broadcast_nonces(H160::repeat_byte(1)), vec![0]);
        assert!(!chain.nonce_manager().is_locked());
        assert_eq!(chain.nonce_manager().cached().await, Some(0));
    }

    #[tokio::test]
    async fn test_receipt_lookup_errors_are_retried() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        chain.state().fail_receipts = 2;
        let submitted = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        assert_eq!(submitted.nonce, 0);
        assert!(submitted.receipt.status);
        let state = chain.state();
        assert_eq!(state.fail_receipts, 0);
        assert_eq!(state.receipt_polls, 3);
        assert_eq!(state.broadcast_nonces(H160::repeat_byte(1)), vec![0]);
        drop(state);
        assert_eq!(chain.nonce_manager().cached().await, Some(1));
    }

    #[tokio::test]
    async fn test_revert_consumes_nonce() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        chain.state().revert_next = true;
        let result = transact(&chain, &legacy_transaction, target(), vec![], &opts()).await;
        assert!(matches!(result, Err(Error::Reverted(_))));
        assert_eq!(chain.nonce_manager().cached().await, Some(1));
        let next = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        assert_eq!(next.nonce, 1);
    }

    #[tokio::test]
    async fn test_stale_nonce_rejection_resyncs() {
        let chain = MemoryChain::new(H160::repeat_byte(1));
        chain.resync_nonce().await.unwrap();
        // 其他进程已用掉 nonce 0..3
        chain.state().set_account_nonce(H160::repeat_byte(1), 3);

        let result = transact(&chain, &legacy_transaction, target(), vec![], &opts()).await;
        assert!(matches!(result, Err(Error::Rejected(_))));
        assert_eq!(chain.nonce_manager().cached().await, None);

        let next = transact(&chain, &legacy_transaction, target(), vec![], &opts())
            .await
            .unwrap();
        assert_eq!(next.nonce, 3);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_gap_free() {
        let chain = Arc::new(MemoryChain::new(H160::repeat_byte(1)));
        let mut handles = Vec::new();
        for i in 0..12u32 {
            let chain = chain.clone();
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    chain.state().fail_sends += 1;
                }
                transact(chain.as_ref(), &legacy_transaction, target(), vec![], &opts()).await
            }));
        }
        let mut mined = Vec::new();
        for handle in handles {
            if let Ok(submitted) = handle.await.unwrap() {
                mined.push(submitted.nonce);
            }
        }
        let broadcast = chain.state().broadcast_nonces(H160::repeat_byte(1));
        let expected: Vec<u64> = (0..broadcast.len() as u64).collect();
        assert_eq!(broadcast, expected);
        mined.sort_unstable();
        assert_eq!(mined, expected);
        assert!(!chain.nonce_manager().is_locked());
    }
}
