//! 单个签名账户在进程内的 nonce 缓存
//!
//! 缓存只能通过 [`NonceGuard`] 访问，guard 存活期间持有账户锁。
//! guard 被 drop 即解锁，提交过程的任何退出路径（包括 `?` 返回和被取消的 future）
//! 都只释放一次锁

use log::debug;
use std::future::Future;
use tokio::sync::{Mutex, MutexGuard};

use crate::Result;

#[derive(Debug, Default)]
pub struct NonceManager {
    next: Mutex<Option<u64>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待账户锁可用。缓存为空时（新进程或 [`NonceGuard::invalidate`] 之后）
    /// 通过 `fetch` 从链上获取下一个 nonce
    pub async fn lock<F, Fut>(&self, fetch: F) -> Result<NonceGuard<'_>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let mut slot = self.next.lock().await;
        let nonce = match *slot {
            Some(nonce) => nonce,
            None => {
                let nonce = fetch().await?;
                debug!("nonce cache filled from chain: {}", nonce);
                *slot = Some(nonce);
                nonce
            }
        };
        Ok(NonceGuard { slot, nonce })
    }

    /// 用链上的下一个 nonce 覆盖缓存
    pub async fn resync<F, Fut>(&self, fetch: F) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let mut slot = self.next.lock().await;
        let nonce = fetch().await?;
        *slot = Some(nonce);
        Ok(nonce)
    }

    /// 当前缓存值，会等待锁
    pub async fn cached(&self) -> Option<u64> {
        *self.next.lock().await
    }

    pub fn is_locked(&self) -> bool {
        self.next.try_lock().is_err()
    }
}

/// 账户 nonce 的独占持有者，drop 时解锁
#[derive(Debug)]
pub struct NonceGuard<'a> {
    slot: MutexGuard<'a, Option<u64>>,
    nonce: u64,
}

impl<'a> NonceGuard<'a> {
    /// 该账户下一笔交易必须使用的 nonce
    pub fn unsafe_nonce(&self) -> u64 {
        self.nonce
    }

    /// 确认当前 nonce 已在链上消耗
    pub fn unsafe_increase_nonce(&mut self) {
        self.nonce += 1;
        *self.slot = Some(self.nonce);
    }

    /// 清除缓存，下一个持有者会从链上重新同步
    pub fn invalidate(&mut self) {
        *self.slot = None;
    }

    pub fn unlock(self) {}
}
