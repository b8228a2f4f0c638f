pub mod abi;
pub mod bridge;
pub mod chain_adapter;
pub mod codec;
pub mod config;
pub mod deploy;
pub mod listener;
pub mod proposal;
pub mod relayer;
pub mod retry;
pub mod transactor;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use proposal::{Proposal, ProposalStatus};
pub use types::{ChainId, Message, Payload, ResourceId, TransferKind};

use primitive_types::H256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("RPC unavailable: {0}")]
    RpcUnavailable(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Transaction {0:?} reverted")]
    Reverted(H256),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// 传输层错误，可在本地重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RpcUnavailable(_))
    }

    /// 重试也不会成功的错误，路由器会丢弃对应消息
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::MalformedEvent(_)
                | Error::MalformedResponse(_)
                | Error::MalformedMessage(_)
                | Error::DeploymentFailed(_)
                | Error::Config(_)
                | Error::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
