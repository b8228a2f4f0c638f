use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::{parse_address, ChainId, ResourceId, TransferKind};
use crate::Error;

pub const SUPPORTED_ADAPTERS: [&str; 1] = ["evm"];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    #[serde(rename = "adapter_type")]
    pub adapter_type: String,
    pub rpc_url: String,
    /// 中继账户，私钥由节点保管
    pub from: String,
    pub bridge_address: String,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// 从节点查询的 gas 价格上限，单位 wei
    #[serde(default)]
    pub max_gas_price: Option<u64>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub block_confirmations: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// 忽略已存储的区块，从 `start_block` 开始
    #[serde(default)]
    pub fresh_start: bool,
    #[serde(default)]
    pub latest_block: bool,
}

fn default_gas_limit() -> u64 {
    crate::transactor::DEFAULT_GAS_LIMIT
}

fn default_max_block_range() -> u64 {
    100
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResourceConfig {
    pub resource_id: String,
    pub name: String,
    pub kind: TransferKind,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    /// 监听器和路由器的轮询间隔（秒）
    pub poll_interval: u64,
    pub max_retries: u32,
    /// 初始重试退避（毫秒）
    pub retry_delay: u64,
    #[serde(default = "default_receipt_grace_delay")]
    pub receipt_grace_delay: u64,
    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval: u64,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout: u64,
    /// Active 提案超过该区块数后不再投票，0 表示不限制
    #[serde(default)]
    pub proposal_expiry: u64,
    /// 保存各源链最后扫描区块的目录
    #[serde(default)]
    pub blockstore_path: Option<String>,
}

fn default_receipt_grace_delay() -> u64 {
    2_000
}

fn default_receipt_poll_interval() -> u64 {
    1_000
}

fn default_receipt_timeout() -> u64 {
    120
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// 读取和广播遇到传输错误时的重试策略
    pub fn rpc_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry_delay),
            max_attempts: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn receipt_policy(&self) -> RetryPolicy {
        RetryPolicy::receipt(
            Duration::from_millis(self.receipt_grace_delay),
            Duration::from_millis(self.receipt_poll_interval),
            Duration::from_secs(self.receipt_timeout),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    pub relayer: RelayerConfig,
}

impl Config {
    /// 读取 JSON 配置，文件以 `.toml` 结尾时按 TOML 解析
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        // 按扩展名选择格式
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&config_str)?,
            _ => Self::from_json(&config_str)?,
        };

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), Error> {
        // 验证链配置
        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !SUPPORTED_ADAPTERS.contains(&chain.adapter_type.as_str()) {
                return Err(Error::Config(format!(
                    "Invalid adapter type: {}",
                    chain.adapter_type
                )));
            }
            if !chain_ids.insert(chain.id) {
                return Err(Error::Config(format!("Duplicate chain id: {}", chain.id)));
            }
            parse_address(&chain.from).map_err(|_| {
                Error::Config(format!("Invalid from address on {}: {}", chain.name, chain.from))
            })?;
            parse_address(&chain.bridge_address).map_err(|_| {
                Error::Config(format!(
                    "Invalid bridge address on {}: {}",
                    chain.name, chain.bridge_address
                ))
            })?;
            if chain.max_block_range == 0 {
                return Err(Error::Config(format!(
                    "max_block_range of {} must be greater than 0",
                    chain.name
                )));
            }
        }

        // 验证资源配置
        let mut resource_ids = HashSet::new();
        for resource in &self.resources {
            let id = ResourceId::from_hex(&resource.resource_id).map_err(|_| {
                Error::Config(format!("Invalid resource id: {}", resource.resource_id))
            })?;
            if !resource_ids.insert(id) {
                return Err(Error::Config(format!("Duplicate resource id: {}", id)));
            }
        }

        // 验证中继器配置
        if self.relayer.poll_interval == 0 {
            return Err(Error::Config(
                "Relayer poll interval must be greater than 0".to_string(),
            ));
        }
        if self.relayer.max_retries == 0 {
            return Err(Error::Config(
                "Relayer max retries must be greater than 0".to_string(),
            ));
        }
        if self.relayer.receipt_timeout == 0 {
            return Err(Error::Config(
                "Relayer receipt timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain_id)
    }

    /// 资源标识到转账类型的映射，用于解码存款
    pub fn resource_kinds(&self) -> Result<HashMap<ResourceId, TransferKind>, Error> {
        self.resources
            .iter()
            .map(|r| -> Result<(ResourceId, TransferKind), Error> {
                Ok((ResourceId::from_hex(&r.resource_id)?, r.kind))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "chains": [
            {
                "id": 1,
                "name": "goerli",
                "adapter_type": "evm",
                "rpc_url": "http://localhost:8545",
                "from": "0xff93B45308FD417dF303D6515aB04D9e89a750Ca",
                "bridge_address": "0x62877dDCd49aD22f5eDfc6ac108e9a4b5D2bD88B",
                "block_confirmations": 5
            },
            {
                "id": 2,
                "name": "devnet",
                "adapter_type": "evm",
                "rpc_url": "http://localhost:8546",
                "from": "0xff93B45308FD417dF303D6515aB04D9e89a750Ca",
                "bridge_address": "0x62877dDCd49aD22f5eDfc6ac108e9a4b5D2bD88B",
                "latest_block": true
            }
        ],
        "resources": [
            {
                "resource_id": "0x0000000000000000000000000000000000000000000000000000000000000001",
                "name": "USDC",
                "kind": "fungible"
            }
        ],
        "relayer": {
            "poll_interval": 5,
            "max_retries": 3,
            "retry_delay": 500
        }
    }"#;

    fn config() -> Config {
        Config::from_json(CONFIG).unwrap()
    }

    #[test]
    fn test_parse_and_defaults() {
        let config = config();
        config.validate().unwrap();
        let goerli = config.get_chain_config(1).unwrap();
        assert_eq!(goerli.block_confirmations, 5);
        assert_eq!(goerli.gas_limit, crate::transactor::DEFAULT_GAS_LIMIT);
        assert_eq!(goerli.max_block_range, 100);
        assert!(config.get_chain_config(2).unwrap().latest_block);
        assert!(config.get_chain_config(3).is_none());

        assert_eq!(config.relayer.receipt_timeout, 120);
        assert_eq!(config.relayer.proposal_expiry, 0);
        assert!(config.relayer.blockstore_path.is_none());
        let rpc = config.relayer.rpc_policy();
        assert_eq!(rpc.max_attempts, 3);
        assert_eq!(rpc.initial_backoff, Duration::from_millis(500));
        let receipt = config.relayer.receipt_policy();
        assert_eq!(receipt.deadline, Some(Duration::from_secs(120)));
        assert_eq!(receipt.grace_delay, Duration::from_secs(2));

        let kinds = config.resource_kinds().unwrap();
        assert_eq!(kinds.len(), 1);
        assert!(kinds.values().all(|k| *k == TransferKind::Fungible));
    }

    #[test]
    fn test_toml() {
        let config = Config::from_toml(
            r#"
            [[chains]]
            id = 3
            name = "local"
            adapter_type = "evm"
            rpc_url = "http://127.0.0.1:8545"
            from = "0x00000000000000000000000000000000000000aa"
            bridge_address = "0x00000000000000000000000000000000000000bb"

            [relayer]
            poll_interval = 1
            max_retries = 1
            retry_delay = 10
            proposal_expiry = 50
            blockstore_path = "/var/lib/relayer/blocks"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.chains[0].id, 3);
        assert!(config.resources.is_empty());
        assert_eq!(config.relayer.proposal_expiry, 50);
        assert_eq!(
            config.relayer.blockstore_path.as_deref(),
            Some("/var/lib/relayer/blocks")
        );
        assert!(!config.chains[0].fresh_start);
    }

    #[test]
    fn test_validation_failures() {
        let mut bad = config();
        bad.chains[0].adapter_type = "sui".into();
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.chains[1].id = 1;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.chains[0].bridge_address = "0x1234".into();
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.chains[0].max_block_range = 0;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.resources.push(bad.resources[0].clone());
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.resources[0].resource_id = "0x01".into();
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.relayer.poll_interval = 0;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.relayer.max_retries = 0;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.relayer.receipt_timeout = 0;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/relayer.json"),
            Err(Error::Config(_))
        ));
    }
}
