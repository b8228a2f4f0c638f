//! 基于 HTTP JSON-RPC 的 EVM 节点 [`ChainClient`]
//!
//! 交易通过 `eth_sendTransaction` 发送，中继账户需在节点上解锁

use async_trait::async_trait;
use log::debug;
use primitive_types::{H160, H256, U256};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{ChainClient, NonceManager};
use crate::abi;
use crate::config::ChainConfig;
use crate::retry::{retry, RetryPolicy};
use crate::types::{decode_hex, parse_address, Block, ChainId, Log, Receipt, Transaction};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 发送时表示节点拒绝该交易本身的 JSON-RPC 错误信息
const REJECTION_MARKERS: [&str; 4] = ["nonce", "funds", "underpriced", "already known"];

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    block_number: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_address: Option<H160>,
    #[serde(default)]
    gas_used: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: H160,
    topics: Vec<H256>,
    data: String,
    block_number: String,
    transaction_hash: H256,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: String,
    hash: H256,
    transactions: Vec<H256>,
}

/// `eth_getTransactionByHash` 返回的已上链交易
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub hash: H256,
    pub from: H160,
    pub to: Option<H160>,
    pub input: String,
    pub value: String,
    pub gas: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
}

pub struct EvmClient {
    http: reqwest::Client,
    rpc_url: String,
    chain_id: ChainId,
    from: H160,
    max_gas_price: Option<U256>,
    nonce: NonceManager,
    receipt_policy: RetryPolicy,
    rpc_policy: RetryPolicy,
    request_id: AtomicU64,
}

impl EvmClient {
    pub fn new(
        config: &ChainConfig,
        receipt_policy: RetryPolicy,
        rpc_policy: RetryPolicy,
    ) -> Result<Self> {
        let from = parse_address(&config.from)?;
        let mut client = Self::connect(&config.rpc_url, config.id, from)?;
        client.max_gas_price = config.max_gas_price.map(U256::from);
        client.receipt_policy = receipt_policy;
        client.rpc_policy = rpc_policy;
        Ok(client)
    }

    /// 使用默认策略的客户端，用于一次性的运维命令
    pub fn connect(rpc_url: &str, chain_id: ChainId, from: H160) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Chain(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            chain_id,
            from,
            max_gas_price: None,
            nonce: NonceManager::new(),
            receipt_policy: RetryPolicy::default(),
            rpc_policy: RetryPolicy::default(),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn with_max_gas_price(mut self, max_gas_price: Option<U256>) -> Self {
        self.max_gas_price = max_gas_price;
        self
    }

    pub fn with_policies(mut self, receipt_policy: RetryPolicy, rpc_policy: RetryPolicy) -> Self {
        self.receipt_policy = receipt_policy;
        self.rpc_policy = rpc_policy;
        self
    }

    /// 一次 JSON-RPC 请求，JSON-RPC 错误统一返回 `RpcUnavailable`，
    /// 由调用方按需重新分类
    async fn raw_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        debug!("chain={} rpc {} id={}", self.chain_id, method, id);

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RpcUnavailable(format!("{}: {}", method, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RpcUnavailable(format!(
                "{}: HTTP status {}",
                method, status
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::RpcUnavailable(format!("{}: {}", method, e)))?;
        let parsed: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| Error::MalformedResponse(format!("{}: {}", method, e)))?;

        if let Some(error) = parsed.error {
            return Err(Error::RpcUnavailable(format!(
                "{}: {} (code {})",
                method, error.message, error.code
            )));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.raw_request(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::MalformedResponse(format!("{}: {}", method, e)))
    }

    /// 幂等读取，传输错误时重试
    async fn read<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        retry(&self.rpc_policy, method, || self.request(method, params.clone())).await
    }

    pub async fn transaction_by_hash(&self, hash: H256) -> Result<Option<TransactionInfo>> {
        self.read("eth_getTransactionByHash", json!([hash])).await
    }

    /// 在 `block` 上以 `from` 身份用 `eth_call` 重放已上链交易，不改变链上状态
    pub async fn simulate(&self, block: u64, tx_hash: H256, from: H160) -> Result<Vec<u8>> {
        let tx = self
            .transaction_by_hash(tx_hash)
            .await?
            .ok_or_else(|| Error::Chain(format!("transaction {:?} not found", tx_hash)))?;
        let mut call = json!({
            "from": from,
            "data": tx.input,
            "value": tx.value,
            "gas": tx.gas,
        });
        if let Some(to) = tx.to {
            call["to"] = json!(to);
        }
        if let Some(gas_price) = tx.gas_price {
            call["gasPrice"] = json!(gas_price);
        }
        let output: String = self
            .read("eth_call", json!([call, quantity(block)]))
            .await?;
        decode_data(&output)
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn chain_type(&self) -> &str {
        "evm"
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
        let price: String = self.read("eth_gasPrice", json!([])).await?;
        let price = parse_u256(&price)?;
        Ok(match self.max_gas_price {
            Some(cap) if price > cap => cap,
            _ => price,
        })
    }

    async fn pending_nonce(&self) -> Result<u64> {
        let nonce: String = self
            .read("eth_getTransactionCount", json!([self.from, "pending"]))
            .await?;
        parse_u64(&nonce)
    }

    async fn sign_and_send_transaction(&self, tx: &Transaction) -> Result<H256> {
        let mut params = json!({
            "from": self.from,
            "nonce": quantity(tx.nonce),
            "gas": quantity(tx.gas_limit),
            "gasPrice": format!("{:#x}", tx.gas_price),
            "value": format!("{:#x}", tx.value),
            "data": format!("0x{}", hex::encode(&tx.data)),
        });
        if let Some(to) = tx.to {
            params["to"] = json!(to);
        }
        match self.request("eth_sendTransaction", json!([params])).await {
            Err(Error::RpcUnavailable(reason)) if is_rejection(&reason) => {
                Err(Error::Rejected(reason))
            }
            other => other,
        }
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        receipt
            .map(|r| -> Result<Receipt> {
                Ok(Receipt {
                    transaction_hash: r.transaction_hash,
                    block_number: parse_u64(&r.block_number)?,
                    status: match r.status.as_deref() {
                        Some(status) => parse_u64(status)? == 1,
                        None => true,
                    },
                    contract_address: r.contract_address,
                    gas_used: match r.gas_used.as_deref() {
                        Some(gas) => parse_u256(gas)?,
                        None => U256::zero(),
                    },
                })
            })
            .transpose()
    }

    async fn code_at(&self, address: H160, block: Option<u64>) -> Result<Vec<u8>> {
        let code: String = self
            .read("eth_getCode", json!([address, block_tag(block)]))
            .await?;
        decode_data(&code)
    }

    async fn call(&self, to: H160, data: &[u8], block: Option<u64>) -> Result<Vec<u8>> {
        let call = json!({
            "from": self.from,
            "to": to,
            "data": format!("0x{}", hex::encode(data)),
        });
        let output: String = self.read("eth_call", json!([call, block_tag(block)])).await?;
        decode_data(&output)
    }

    async fn block_number(&self) -> Result<u64> {
        let number: String = self.read("eth_blockNumber", json!([])).await?;
        parse_u64(&number)
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let block: Option<RpcBlock> = self
            .read("eth_getBlockByNumber", json!([quantity(number), false]))
            .await?;
        block
            .map(|b| -> Result<Block> {
                Ok(Block {
                    number: parse_u64(&b.number)?,
                    hash: b.hash,
                    transactions: b.transactions,
                })
            })
            .transpose()
    }

    async fn fetch_event_logs(
        &self,
        contract: H160,
        event: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>> {
        let filter = json!({
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
            "address": contract,
            "topics": [abi::event_topic(event)],
        });
        let logs: Vec<RpcLog> = self.read("eth_getLogs", json!([filter])).await?;
        logs.into_iter()
            .filter(|log| !log.removed)
            .map(|log| -> Result<Log> {
                Ok(Log {
                    address: log.address,
                    topics: log.topics,
                    data: decode_data(&log.data)?,
                    block_number: parse_u64(&log.block_number)?,
                    transaction_hash: log.transaction_hash,
                })
            })
            .collect()
    }
}

fn is_rejection(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    REJECTION_MARKERS.iter().any(|marker| reason.contains(marker))
}

fn quantity(value: u64) -> String {
    format!("{:#x}", value)
}

fn block_tag(block: Option<u64>) -> String {
    match block {
        Some(number) => quantity(number),
        None => "latest".to_string(),
    }
}

fn parse_u64(s: &str) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::MalformedResponse(format!("invalid quantity {}: {}", s, e)))
}

fn parse_u256(s: &str) -> Result<U256> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(digits, 16)
        .map_err(|e| Error::MalformedResponse(format!("invalid quantity {}: {:?}", s, e)))
}

fn decode_data(s: &str) -> Result<Vec<u8>> {
    decode_hex(s).map_err(|e| Error::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    fn from() -> H160 {
        H160::repeat_byte(0xaa)
    }

    fn client(server: &ServerGuard) -> EvmClient {
        EvmClient::connect(&server.url(), 1, from())
            .unwrap()
            .with_policies(RetryPolicy::immediate(3), RetryPolicy::immediate(2))
    }

    fn result(value: Value) -> String {
        json!({ "jsonrpc": "2.0", "id": 1, "result": value }).to_string()
    }

    fn rpc_error(message: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": message }
        })
        .to_string()
    }

    fn method(name: &str) -> Matcher {
        Matcher::PartialJson(json!({ "method": name }))
    }

    #[tokio::test]
    async fn test_block_number_and_gas_price_cap() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(method("eth_blockNumber"))
            .with_body(result(json!("0x1b4")))
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(method("eth_gasPrice"))
            .with_body(result(json!("0x3b9aca00")))
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(client.block_number().await.unwrap(), 436);
        assert_eq!(client.gas_price().await.unwrap(), U256::from(1_000_000_000u64));

        let capped = client.with_max_gas_price(Some(U256::from(500u32)));
        assert_eq!(capped.gas_price().await.unwrap(), U256::from(500u32));
    }

    #[tokio::test]
    async fn test_pending_nonce_queries_pending_tag() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                method("eth_getTransactionCount"),
                Matcher::Regex(format!(r#"\["{:?}","pending"\]"#, from())),
            ]))
            .with_body(result(json!("0x7")))
            .create_async()
            .await;

        assert_eq!(client(&server).pending_nonce().await.unwrap(), 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_classifies_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(method("eth_sendTransaction"))
            .with_body(rpc_error("nonce too low"))
            .create_async()
            .await;
        let tx = Transaction {
            nonce: 0,
            to: Some(H160::repeat_byte(1)),
            value: U256::zero(),
            gas_limit: 21_000,
            gas_price: U256::one(),
            data: vec![],
        };
        assert!(matches!(
            client(&server).sign_and_send_transaction(&tx).await,
            Err(Error::Rejected(reason)) if reason.contains("nonce too low")
        ));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(rpc_error("internal error"))
            .create_async()
            .await;
        assert!(matches!(
            client(&server).sign_and_send_transaction(&tx).await,
            Err(Error::RpcUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_returns_hash() {
        let mut server = Server::new_async().await;
        let hash = H256::repeat_byte(0x42);
        server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                method("eth_sendTransaction"),
                Matcher::Regex(r#""nonce":"0x5""#.to_string()),
                Matcher::Regex(r#""gas":"0x5208""#.to_string()),
            ]))
            .with_body(result(json!(hash)))
            .create_async()
            .await;
        let tx = Transaction {
            nonce: 5,
            to: None,
            value: U256::zero(),
            gas_limit: 21_000,
            gas_price: U256::one(),
            data: vec![0x60, 0x80],
        };
        assert_eq!(client(&server).sign_and_send_transaction(&tx).await.unwrap(), hash);
    }

    #[tokio::test]
    async fn test_receipt_parsing() {
        let mut server = Server::new_async().await;
        let hash = H256::repeat_byte(0x42);
        server
            .mock("POST", "/")
            .match_body(method("eth_getTransactionReceipt"))
            .with_body(result(json!({
                "transactionHash": hash,
                "blockNumber": "0x10",
                "status": "0x0",
                "contractAddress": null,
                "gasUsed": "0x5208"
            })))
            .create_async()
            .await;

        let receipt = client(&server).transaction_receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.block_number, 16);
        assert!(!receipt.status);
        assert_eq!(receipt.gas_used, U256::from(21_000u32));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(result(Value::Null))
            .create_async()
            .await;
        assert!(client(&server).transaction_receipt(hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logs_skip_removed() {
        let mut server = Server::new_async().await;
        let topic = abi::event_topic("Deposit(uint8,bytes32,uint64,bytes)");
        let log = |removed: bool| {
            json!({
                "address": H160::repeat_byte(0xbe),
                "topics": [topic],
                "data": "0x0102",
                "blockNumber": "0xa",
                "transactionHash": H256::repeat_byte(1),
                "removed": removed
            })
        };
        server
            .mock("POST", "/")
            .match_body(method("eth_getLogs"))
            .with_body(result(json!([log(false), log(true)])))
            .create_async()
            .await;

        let logs = client(&server)
            .fetch_event_logs(H160::repeat_byte(0xbe), "Deposit(uint8,bytes32,uint64,bytes)", 1, 20)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].data, vec![1, 2]);
        assert_eq!(logs[0].block_number, 10);
    }

    #[tokio::test]
    async fn test_malformed_and_unavailable() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body("not json")
            .create_async()
            .await;
        assert!(matches!(
            client(&server).block_number().await,
            Err(Error::MalformedResponse(_))
        ));

        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", "/")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        assert!(matches!(
            client(&server).block_number().await,
            Err(Error::RpcUnavailable(_))
        ));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_code_at_and_missing_block() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(method("eth_getCode"))
            .with_body(result(json!("0x")))
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(method("eth_getBlockByNumber"))
            .with_body(result(Value::Null))
            .create_async()
            .await;
        let client = client(&server);
        assert!(client.code_at(H160::zero(), None).await.unwrap().is_empty());
        assert!(client.block_by_number(99).await.unwrap().is_none());
    }

    #[test]
    fn test_rejection_markers() {
        assert!(is_rejection("insufficient funds for gas * price + value"));
        assert!(is_rejection("replacement transaction underpriced"));
        assert!(is_rejection("Nonce too low"));
        assert!(!is_rejection("execution reverted"));
    }
}
