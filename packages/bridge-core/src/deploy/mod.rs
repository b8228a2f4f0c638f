//! 通过 nonce 安全的提交路径部署合约
//!
//! 字节码由调用方提供，构造参数按 ABI 编码后追加在其后。
//! 只有在由发送者和 nonce 推导出的地址上查到代码，部署才算成功

use log::{debug, info};
use primitive_types::{H160, U256};

use crate::abi::{self, Token};
use crate::chain_adapter::{ChainClient, TxFabric};
use crate::transactor::{transact, TxOptions, DEFAULT_DEPLOY_GAS_LIMIT};
use crate::types::ChainId;
use crate::{Error, Result};

/// 可部署合约的构造参数
pub trait ConstructorArgs {
    fn contract_name(&self) -> &'static str;

    fn tokens(&self) -> Vec<Token>;
}

/// `ERC20PresetMinterPauser(string name, string symbol)`
#[derive(Debug, Clone)]
pub struct Erc20Args {
    pub name: String,
    pub symbol: String,
}

impl ConstructorArgs for Erc20Args {
    fn contract_name(&self) -> &'static str {
        "ERC20"
    }

    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::String(self.name.clone()),
            Token::String(self.symbol.clone()),
        ]
    }
}

/// `Bridge(uint8 chainID, address[] relayers, uint256 threshold, uint256 fee, uint256 expiry)`
#[derive(Debug, Clone)]
pub struct BridgeArgs {
    pub chain_id: ChainId,
    pub relayers: Vec<H160>,
    pub threshold: U256,
    pub fee: U256,
    pub expiry: U256,
}

impl BridgeArgs {
    pub fn new(chain_id: ChainId, relayers: Vec<H160>, threshold: U256) -> Self {
        Self {
            chain_id,
            relayers,
            threshold,
            fee: U256::zero(),
            expiry: U256::from(100u32),
        }
    }
}

impl ConstructorArgs for BridgeArgs {
    fn contract_name(&self) -> &'static str {
        "Bridge"
    }

    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::Uint(U256::from(self.chain_id)),
            Token::Array(self.relayers.iter().copied().map(Token::Address).collect()),
            Token::Uint(self.threshold),
            Token::Uint(self.fee),
            Token::Uint(self.expiry),
        ]
    }
}

/// `ERC20Handler(address bridge, bytes32[] resourceIDs, address[] tokens, address[] burnables)`,
/// 部署时不带初始资源
#[derive(Debug, Clone)]
pub struct Erc20HandlerArgs {
    pub bridge: H160,
}

impl ConstructorArgs for Erc20HandlerArgs {
    fn contract_name(&self) -> &'static str {
        "ERC20Handler"
    }

    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::Address(self.bridge),
            Token::Array(Vec::new()),
            Token::Array(Vec::new()),
            Token::Array(Vec::new()),
        ]
    }
}

/// 部署选项：不转账，使用部署 gas 上限和链上 gas 价格
pub fn deploy_options() -> TxOptions {
    TxOptions::with_gas_limit(DEFAULT_DEPLOY_GAS_LIMIT)
}

pub async fn deploy_contract<C, F, A>(
    client: &C,
    fabric: &F,
    bytecode: &[u8],
    args: &A,
    opts: &TxOptions,
) -> Result<H160>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
    A: ConstructorArgs + ?Sized,
{
    if bytecode.is_empty() {
        return Err(Error::DeploymentFailed(format!(
            "no bytecode for {}",
            args.contract_name()
        )));
    }
    let mut data = bytecode.to_vec();
    data.extend(abi::encode(&args.tokens()));

    let submitted = transact(client, fabric, None, data, opts).await?;
    let address = abi::create_address(client.from(), submitted.nonce);
    debug!(
        "chain={} nonce={} hash={:?} {} expected at {:?}",
        client.chain_id(),
        submitted.nonce,
        submitted.hash,
        args.contract_name(),
        address
    );

    let code = client.code_at(address, None).await?;
    if code.is_empty() {
        return Err(Error::DeploymentFailed(format!(
            "no code at {:?} after deploying {}",
            address,
            args.contract_name()
        )));
    }
    info!(
        "chain={} {} deployed at {:?}",
        client.chain_id(),
        args.contract_name(),
        address
    );
    Ok(address)
}

pub async fn deploy_erc20<C, F>(
    client: &C,
    fabric: &F,
    bytecode: &[u8],
    name: &str,
    symbol: &str,
    opts: &TxOptions,
) -> Result<H160>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    let args = Erc20Args {
        name: name.to_string(),
        symbol: symbol.to_string(),
    };
    deploy_contract(client, fabric, bytecode, &args, opts).await
}

pub async fn deploy_bridge<C, F>(
    client: &C,
    fabric: &F,
    bytecode: &[u8],
    args: &BridgeArgs,
    opts: &TxOptions,
) -> Result<H160>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    deploy_contract(client, fabric, bytecode, args, opts).await
}

pub async fn deploy_erc20_handler<C, F>(
    client: &C,
    fabric: &F,
    bytecode: &[u8],
    bridge: H160,
    opts: &TxOptions,
) -> Result<H160>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    deploy_contract(client, fabric, bytecode, &Erc20HandlerArgs { bridge }, opts).await
}
