use anyhow::{anyhow, Context, Result};
use bridge_core::{
    bridge::{self, erc20},
    chain_adapter::{legacy_transaction, ChainClient, EvmClient},
    codec::{
        construct_erc20_deposit_data, data_hash, encode_proposal_data, recipient_bytes,
        substrate::substrate_call,
    },
    deploy::{self, BridgeArgs},
    proposal::{decode_proposal_event, PROPOSAL_EVENT},
    relayer::Relayer,
    transactor::{TxOptions, DEFAULT_DEPLOY_GAS_LIMIT, DEFAULT_GAS_LIMIT},
    types::{decode_hex, parse_address, parse_h256},
    Config, Message, Payload, ResourceId,
};
use clap::{Args, Parser, Subcommand};
use primitive_types::{H160, U256};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Endpoint {
    /// 节点的 JSON-RPC 地址
    #[arg(long, default_value = "http://localhost:8545")]
    url: String,
}

#[derive(Args)]
struct Sender {
    #[command(flatten)]
    endpoint: Endpoint,
    /// 发送账户，需在节点上解锁
    #[arg(long)]
    from: String,
    #[arg(long)]
    gas_limit: Option<u64>,
    /// gas 价格（wei），不指定时从节点查询
    #[arg(long)]
    gas_price: Option<u64>,
}

impl Sender {
    fn client(&self) -> Result<EvmClient> {
        let from = parse_address(&self.from).context("invalid --from")?;
        Ok(EvmClient::connect(&self.endpoint.url, 0, from)?)
    }

    fn options(&self, default_gas_limit: u64) -> TxOptions {
        TxOptions {
            gas_limit: self.gas_limit.unwrap_or(default_gas_limit),
            gas_price: self.gas_price.map(U256::from),
            ..TxOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继器服务
    Start {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 部署桥相关合约
    Deploy {
        #[command(flatten)]
        sender: Sender,
        /// 十六进制合约字节码文件
        #[arg(long, value_name = "FILE")]
        bytecode: PathBuf,
        #[command(subcommand)]
        contract: Contract,
    },
    /// 向桥合约存入 ERC20 代币
    Deposit {
        #[command(flatten)]
        sender: Sender,
        #[arg(long)]
        bridge: String,
        /// 目标链上的接收地址
        #[arg(long)]
        recipient: String,
        /// 代币数量，例如 1.5
        #[arg(long)]
        amount: String,
        #[arg(long, default_value_t = 18)]
        decimals: u8,
        #[arg(long)]
        dest_id: u8,
        #[arg(long)]
        resource_id: String,
    },
    /// 授权 ERC20 代币
    Approve {
        #[command(flatten)]
        sender: Sender,
        #[arg(long)]
        erc20: String,
        #[arg(long)]
        spender: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value_t = 18)]
        decimals: u8,
    },
    /// 查询 ERC20 授权额度
    Allowance {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        erc20: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        spender: String,
    },
    /// 查询账户的 ERC20 余额
    Balance {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        erc20: String,
        #[arg(long)]
        account: String,
    },
    /// 列出桥合约的提案状态变更事件
    ProposalEvents {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        bridge: String,
        #[arg(long)]
        from_block: u64,
        /// 默认为最新区块
        #[arg(long)]
        to_block: Option<u64>,
    },
    /// 输出同质化存款在各类目标链上的提案调用数据
    ProposalData {
        #[arg(long)]
        source: u8,
        #[arg(long)]
        dest_id: u8,
        #[arg(long)]
        nonce: u64,
        #[arg(long)]
        resource_id: String,
        /// 十六进制接收者，EVM 为 20 字节，substrate 为 32 字节
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        amount: String,
        #[arg(long, default_value_t = 18)]
        decimals: u8,
    },
    /// 列出连续区块的交易哈希
    HashList {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        block_number: u64,
        #[arg(long, default_value_t = 50)]
        count: u64,
    },
    /// 用 eth_call 重放交易，不改变状态
    Simulate {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        block_number: u64,
        #[arg(long)]
        from: String,
    },
}

#[derive(Subcommand)]
enum Contract {
    Erc20 {
        #[arg(long)]
        name: String,
        #[arg(long)]
        symbol: String,
    },
    Bridge {
        #[arg(long)]
        chain_id: u8,
        /// 逗号分隔的中继者地址
        #[arg(long, value_delimiter = ',', required = true)]
        relayers: Vec<String>,
        #[arg(long, default_value_t = 1)]
        threshold: u64,
        #[arg(long, default_value_t = 0)]
        fee: u64,
        #[arg(long, default_value_t = 100)]
        expiry: u64,
    },
    Erc20Handler {
        #[arg(long)]
        bridge: String,
    },
}

#[derive(Tabled)]
struct ChainRow {
    id: u8,
    name: String,
    adapter: String,
    bridge: String,
    rpc_url: String,
}

#[derive(Tabled)]
struct ResourceRow {
    resource_id: String,
    name: String,
    kind: String,
}

#[derive(Tabled)]
struct ProposalEventRow {
    block: u64,
    source: u8,
    nonce: u64,
    status: String,
    data_hash: String,
}

fn read_bytecode(path: &PathBuf) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bytecode from {:?}", path))?;
    Ok(decode_hex(text.trim())?)
}

fn validate_config(path: PathBuf) -> Result<()> {
    info!("Validating config file {:?}", path);
    let config = Config::load(path)?;
    println!("Config is valid.");

    let chains: Vec<ChainRow> = config
        .chains
        .iter()
        .map(|c| ChainRow {
            id: c.id,
            name: c.name.clone(),
            adapter: c.adapter_type.clone(),
            bridge: c.bridge_address.clone(),
            rpc_url: c.rpc_url.clone(),
        })
        .collect();
    println!("{}", Table::new(chains));

    if !config.resources.is_empty() {
        let resources: Vec<ResourceRow> = config
            .resources
            .iter()
            .map(|r| ResourceRow {
                resource_id: r.resource_id.clone(),
                name: r.name.clone(),
                kind: r.kind.to_string(),
            })
            .collect();
        println!("{}", Table::new(resources));
    }

    println!(
        "poll interval: {}s, max retries: {}, retry delay: {}ms, receipt timeout: {}s, proposal expiry: {} blocks",
        config.relayer.poll_interval,
        config.relayer.max_retries,
        config.relayer.retry_delay,
        config.relayer.receipt_timeout,
        config.relayer.proposal_expiry
    );
    Ok(())
}

async fn start(path: PathBuf) -> Result<()> {
    info!("Starting relayer with config {:?}", path);
    // 加载配置
    let config = Config::load(path)?;
    // 创建中继器
    let relayer = Relayer::new(config).await?;

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutting down");
        let _ = stop.send(true);
    });

    if let Err(e) = relayer.start(shutdown).await {
        error!("Relayer exited with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn deploy_command(sender: Sender, bytecode: PathBuf, contract: Contract) -> Result<()> {
    let client = sender.client()?;
    let opts = sender.options(DEFAULT_DEPLOY_GAS_LIMIT);
    let bytecode = read_bytecode(&bytecode)?;

    let address = match contract {
        Contract::Erc20 { name, symbol } => {
            deploy::deploy_erc20(&client, &legacy_transaction, &bytecode, &name, &symbol, &opts)
                .await?
        }
        Contract::Bridge {
            chain_id,
            relayers,
            threshold,
            fee,
            expiry,
        } => {
            let relayers = relayers
                .iter()
                .map(|r| parse_address(r))
                .collect::<Result<Vec<H160>, _>>()?;
            let args = BridgeArgs {
                fee: U256::from(fee),
                expiry: U256::from(expiry),
                ..BridgeArgs::new(chain_id, relayers, U256::from(threshold))
            };
            deploy::deploy_bridge(&client, &legacy_transaction, &bytecode, &args, &opts).await?
        }
        Contract::Erc20Handler { bridge } => {
            let bridge = parse_address(&bridge)?;
            deploy::deploy_erc20_handler(&client, &legacy_transaction, &bytecode, bridge, &opts)
                .await?
        }
    };
    println!("{:?}", address);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::Start { config } => start(config).await,
        Commands::Deploy {
            sender,
            bytecode,
            contract,
        } => deploy_command(sender, bytecode, contract).await,
        Commands::Deposit {
            sender,
            bridge: bridge_arg,
            recipient,
            amount,
            decimals,
            dest_id,
            resource_id,
        } => {
            let client = sender.client()?;
            let bridge_address = parse_address(&bridge_arg)?;
            let recipient = parse_address(&recipient)?;
            let amount = erc20::user_amount_to_wei(&amount, decimals)?;
            let resource_id = ResourceId::from_hex(&resource_id)?;
            let data = construct_erc20_deposit_data(&recipient_bytes(recipient), amount);

            let submitted = bridge::deposit(
                &client,
                &legacy_transaction,
                bridge_address,
                dest_id,
                resource_id,
                data,
                &sender.options(DEFAULT_GAS_LIMIT),
            )
            .await?;
            info!(
                "Deposited {} to chain {} in block {}",
                amount, dest_id, submitted.receipt.block_number
            );
            println!("{:?}", submitted.hash);
            Ok(())
        }
        Commands::Approve {
            sender,
            erc20: token,
            spender,
            amount,
            decimals,
        } => {
            let client = sender.client()?;
            let amount = erc20::user_amount_to_wei(&amount, decimals)?;
            let submitted = erc20::approve(
                &client,
                &legacy_transaction,
                parse_address(&token)?,
                parse_address(&spender)?,
                amount,
                &sender.options(DEFAULT_GAS_LIMIT),
            )
            .await?;
            println!("{:?}", submitted.hash);
            Ok(())
        }
        Commands::Allowance {
            endpoint,
            erc20: token,
            owner,
            spender,
        } => {
            let client = EvmClient::connect(&endpoint.url, 0, H160::zero())?;
            let allowance = erc20::allowance(
                &client,
                parse_address(&token)?,
                parse_address(&owner)?,
                parse_address(&spender)?,
            )
            .await?;
            println!("{}", allowance);
            Ok(())
        }
        Commands::Balance {
            endpoint,
            erc20: token,
            account,
        } => {
            let client = EvmClient::connect(&endpoint.url, 0, H160::zero())?;
            let balance =
                erc20::balance_of(&client, parse_address(&token)?, parse_address(&account)?)
                    .await?;
            println!("{}", balance);
            Ok(())
        }
        Commands::ProposalEvents {
            endpoint,
            bridge: bridge_arg,
            from_block,
            to_block,
        } => {
            let client = EvmClient::connect(&endpoint.url, 0, H160::zero())?;
            let to_block = match to_block {
                Some(block) => block,
                None => client.block_number().await?,
            };
            let logs = client
                .fetch_event_logs(parse_address(&bridge_arg)?, PROPOSAL_EVENT, from_block, to_block)
                .await?;
            let mut rows = Vec::new();
            for log in &logs {
                match decode_proposal_event(log) {
                    Ok(event) => rows.push(ProposalEventRow {
                        block: log.block_number,
                        source: event.source,
                        nonce: event.deposit_nonce,
                        status: event.status.to_string(),
                        data_hash: format!("{:?}", event.data_hash),
                    }),
                    Err(e) => warn!("Skipping log in tx {:?}: {}", log.transaction_hash, e),
                }
            }
            println!("{}", Table::new(rows));
            Ok(())
        }
        Commands::ProposalData {
            source,
            dest_id,
            nonce,
            resource_id,
            recipient,
            amount,
            decimals,
        } => {
            let message = Message {
                source,
                destination: dest_id,
                deposit_nonce: nonce,
                resource_id: ResourceId::from_hex(&resource_id)?,
                payload: Payload::Fungible {
                    amount: erc20::user_amount_to_wei(&amount, decimals)?,
                    recipient: decode_hex(&recipient)?,
                },
            };
            let call_data = encode_proposal_data(&message)?;
            println!("call data: 0x{}", hex::encode(&call_data));
            println!("data hash: {:?}", data_hash(&call_data));
            match substrate_call(&message) {
                Ok(call) => println!("substrate call: {:?}", call),
                Err(e) => println!("substrate call: not applicable ({})", e),
            }
            Ok(())
        }
        Commands::HashList {
            endpoint,
            block_number,
            count,
        } => {
            let client = EvmClient::connect(&endpoint.url, 0, H160::zero())?;
            for number in block_number..block_number.saturating_add(count) {
                let block = client
                    .block_by_number(number)
                    .await
                    .with_context(|| format!("failed to fetch block {}", number))?;
                let Some(block) = block else {
                    warn!("Block {} not found, stopping", number);
                    break;
                };
                for hash in &block.transactions {
                    println!("{} {:?}", block.number, hash);
                }
            }
            Ok(())
        }
        Commands::Simulate {
            endpoint,
            tx_hash,
            block_number,
            from,
        } => {
            let client = EvmClient::connect(&endpoint.url, 0, H160::zero())?;
            let tx_hash = parse_h256(&tx_hash)?;
            let from = parse_address(&from)?;
            let output = client
                .simulate(block_number, tx_hash, from)
                .await
                .map_err(|e| anyhow!("simulation of {:?} failed: {}", tx_hash, e))?;
            println!("0x{}", hex::encode(output));
            Ok(())
        }
    }
}
