//! 存款所需的 ERC20 调用

use primitive_types::{H160, U256};

use crate::abi::{self, Token};
use crate::chain_adapter::{ChainClient, TxFabric};
use crate::retry::{retry, RetryPolicy};
use crate::transactor::{transact, Submitted, TxOptions};
use crate::{Error, Result};

pub const APPROVE: &str = "approve(address,uint256)";
pub const ALLOWANCE: &str = "allowance(address,address)";
pub const BALANCE_OF: &str = "balanceOf(address)";

pub fn prepare_approve_input(spender: H160, amount: U256) -> Vec<u8> {
    abi::encode_call(APPROVE, &[Token::Address(spender), Token::Uint(amount)])
}

pub fn prepare_allowance_input(owner: H160, spender: H160) -> Vec<u8> {
    abi::encode_call(ALLOWANCE, &[Token::Address(owner), Token::Address(spender)])
}

pub fn prepare_balance_of_input(account: H160) -> Vec<u8> {
    abi::encode_call(BALANCE_OF, &[Token::Address(account)])
}

/// 授权 `spender` 从客户端账户转移 `amount` 数量的 `erc20`
pub async fn approve<C, F>(
    client: &C,
    fabric: &F,
    erc20: H160,
    spender: H160,
    amount: U256,
    opts: &TxOptions,
) -> Result<Submitted>
where
    C: ChainClient + ?Sized,
    F: TxFabric + ?Sized,
{
    let input = prepare_approve_input(spender, amount);
    transact(client, fabric, Some(erc20), input, opts).await
}

pub async fn allowance<C>(client: &C, erc20: H160, owner: H160, spender: H160) -> Result<U256>
where
    C: ChainClient + ?Sized,
{
    let input = prepare_allowance_input(owner, spender);
    let output = retry(&RetryPolicy::default(), "allowance", || {
        client.call(erc20, &input, None)
    })
    .await?;
    abi::decode_uint(&output, 0)
}

pub async fn balance_of<C>(client: &C, erc20: H160, account: H160) -> Result<U256>
where
    C: ChainClient + ?Sized,
{
    let input = prepare_balance_of_input(account);
    let output = retry(&RetryPolicy::default(), "balanceOf", || {
        client.call(erc20, &input, None)
    })
    .await?;
    abi::decode_uint(&output, 0)
}

/// 将 `"1.5"` 这样的数量按 `decimals` 换算为代币最小单位
pub fn user_amount_to_wei(amount: &str, decimals: u8) -> Result<U256> {
    let amount = amount.trim();
    let (whole, fraction) = match amount.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (amount, ""),
    };
    let invalid = || Error::Config(format!("invalid amount: {:?}", amount));
    if (whole.is_empty() && fraction.is_empty())
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > decimals as usize {
        return Err(Error::Config(format!(
            "amount {} has more than {} decimals",
            amount, decimals
        )));
    }

    let digits = format!("{}{:0<width$}", whole, fraction, width = decimals as usize);
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_dec_str(digits).map_err(|_| invalid())
}
