//! substrate 目标链的调用参数，handler 接收解码后的值而非原始调用数据

use primitive_types::{H256, U256};

use crate::types::{Message, Payload};
use crate::{Error, Result};

pub type AccountId32 = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateCall {
    Fungible {
        recipient: AccountId32,
        amount: u128,
    },
    NonFungible {
        recipient: AccountId32,
        token_id: U256,
        metadata: Vec<u8>,
    },
    Generic {
        hash: H256,
    },
}

pub fn substrate_call(message: &Message) -> Result<SubstrateCall> {
    match &message.payload {
        Payload::Fungible { amount, recipient } => {
            if amount.bits() > 128 {
                return Err(Error::MalformedMessage(format!(
                    "amount {} does not fit in u128",
                    amount
                )));
            }
            Ok(SubstrateCall::Fungible {
                recipient: account_id(recipient)?,
                amount: amount.as_u128(),
            })
        }
        Payload::NonFungible {
            token_id,
            recipient,
            metadata,
        } => Ok(SubstrateCall::NonFungible {
            recipient: account_id(recipient)?,
            token_id: *token_id,
            metadata: metadata.clone(),
        }),
        Payload::Generic { data_hash } => Ok(SubstrateCall::Generic { hash: *data_hash }),
    }
}

fn account_id(recipient: &[u8]) -> Result<AccountId32> {
    <AccountId32>::try_from(recipient).map_err(|_| {
        Error::MalformedMessage(format!(
            "substrate recipient must be 32 bytes, got {}",
            recipient.len()
        ))
    })
}
