//! 精简的 Solidity ABI 支持：函数选择器、参数编码、按字解码以及 CREATE 地址推导

use primitive_types::{H160, H256, U256};
use sha3::{Digest, Keccak256};

use crate::{Error, Result};

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

/// 函数签名 keccak 哈希的前四个字节
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// 事件签名对应的 topic 0
pub fn event_topic(signature: &str) -> H256 {
    keccak256(signature.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(H160),
    Uint(U256),
    Bool(bool),
    /// `bytesN`，右侧补零，最多 32 字节
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
    /// `T[]`
    Array(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::Bytes(_) | Token::String(_) | Token::Array(_))
    }
}

pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len = 32 * tokens.len();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word(U256::from(head_len + tail.len())));
            tail.extend(encode_dynamic(token));
        } else {
            head.extend_from_slice(&encode_static(token));
        }
    }
    head.extend(tail);
    head
}

pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode(tokens));
    data
}

fn encode_static(token: &Token) -> [u8; 32] {
    match token {
        Token::Address(address) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(address.as_bytes());
            word
        }
        Token::Uint(value) => uint_word(*value),
        Token::Bool(value) => uint_word(U256::from(*value as u8)),
        Token::FixedBytes(bytes) => {
            let mut word = [0u8; 32];
            let len = bytes.len().min(32);
            word[..len].copy_from_slice(&bytes[..len]);
            word
        }
        Token::Bytes(_) | Token::String(_) | Token::Array(_) => {
            unreachable!("dynamic tokens are encoded in the tail")
        }
    }
}

fn encode_dynamic(token: &Token) -> Vec<u8> {
    match token {
        Token::Bytes(bytes) => encode_packed_bytes(bytes),
        Token::String(s) => encode_packed_bytes(s.as_bytes()),
        Token::Array(items) => {
            let mut out = uint_word(U256::from(items.len())).to_vec();
            out.extend(encode(items));
            out
        }
        other => encode_static(other).to_vec(),
    }
}

fn encode_packed_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = uint_word(U256::from(bytes.len())).to_vec();
    out.extend_from_slice(bytes);
    let rem = bytes.len() % 32;
    if rem != 0 {
        out.resize(out.len() + 32 - rem, 0);
    }
    out
}

pub fn uint_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// 左侧补零到 32 字节，超过 32 字节返回 `None`
pub fn left_pad_32(bytes: &[u8]) -> Option<[u8; 32]> {
    if bytes.len() > 32 {
        return None;
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(bytes);
    Some(word)
}

pub fn decode_word(data: &[u8], index: usize) -> Result<[u8; 32]> {
    let start = index * 32;
    let chunk = data.get(start..start + 32).ok_or_else(|| {
        Error::MalformedResponse(format!(
            "expected word {} in {} bytes of return data",
            index,
            data.len()
        ))
    })?;
    let mut word = [0u8; 32];
    word.copy_from_slice(chunk);
    Ok(word)
}

pub fn decode_uint(data: &[u8], index: usize) -> Result<U256> {
    Ok(U256::from_big_endian(&decode_word(data, index)?))
}

pub fn decode_bool(data: &[u8], index: usize) -> Result<bool> {
    Ok(!decode_uint(data, index)?.is_zero())
}

pub fn decode_address(data: &[u8], index: usize) -> Result<H160> {
    let word = decode_word(data, index)?;
    Ok(H160::from_slice(&word[12..]))
}

/// 解码动态 `bytes`，其偏移量位于第 `index` 个头部字
pub fn decode_bytes(data: &[u8], index: usize) -> Result<Vec<u8>> {
    let offset = word_to_usize(decode_uint(data, index)?)?;
    let len_word = data.get(offset..offset + 32).ok_or_else(|| {
        Error::MalformedResponse(format!("bytes offset {} out of range", offset))
    })?;
    let len = word_to_usize(U256::from_big_endian(len_word))?;
    let start = offset + 32;
    data.get(start..start + len)
        .map(|b| b.to_vec())
        .ok_or_else(|| Error::MalformedResponse(format!("bytes length {} out of range", len)))
}

fn word_to_usize(value: U256) -> Result<usize> {
    if value > U256::from(u32::MAX) {
        return Err(Error::MalformedResponse(format!(
            "value {} does not fit an offset",
            value
        )));
    }
    Ok(value.as_usize())
}

/// `sender` 以 `nonce` 部署的合约地址：
/// `keccak256(rlp([sender, nonce]))[12..]`
pub fn create_address(sender: H160, nonce: u64) -> H160 {
    let mut nonce_rlp = Vec::with_capacity(9);
    match nonce {
        0 => nonce_rlp.push(0x80),
        n if n < 0x80 => nonce_rlp.push(n as u8),
        n => {
            let be = n.to_be_bytes();
            let first = be.iter().position(|b| *b != 0).unwrap_or(7);
            nonce_rlp.push(0x80 + (8 - first) as u8);
            nonce_rlp.extend_from_slice(&be[first..]);
        }
    }
    let mut stream = Vec::with_capacity(32);
    stream.push(0xc0 + (21 + nonce_rlp.len()) as u8);
    stream.push(0x94);
    stream.extend_from_slice(sender.as_bytes());
    stream.extend(nonce_rlp);
    H160::from_slice(&keccak256(&stream).as_bytes()[12..])
}
