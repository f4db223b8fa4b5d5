//! Manual contract-call codec.
//!
//! The agent talks to the coordination ledger through a handful of fixed
//! function signatures, so instead of pulling in a full contract-binding
//! toolkit it encodes calldata and decodes return payloads by hand. The
//! vocabulary is deliberately small: UTF-8 strings (offset + length words,
//! right-padded), fixed-width unsigned integers, booleans, addresses,
//! 32-byte hashes, and a 4-byte big-endian IPv4 encoding parsed from a
//! dotted quad.

use anyhow::{bail, Context, Result};
use sha3::{Digest, Keccak256};

const WORD: usize = 32;

/// First four bytes of keccak256 over the canonical function signature,
/// e.g. `selector("getContractAddress(string)")`.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Full keccak256 digest, used for ip hashes, commitment hashes and
/// event topics.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a `0x`-prefixed 20-byte address string.
pub fn parse_address(addr: &str) -> Result<[u8; 20]> {
    let raw = hex::decode(addr.trim_start_matches("0x"))
        .with_context(|| format!("address {addr} is not valid hex"))?;
    if raw.len() != 20 {
        bail!("address {addr} is {} bytes, expected 20", raw.len());
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// An argument to an outbound contract call.
#[derive(Debug, Clone)]
pub enum Token {
    Uint(u128),
    Bool(bool),
    Address([u8; 20]),
    FixedBytes([u8; 32]),
    Str(String),
    /// Dotted-quad IPv4 encoded as 4 big-endian octets, right-aligned in
    /// one word. A malformed dotted quad encodes as all zeroes rather than
    /// failing — callers that care must validate upstream.
    Ipv4(String),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::Str(_))
    }

    /// The static head word for this token. Dynamic tokens get their
    /// offset patched in by `encode_call`.
    fn head_word(&self) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        match self {
            Token::Uint(v) => word[WORD - 16..].copy_from_slice(&v.to_be_bytes()),
            Token::Bool(b) => word[WORD - 1] = *b as u8,
            Token::Address(a) => word[WORD - 20..].copy_from_slice(a),
            Token::FixedBytes(b) => word.copy_from_slice(b),
            Token::Ipv4(ip) => word[WORD - 4..].copy_from_slice(&encode_ipv4(ip)),
            Token::Str(_) => {}
        }
        word
    }

    /// Length-prefixed, right-padded tail for dynamic tokens.
    fn tail(&self) -> Vec<u8> {
        match self {
            Token::Str(s) => {
                let bytes = s.as_bytes();
                let mut out = Vec::with_capacity(WORD + padded_len(bytes.len()));
                out.extend_from_slice(&uint_word(bytes.len() as u128));
                out.extend_from_slice(bytes);
                out.resize(WORD + padded_len(bytes.len()), 0);
                out
            }
            _ => Vec::new(),
        }
    }
}

/// 4-byte big-endian encoding of a dotted quad. Anything that does not
/// parse as exactly four octets yields `[0, 0, 0, 0]` — a documented
/// quirk carried over from the original wire format, not an error.
pub fn encode_ipv4(ip: &str) -> [u8; 4] {
    let mut octets = [0u8; 4];
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return [0u8; 4];
    }
    for (i, part) in parts.iter().enumerate() {
        match part.parse::<u8>() {
            Ok(octet) => octets[i] = octet,
            Err(_) => return [0u8; 4],
        }
    }
    octets
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn uint_word(v: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 16..].copy_from_slice(&v.to_be_bytes());
    word
}

/// Encode `selector ++ abi(args)` calldata. Static tokens go inline in the
/// head; each string contributes an offset word in the head and a
/// length-prefixed tail after it.
pub fn encode_call(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
    let head_len = args.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail: Vec<u8> = Vec::new();

    for arg in args {
        if arg.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend_from_slice(&arg.tail());
        } else {
            head.extend_from_slice(&arg.head_word());
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector);
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

/// Return-value schema element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Uint,
    Bool,
    Str,
}

/// A decoded return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Address(String),
    Uint(u128),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn as_uint(&self) -> u128 {
        match self {
            Value::Uint(v) => *v,
            _ => 0,
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s,
            _ => "",
        }
    }

    pub fn as_address(&self) -> &str {
        match self {
            Value::Address(a) => a,
            _ => "",
        }
    }
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * WORD;
    let end = start + WORD;
    if data.len() < end {
        bail!(
            "return payload too short: need {} bytes, have {}",
            end,
            data.len()
        );
    }
    Ok(&data[start..end])
}

fn uint_from_word(word: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[WORD - 16..]);
    u128::from_be_bytes(buf)
}

/// Decode an ABI-encoded return payload (or event data segment) against a
/// schema. String values have their offset/length header stripped; a
/// payload shorter than the schema demands is an error, never silently
/// zero-filled.
pub fn decode_return(schema: &[ParamType], data: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(schema.len());
    for (i, param) in schema.iter().enumerate() {
        let word = word_at(data, i)?;
        let value = match param {
            ParamType::Address => Value::Address(format!("0x{}", hex::encode(&word[12..]))),
            ParamType::Uint => {
                // Wider values would truncate silently; refuse instead.
                if word[..WORD - 16].iter().any(|&b| b != 0) {
                    bail!("uint return wider than 128 bits");
                }
                Value::Uint(uint_from_word(word))
            }
            ParamType::Bool => Value::Bool(word[WORD - 1] != 0),
            ParamType::Str => {
                let offset = uint_from_word(word);
                if offset + WORD as u128 > data.len() as u128 {
                    bail!("string offset {offset} points past payload end");
                }
                let offset = offset as usize;
                let len = uint_from_word(&data[offset..offset + WORD]);
                if (offset + WORD) as u128 + len > data.len() as u128 {
                    bail!("string body of {len} bytes truncated");
                }
                let start = offset + WORD;
                let len = len as usize;
                let s = std::str::from_utf8(&data[start..start + len])
                    .context("string return is not valid UTF-8")?;
                Value::Str(s.to_string())
            }
        };
        values.push(value);
    }
    Ok(values)
}
