//! Tripcode：由秘密短语派生的确定性匿名身份
//!
//! 格式为 `name#secret`。显示名为 `name`，哈希由盐值与 `secret` 单向派生，
//! 只有在用户显式修改时才重新计算。

use data_encoding::BASE64URL_NOPAD;
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};

/// 显示名部分的最大长度
pub const MAX_TRIPNAME_LEN: usize = 18;

const HASH_LEN: usize = 10;

/// 经过格式校验的 tripcode 原文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tripcode {
    raw: String,
    separator: usize,
}

/// 由 tripcode 派生出的公开身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripcodeIdentity {
    pub name: String,
    pub hash: String,
}

impl Tripcode {
    pub fn parse(text: impl Into<String>) -> DomainResult<Self> {
        let raw = text.into();
        let separator = raw
            .find('#')
            .ok_or(DomainError::InvalidTripcode("missing '#'"))?;
        if separator == 0 || separator >= raw.len() - 1 {
            return Err(DomainError::InvalidTripcode(
                "name and secret must both be non-empty",
            ));
        }
        if raw.contains('\n') {
            return Err(DomainError::InvalidTripcode("must be a single line"));
        }
        if separator > MAX_TRIPNAME_LEN {
            return Err(DomainError::InvalidTripcode("name too long"));
        }
        Ok(Self { raw, separator })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.raw[..self.separator]
    }

    fn secret(&self) -> &str {
        &self.raw[self.separator + 1..]
    }

    /// 使用用户盐值派生公开身份
    pub fn derive(&self, salt: &str) -> TripcodeIdentity {
        let mut ctx = Context::new(&SHA256);
        ctx.update(salt.as_bytes());
        ctx.update(b"#");
        ctx.update(self.secret().as_bytes());
        let digest = ctx.finish();
        let encoded = BASE64URL_NOPAD.encode(digest.as_ref());

        TripcodeIdentity {
            name: self.name().to_owned(),
            hash: format!("!{}", &encoded[..HASH_LEN]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tripcode() {
        let trip = Tripcode::parse("anon#hunter2").unwrap();
        assert_eq!(trip.name(), "anon");
        assert_eq!(trip.as_str(), "anon#hunter2");
    }

    #[test]
    fn test_invalid_formats_rejected() {
        for text in ["#secret", "name#", "nosep", "a#b\nc", "abcdefghijklmnopqrs#x"] {
            assert!(Tripcode::parse(text).is_err(), "{text:?} should be rejected");
        }
        // 恰好 18 个字符的名字是允许的
        assert!(Tripcode::parse("abcdefghijklmnopqr#x").is_ok());
    }

    #[test]
    fn test_derivation_is_deterministic_and_salted() {
        let trip = Tripcode::parse("anon#hunter2").unwrap();
        let a = trip.derive("1234");
        let b = trip.derive("1234");
        let c = trip.derive("9999");

        assert_eq!(a, b);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.name, "anon");
        assert!(a.hash.starts_with('!'));
        assert_eq!(a.hash.len(), HASH_LEN + 1);
    }
}
