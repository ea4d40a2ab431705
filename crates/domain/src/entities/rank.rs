//! 用户等级
//!
//! 等级是有序的：banned < user < mod < admin < owner。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::DomainError;

/// 用户等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Banned,
    User,
    Mod,
    Admin,
    Owner,
}

impl Rank {
    /// 最高等级
    pub const MAX: Rank = Rank::Owner;

    /// 数值表示，负数表示被封禁
    pub fn value(self) -> i32 {
        match self {
            Rank::Banned => -10,
            Rank::User => 0,
            Rank::Mod => 10,
            Rank::Admin => 100,
            Rank::Owner => 1000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Banned => "banned",
            Rank::User => "user",
            Rank::Mod => "mod",
            Rank::Admin => "admin",
            Rank::Owner => "owner",
        }
    }

}

impl FromStr for Rank {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "banned" => Ok(Rank::Banned),
            "user" => Ok(Rank::User),
            "mod" => Ok(Rank::Mod),
            "admin" => Ok(Rank::Admin),
            "owner" => Ok(Rank::Owner),
            other => Err(DomainError::UnknownRank(other.to_string())),
        }
    }
}

impl Default for Rank {
    fn default() -> Self {
        Rank::User
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
