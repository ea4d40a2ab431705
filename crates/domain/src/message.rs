//! 用户消息内容与出站载荷
//!
//! 内容对核心是不透明的：只关心类型、文本（用于计分）以及是否为转发。

use serde::{Deserialize, Serialize};

use crate::reply::Reply;
use crate::tripcode::TripcodeIdentity;

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Sticker,
    Photo,
    Animation,
    Video,
    VideoNote,
    Document,
    Audio,
    Voice,
    Location,
    Venue,
    Contact,
    Poll,
}

impl ContentKind {
    /// 受新账号媒体限制约束的类型
    pub fn is_media(self) -> bool {
        matches!(
            self,
            ContentKind::Photo
                | ContentKind::Animation
                | ContentKind::Video
                | ContentKind::Sticker
                | ContentKind::Document
        )
    }
}

/// 反垃圾计分表（千分单位）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpamCostTable {
    pub base_message: u32,
    pub base_forward: u32,
    pub sticker: u32,
    pub per_character: u32,
    pub per_linebreak: u32,
    /// 文本包含伪装字符时的惩罚分
    pub disallowed_text: u32,
}

impl Default for SpamCostTable {
    fn default() -> Self {
        Self {
            base_message: 750,
            base_forward: 1250,
            sticker: 1500,
            per_character: 2,
            per_linebreak: 100,
            disallowed_text: 999_000,
        }
    }
}

/// 用户发送的消息内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub kind: ContentKind,
    /// 正文或说明文字
    pub text: Option<String>,
    pub forwarded: bool,
    /// 传输层自有的附件引用
    pub attachment: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            forwarded: false,
            attachment: None,
        }
    }

    pub fn media(kind: ContentKind, attachment: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            kind,
            text: caption,
            forwarded: false,
            attachment: Some(attachment.into()),
        }
    }

    pub fn is_media(&self) -> bool {
        self.forwarded || self.kind.is_media()
    }

    /// 计算该消息的反垃圾分值
    pub fn spam_cost(&self, table: &SpamCostTable) -> u32 {
        if !self.text.as_deref().map_or(true, allow_message_text) {
            return table.disallowed_text;
        }

        let base = if self.forwarded {
            table.base_forward
        } else {
            table.base_message
        };

        match self.kind {
            ContentKind::Sticker => table.sticker,
            ContentKind::Text => {
                let text = self.text.as_deref().unwrap_or_default();
                let chars = text.chars().count() as u32;
                let breaks = text.matches('\n').count() as u32;
                base.saturating_add(chars.saturating_mul(table.per_character))
                    .saturating_add(breaks.saturating_mul(table.per_linebreak))
            }
            _ => base,
        }
    }
}

/// 数学字母数字符号区块可以伪造粗体等格式，直接拒绝
pub fn allow_message_text(text: &str) -> bool {
    !text
        .chars()
        .any(|c| (0x1D400..=0x1D7FF).contains(&(c as u32)))
}

/// 转发消息附带的署名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signature {
    /// tripcode 身份
    Tripcode(TripcodeIdentity),
    /// 作者主动公开的真实名称
    Exposed { name: String },
}

/// 经过匿名化处理、待转发给其他参与者的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub content: MessageContent,
    pub signature: Option<Signature>,
    pub edited: bool,
}

/// 发往传输层的载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outbound {
    /// 系统生成的类型化回复，由传输层负责本地化渲染
    System(Reply),
    /// 转发的用户消息
    Relayed(RelayedMessage),
}

impl From<Reply> for Outbound {
    fn from(reply: Reply) -> Self {
        Outbound::System(reply)
    }
}
