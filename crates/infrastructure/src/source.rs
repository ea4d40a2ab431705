//! 基于文本行的事件源
//!
//! 每行一条事件：`<id>[:<name>] [>N | ~N] <body>`
//!
//! - `>N` 表示回复自己会话中ID为 N 的消息
//! - `~N` 表示把自己ID为 N 的消息编辑为 body
//! - body 以 `/` 开头时按命令解析，`+1` 为点赞，`[photo:file] caption` 为媒体，其余为文本
//!
//! 未给出名字时用户名为 `user<id>`。
//! 用户参数：`@name` 为用户名，`#123` 为数字ID，其余按 OID 或用户名解析。

use std::sync::Arc;

use application::{
    Actor, Command, EditRequest, EventSource, InboundEvent, MessageRef, RelayRequest, Signing,
    SourceError, Target,
};
use async_trait::async_trait;
use domain::{ContentKind, MessageContent, Rank, TransportMessageId, UserId};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

use crate::console::TransportIds;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing user id")]
    MissingUser,
    #[error("invalid user id: {0}")]
    InvalidUser(String),
    #[error("invalid message reference: {0}")]
    InvalidReference(String),
    #[error("/{0} must reply to a message")]
    ReplyRequired(&'static str),
    #[error("/{0} needs an argument")]
    ArgumentRequired(&'static str),
    #[error("unknown command: /{0}")]
    UnknownCommand(String),
    #[error("unknown media kind: {0}")]
    UnknownMedia(String),
    #[error("empty message")]
    Empty,
}

enum Reference {
    None,
    Reply(TransportMessageId),
    Edit(TransportMessageId),
}

/// 解析一行输入；普通消息会为作者自己的副本分配一个传输层ID
pub fn parse_line(line: &str, ids: &TransportIds) -> Result<InboundEvent, ParseError> {
    let line = line.trim();
    let (head, rest) = split_word(line);
    if head.is_empty() {
        return Err(ParseError::MissingUser);
    }
    let actor = parse_actor(head)?;

    let (reference, body) = match rest.chars().next() {
        Some('>') | Some('~') => {
            let (token, body) = split_word(rest);
            let id = token[1..]
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidReference(token.to_string()))?;
            let id = TransportMessageId(id);
            if token.starts_with('>') {
                (Reference::Reply(id), body)
            } else {
                (Reference::Edit(id), body)
            }
        }
        _ => (Reference::None, rest),
    };

    let command = match reference {
        Reference::Edit(source_id) => {
            if body.is_empty() {
                return Err(ParseError::Empty);
            }
            Command::Edit(EditRequest {
                source_id,
                content: MessageContent::text(body),
                signing: Signing::Anonymous,
            })
        }
        Reference::Reply(reply) => parse_body(body, Some(reply), ids)?,
        Reference::None => parse_body(body, None, ids)?,
    };
    Ok(InboundEvent::new(actor, command))
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn parse_actor(head: &str) -> Result<Actor, ParseError> {
    let (id, name) = match head.split_once(':') {
        Some((id, name)) if !name.is_empty() => (id, Some(name.to_string())),
        _ => (head, None),
    };
    let id: i64 = id
        .parse()
        .map_err(|_| ParseError::InvalidUser(head.to_string()))?;
    let name = name.unwrap_or_else(|| format!("user{id}"));
    Ok(Actor::new(id, Some(name.clone()), name))
}

fn parse_target(arg: &str) -> Target {
    if let Some(name) = arg.strip_prefix('@') {
        return Target::Username(name.to_string());
    }
    if let Some(id) = arg.strip_prefix('#').and_then(|id| id.parse::<i64>().ok()) {
        return Target::Id(UserId(id));
    }
    let is_oid = arg.len() == 4
        && arg
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='v').contains(&c));
    if is_oid {
        Target::Oid(arg.to_string())
    } else {
        Target::Username(arg.to_string())
    }
}

fn parse_media(body: &str) -> Result<Option<MessageContent>, ParseError> {
    let Some(inner) = body.strip_prefix('[') else {
        return Ok(None);
    };
    let Some((tag, caption)) = inner.split_once(']') else {
        return Ok(None);
    };
    let (kind, file) = tag.split_once(':').unwrap_or((tag, ""));
    let kind = match kind {
        "sticker" => ContentKind::Sticker,
        "photo" => ContentKind::Photo,
        "animation" => ContentKind::Animation,
        "video" => ContentKind::Video,
        "document" => ContentKind::Document,
        "audio" => ContentKind::Audio,
        "voice" => ContentKind::Voice,
        other => return Err(ParseError::UnknownMedia(other.to_string())),
    };
    let caption = caption.trim();
    let caption = (!caption.is_empty()).then(|| caption.to_string());
    Ok(Some(MessageContent::media(kind, file, caption)))
}

fn relay(content: MessageContent, reply_to: Option<TransportMessageId>, signing: Signing, ids: &TransportIds) -> Command {
    Command::Relay(RelayRequest {
        content,
        reply_to,
        source_id: Some(ids.next()),
        signing,
    })
}

fn parse_body(
    body: &str,
    reply: Option<TransportMessageId>,
    ids: &TransportIds,
) -> Result<Command, ParseError> {
    if body.is_empty() {
        return Err(ParseError::Empty);
    }
    if body == "+1" {
        let reply = reply.ok_or(ParseError::ReplyRequired("+1"))?;
        return Ok(Command::GiveKarma(MessageRef::Reply(reply)));
    }
    let Some(command) = body.strip_prefix('/') else {
        let content = match parse_media(body)? {
            Some(media) => media,
            None => MessageContent::text(body),
        };
        return Ok(relay(content, reply, Signing::Anonymous, ids));
    };

    let (name, arg) = split_word(command);
    let name = name.to_ascii_lowercase();
    let message = |cmd: &'static str| -> Result<MessageRef, ParseError> {
        reply
            .map(MessageRef::Reply)
            .ok_or(ParseError::ReplyRequired(cmd))
    };
    let target = |cmd: &'static str| -> Result<Target, ParseError> {
        match reply {
            Some(id) => Ok(Target::Message(MessageRef::Reply(id))),
            None if !arg.is_empty() => Ok(parse_target(split_word(arg).0)),
            None => Err(ParseError::ArgumentRequired(cmd)),
        }
    };
    let text = |cmd: &'static str| -> Result<String, ParseError> {
        if arg.is_empty() {
            Err(ParseError::ArgumentRequired(cmd))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name.as_str() {
        "start" => Command::Join,
        "stop" => Command::Leave,
        "users" => Command::Users,
        "info" => match reply {
            Some(id) => Command::ModInfo(MessageRef::Reply(id)),
            None => Command::Info,
        },
        "help" if arg.is_empty() => Command::Help,
        "help" => Command::SetHelp(arg.to_string()),
        "modhelp" => Command::ModHelp,
        "adminhelp" => Command::AdminHelp,
        "motd" | "rules" if arg.is_empty() => Command::Motd,
        "motd" | "rules" => Command::SetMotd(arg.to_string()),
        "toggledebug" => Command::ToggleDebug,
        "togglekarma" => Command::ToggleKarma,
        "tripcodetoggle" => Command::ToggleTripcode,
        "tripcode" if arg.is_empty() => Command::Tripcode,
        "tripcode" => Command::SetTripcode(arg.to_string()),
        "t" | "tsign" => relay(MessageContent::text(text("tsign")?), reply, Signing::Tripcode, ids),
        "s" | "sign" => relay(MessageContent::text(text("sign")?), reply, Signing::Expose, ids),
        "exposeto" => Command::ExposeTo {
            message: message("exposeto")?,
            confirmed: arg.eq_ignore_ascii_case("yes"),
        },
        "modsay" => Command::ModSay(text("modsay")?),
        "adminsay" => Command::AdminSay(text("adminsay")?),
        "mod" => Command::Promote {
            target: target("mod")?,
            rank: Rank::Mod,
        },
        "admin" => Command::Promote {
            target: target("admin")?,
            rank: Rank::Admin,
        },
        "demote" => Command::Demote(target("demote")?),
        "warn" => Command::Warn {
            message: message("warn")?,
            delete: false,
        },
        "delete" => Command::Warn {
            message: message("delete")?,
            delete: true,
        },
        "remove" => Command::Remove(message("remove")?),
        "uncooldown" => Command::Uncooldown(target("uncooldown")?),
        "whitelist" => Command::Whitelist(target("whitelist")?),
        "unwhitelist" => Command::Unwhitelist(target("unwhitelist")?),
        "blacklist" | "ban" => {
            let (target, reason) = match reply {
                Some(id) => (Target::Message(MessageRef::Reply(id)), arg),
                None => {
                    let (who, reason) = split_word(arg);
                    if who.is_empty() {
                        return Err(ParseError::ArgumentRequired("blacklist"));
                    }
                    (parse_target(who), reason)
                }
            };
            Command::Blacklist {
                target,
                reason: reason.to_string(),
            }
        }
        "unblacklist" | "unban" => Command::Unblacklist(target("unblacklist")?),
        "lock" => Command::Lock {
            message: message("lock")?,
            locked: true,
        },
        "unlock" => Command::Lock {
            message: message("unlock")?,
            locked: false,
        },
        "muzzle" => Command::Muzzle {
            target: target("muzzle")?,
            muzzled: true,
        },
        "unmuzzle" => Command::Muzzle {
            target: target("unmuzzle")?,
            muzzled: false,
        },
        "reset" => Command::ResetKarma(target("reset")?),
        "cleanup" => Command::Cleanup(target("cleanup")?),
        "lockdown" => Command::Lockdown,
        "mute" => Command::Mute,
        _ => return Err(ParseError::UnknownCommand(name)),
    };
    Ok(command)
}

/// 从文本流读取事件，无法解析的行记录后跳过
pub struct ConsoleSource<R> {
    lines: Lines<R>,
    ids: Arc<TransportIds>,
}

impl ConsoleSource<BufReader<Stdin>> {
    pub fn stdin(ids: Arc<TransportIds>) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), ids)
    }
}

impl<R> ConsoleSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, ids: Arc<TransportIds>) -> Self {
        Self {
            lines: reader.lines(),
            ids,
        }
    }
}

#[async_trait]
impl<R> EventSource for ConsoleSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn connect(&mut self) -> Result<(), SourceError> {
        info!("Console source ready");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<InboundEvent>, SourceError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(err) => return Err(SourceError::Transient(err.to_string())),
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line, &self.ids) {
                Ok(event) => return Ok(Some(event)),
                Err(err) => warn!(error = %err, line = %line, "Ignoring console input"),
            }
        }
    }
}
