//! 类型化回复与转发消息的纯文本渲染

use domain::{ContentKind, Outbound, RelayedMessage, Reply, Signature, Timestamp};
use time::Duration;

const MOD_HELP: &str = "Moderators can use the following commands:
  /modhelp - show this text
  /modsay <message> - send an official moderator message

Or reply to a message and use:
  /info - get info about the user that sent this message
  /warn - warn the user that sent this message (cooldown)
  /lock - stop people from exposing themselves through that message (or /unlock)
  /blacklist [reason] - blacklist the user who sent this message (or /ban)
  /delete - delete a message and warn the user
  /remove - delete a message without a cooldown or warning
  /cleanup - remove all posts of the user";

const ADMIN_HELP: &str = "Admins can use the following commands:
  /adminhelp - show this text
  /adminsay <message> - send an official admin message
  /motd <message> - set the welcome message
  /uncooldown <id | username> - remove cooldown from a user
  /whitelist <username | id> - add a user to the whitelist
  /mod <username> - promote a user to the moderator rank
  /admin <username> - promote a user to the admin rank
  /demote - demote an admin or mod to user rank
  /muzzle - restrict karma and exposing (or /unmuzzle)
  /reset - reset a user's karma to 0
  /lockdown - hold new joins for the whitelist
  /mute - limit the chat to admins

Or reply to a message and use:
  /unblacklist - unban the user (or /unban)";

pub fn render_outbound(message: &Outbound) -> String {
    match message {
        Outbound::System(reply) => render_reply(reply),
        Outbound::Relayed(relayed) => render_relayed(relayed),
    }
}

pub fn render_relayed(message: &RelayedMessage) -> String {
    let mut out = String::new();
    match &message.signature {
        Some(Signature::Tripcode(identity)) => {
            out.push_str(&format!("{} {}:\n", identity.name, identity.hash));
        }
        Some(Signature::Exposed { name }) => out.push_str(&format!("{name}:\n")),
        None => {}
    }

    let content = &message.content;
    if content.forwarded {
        out.push_str("[forwarded] ");
    }
    if content.kind != ContentKind::Text {
        out.push_str(&format!("[{}] ", kind_label(content.kind)));
    }
    if let Some(text) = &content.text {
        out.push_str(text);
    }
    if message.edited {
        out.push_str(" (edited)");
    }
    out.trim_end().to_string()
}

fn kind_label(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Text => "text",
        ContentKind::Sticker => "sticker",
        ContentKind::Photo => "photo",
        ContentKind::Animation => "animation",
        ContentKind::Video => "video",
        ContentKind::VideoNote => "video note",
        ContentKind::Document => "document",
        ContentKind::Audio => "audio",
        ContentKind::Voice => "voice",
        ContentKind::Location => "location",
        ContentKind::Venue => "venue",
        ContentKind::Contact => "contact",
        ContentKind::Poll => "poll",
    }
}

fn smiley(warnings: u32) -> &'static str {
    match warnings {
        0 => ":)",
        1 => ":|",
        2..=3 => ":/",
        _ => ":(",
    }
}

pub fn format_timestamp(at: Timestamp) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02} UTC",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute()
    )
}

/// 取最大的整单位：天、小时或分钟
pub fn format_duration(duration: Duration) -> String {
    let minutes = duration.whole_minutes().max(0);
    if minutes >= 24 * 60 && minutes % (24 * 60) == 0 {
        format!("{}d", minutes / (24 * 60))
    } else if minutes >= 60 && minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn with_contact(text: String, contact: &Option<String>) -> String {
    match contact {
        Some(contact) => format!("{text}\ncontact: {contact}"),
        None => text,
    }
}

fn cooldown_text(cooldown: &Option<Timestamp>) -> String {
    match cooldown {
        Some(until) => format!("yes, until {}", format_timestamp(*until)),
        None => "no".to_string(),
    }
}

pub fn render_reply(reply: &Reply) -> String {
    match reply {
        Reply::Custom { text } => text.clone(),
        Reply::Success => "Done.".to_string(),
        Reply::BooleanConfig {
            description,
            enabled,
        } => format!(
            "{description}: {}",
            if *enabled { "enabled" } else { "disabled" }
        ),

        Reply::ChatJoin => "You joined the chat!".to_string(),
        Reply::ChatLeave => "You left the chat!".to_string(),
        Reply::UserInChat => "You're already in the chat.".to_string(),
        Reply::UserNotInChat => "You're not in the chat yet. Use /start to join!".to_string(),
        Reply::GivenCooldown { duration, deleted } => {
            let mut text = format!(
                "You've been handed a cooldown of {} for this message",
                format_duration(*duration)
            );
            if *deleted {
                text.push_str(" (message was deleted)");
            }
            text
        }
        Reply::MessageDeleted => "Your message has been deleted, with no penalty.".to_string(),
        Reply::PromotedMod => "You've been promoted to moderator.".to_string(),
        Reply::PromotedAdmin => "You've been promoted to admin.".to_string(),
        Reply::Demoted => "You were demoted.".to_string(),
        Reply::KarmaThankYou => "You just gave this user some sweet karma, awesome!".to_string(),
        Reply::KarmaNotification => "You got +1 karma!".to_string(),
        Reply::TripcodeInfo { tripcode } => format!(
            "tripcode: {}",
            tripcode.as_deref().unwrap_or("unset")
        ),
        Reply::TripcodeSet { tripname, triphash } => {
            format!("Tripcode set. It will appear as:\n{tripname} {triphash}")
        }
        Reply::NewUser => "A new user has joined.".to_string(),
        Reply::WhitelistSuccess => "You have been whitelisted, welcome!".to_string(),
        Reply::ExposeTo { name, handle } => {
            format!("{name} has revealed themselves to you privately as {handle}!")
        }
        Reply::Exposed => "Your real handle has been exposed to anon.".to_string(),
        Reply::HelpModerator => MOD_HELP.to_string(),
        Reply::HelpAdmin => ADMIN_HELP.to_string(),
        Reply::ModMessage { text } => format!("{text}\n  ~ moderators"),
        Reply::AdminMessage { text } => format!("{text}\n  ~ admins"),
        Reply::Lockdown { enabled } => format!(
            "Lockdown {}",
            if *enabled { "enabled" } else { "disabled" }
        ),
        Reply::Mute { enabled } => format!(
            "Chat mute {}",
            if *enabled { "enabled" } else { "disabled" }
        ),
        Reply::MessageLocked { locked } => format!(
            "Message {}",
            if *locked { "locked" } else { "unlocked" }
        ),
        Reply::Muzzled { muzzled } => format!(
            "User {}",
            if *muzzled { "muzzled" } else { "unmuzzled" }
        ),
        Reply::CleanedUp { count } => format!("Removed {count} messages."),

        Reply::UserInfo {
            oid,
            username,
            rank,
            karma,
            warnings,
            warn_expiry,
            cooldown,
        } => {
            let mut text = format!(
                "id: {oid}, name: {username}\nrank: {} ({rank}), karma: {karma}\nwarnings: {warnings} {}",
                rank.value(),
                smiley(*warnings)
            );
            if let (true, Some(expiry)) = (*warnings > 0, warn_expiry) {
                text.push_str(&format!(
                    " (one warning will be removed on {})",
                    format_timestamp(*expiry)
                ));
            }
            text.push_str(&format!(", cooldown: {}", cooldown_text(cooldown)));
            text
        }
        Reply::UserInfoMod {
            oid,
            karma,
            cooldown,
            muzzled,
        } => {
            let mut text = format!(
                "id: {oid}, karma: {karma}\ncooldown: {}",
                cooldown_text(cooldown)
            );
            if *muzzled {
                text.push_str("\nmuzzled");
            }
            text
        }
        Reply::UsersInfo { count } => format!("{count} users"),
        Reply::UsersInfoExtended {
            active,
            inactive,
            blacklisted,
            total,
        } => format!(
            "{active} active, {inactive} inactive and {blacklisted} blacklisted users (total: {total})"
        ),

        Reply::ErrCommandDisabled => "This command has been disabled.".to_string(),
        Reply::ErrNoEditing => "Edits will not be seen by other members.".to_string(),
        Reply::ErrNotInCache => {
            "Message not found in cache... (36h passed or the relay was restarted)".to_string()
        }
        Reply::ErrNoUser => "No user found by that name!".to_string(),
        Reply::ErrNoUserById => {
            "No user found by that id! Note that all ids rotate every 24 hours.".to_string()
        }
        Reply::ErrAlreadyWarned => "A warning has already been issued for this message.".to_string(),
        Reply::ErrNotInCooldown => "This user is not in a cooldown right now.".to_string(),
        Reply::ErrCooldown { until } => {
            format!("Your cooldown expires at {}", format_timestamp(*until))
        }
        Reply::ErrNotWhitelisted { contact } => {
            with_contact("You haven't been whitelisted.".to_string(), contact)
        }
        Reply::ErrAlreadyWhitelisted => {
            "This user has already been added to the whitelist.".to_string()
        }
        Reply::ErrNotBlacklisted => "This user has not been banned.".to_string(),
        Reply::ErrAlreadyBlacklisted => "This user has already been banned.".to_string(),
        Reply::ErrBlacklisted { reason, contact } => {
            let text = match reason {
                Some(reason) if !reason.is_empty() => format!("You've been blacklisted for {reason}"),
                _ => "You've been blacklisted".to_string(),
            };
            with_contact(text, contact)
        }
        Reply::ErrAlreadyUpvoted => "You have already upvoted this message.".to_string(),
        Reply::ErrUpvoteOwnMessage => "You can't upvote your own message.".to_string(),
        Reply::ErrMessageLocked => "This message has been locked.".to_string(),
        Reply::ErrSpammy => {
            "Your message has not been sent. Avoid sending messages too fast, try again later."
                .to_string()
        }
        Reply::ErrSpammyTripcode { time_left } => format!(
            "Your tripcode cannot be changed for another {}.",
            format_duration(*time_left)
        ),
        Reply::ErrInvalidTripFormat => {
            "Given tripcode is not valid, the format is name#pass.".to_string()
        }
        Reply::ErrNoTripcode => "You don't have a tripcode set.".to_string(),
        Reply::ErrNeedTripcode => {
            "This chat requires a tripcode to be set before you can send messages. Use /tripcode name#password.".to_string()
        }
        Reply::ErrMediaLimit => {
            "You can't send media or forward messages at this time, try again later.".to_string()
        }
        Reply::ErrNothingToDo => "Already done!".to_string(),
        Reply::ErrExposeConfirm => {
            "This will expose your real username.\nUse /exposeto yes while replying to someone's message to confirm.".to_string()
        }
    }
}
