//! 会话生命周期与面向普通用户的命令

use std::sync::atomic::Ordering;

use domain::{Rank, Reply, Tripcode, User};
use rand::Rng;
use tracing::info;

use super::{Actor, ModerationEngine, Outcome, Rejection};
use crate::store::{AccessList, UserOrder};

impl ModerationEngine {
    /// 加入需要白名单时（白名单模式或封锁期间）的检查
    fn join_gated(&self) -> bool {
        self.settings.features.whitelist || self.is_lockdown()
    }

    fn not_whitelisted_reply(&self) -> Reply {
        Reply::ErrNotWhitelisted {
            contact: self.settings.features.blacklist_contact.clone(),
        }
    }

    async fn with_motd(&self, mut replies: Vec<Reply>) -> Outcome {
        let motd = self.store().system_config().await?.motd;
        if !motd.is_empty() {
            replies.push(Reply::custom(motd));
        }
        Ok(replies)
    }

    pub(super) async fn join(&self, actor: &Actor) -> Outcome {
        let now = self.now();
        let gated = self.join_gated();

        if let Some(mut user) = self.ledger.checkout(actor.id).await? {
            actor.apply_to(&mut user, self.clock.as_ref());
            let rejection = if gated
                && !self
                    .store()
                    .list_contains(AccessList::Whitelist, actor.id)
                    .await?
            {
                info!(user_id = %actor.id, "Rejoin rejected: not whitelisted");
                if !user.is_joined() && !user.is_blacklisted() {
                    user.hold_for_whitelist(now);
                }
                Some(self.not_whitelisted_reply())
            } else if user.is_blacklisted() {
                Some(self.blacklisted_reply(&user))
            } else if user.is_joined() {
                Some(Reply::UserInChat)
            } else {
                user.rejoin();
                None
            };
            let user = user.commit().await?;

            if let Some(reply) = rejection {
                return Err(reply.into());
            }
            info!(user_id = %user.id, "User rejoined chat");
            return self.with_motd(vec![Reply::ChatJoin]).await;
        }

        let first = !self.store().has_users().await?;
        let salt = format!("{:08x}", rand::rng().random::<u32>());
        let mut user = User::register(actor.id, actor.realname.clone(), salt, now);
        user.username = actor.username.clone();

        let mut replies = vec![Reply::ChatJoin];
        if first {
            user.rank = Rank::Owner;
            self.store()
                .add_to_list(AccessList::Whitelist, user.id)
                .await?;
        }
        if self
            .store()
            .list_contains(AccessList::Blacklist, user.id)
            .await?
        {
            user.set_blacklisted(String::new(), now);
            replies = vec![self.blacklisted_reply(&user)];
        } else if gated
            && !self
                .store()
                .list_contains(AccessList::Whitelist, user.id)
                .await?
        {
            user.hold_for_whitelist(now);
            replies = vec![self.not_whitelisted_reply()];
        }

        if !self.ledger.register(user.clone()).await? {
            // 并发的另一次加入已创建了记录
            return Err(Reply::UserInChat.into());
        }
        self.notify_admins(Reply::NewUser, Some(user.id)).await?;

        if user.is_joined() {
            info!(user_id = %user.id, rank = %user.rank, "User joined chat");
            self.with_motd(replies).await
        } else {
            info!(user_id = %user.id, membership = ?user.membership(), "User registered without joining");
            Ok(replies)
        }
    }

    pub(super) async fn leave(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        self.force_user_leave(user.id, false).await;
        info!(user_id = %user.id, "User left chat");
        Ok(vec![Reply::ChatLeave])
    }

    pub(super) async fn info(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        let now = self.now();
        Ok(vec![Reply::UserInfo {
            oid: user.obfuscated_id(now.date()),
            username: user.formatted_name(),
            rank: user.rank,
            karma: user.karma,
            warnings: user.warnings,
            warn_expiry: user.warn_expiry,
            cooldown: user.cooldown_until.filter(|_| user.is_in_cooldown(now)),
        }])
    }

    pub(super) async fn users(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        let users = self.store().iterate_users(UserOrder::Unordered).await?;

        if user.rank < Rank::Mod {
            let count = users.iter().filter(|u| u.is_joined()).count();
            return Ok(vec![Reply::UsersInfo { count }]);
        }

        let (mut active, mut inactive, mut blacklisted) = (0, 0, 0);
        for u in &users {
            if u.is_blacklisted() {
                blacklisted += 1;
            } else if u.is_joined() {
                active += 1;
            } else {
                inactive += 1;
            }
        }
        Ok(vec![Reply::UsersInfoExtended {
            active,
            inactive,
            blacklisted,
            total: active + inactive + blacklisted,
        }])
    }

    pub(super) async fn motd(&self, actor: &Actor) -> Outcome {
        self.require_user(actor).await?;
        self.with_motd(Vec::new()).await
    }

    pub(super) async fn set_motd(&self, actor: &Actor, text: String) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let mut config = self.store().system_config().await?;
        config.motd = text;
        self.store().set_system_config(config).await?;
        info!(user_id = %user.id, "Motd updated");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn help(&self, actor: &Actor) -> Outcome {
        self.require_user(actor).await?;
        let help = self.store().system_config().await?.help;
        if help.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Reply::custom(help)])
    }

    /// mod 与 admin 各自的命令说明，等级不足时静默
    pub(super) async fn staff_help(&self, actor: &Actor, rank: Rank) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, rank)?;
        Ok(vec![if rank >= Rank::Admin {
            Reply::HelpAdmin
        } else {
            Reply::HelpModerator
        }])
    }

    pub(super) async fn set_help(&self, actor: &Actor, text: String) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let mut config = self.store().system_config().await?;
        config.help = text;
        self.store().set_system_config(config).await?;
        info!(user_id = %user.id, "Help text updated");
        Ok(vec![Reply::Success])
    }

    async fn toggle<F>(&self, actor: &Actor, f: F) -> Result<bool, Rejection>
    where
        F: FnOnce(&mut User) -> bool + Send,
    {
        let user = self.require_user(actor).await?;
        let (_, enabled) = self
            .ledger
            .modify(user.id, f)
            .await?
            .ok_or(Rejection::Reply(Reply::UserNotInChat))?;
        Ok(enabled)
    }

    pub(super) async fn toggle_debug(&self, actor: &Actor) -> Outcome {
        let enabled = self
            .toggle(actor, |user| {
                user.debug_enabled = !user.debug_enabled;
                user.debug_enabled
            })
            .await?;
        Ok(vec![Reply::boolean_config("Debug mode", enabled)])
    }

    pub(super) async fn toggle_karma(&self, actor: &Actor) -> Outcome {
        let hidden = self
            .toggle(actor, |user| {
                user.hide_karma = !user.hide_karma;
                user.hide_karma
            })
            .await?;
        Ok(vec![Reply::boolean_config("Karma notifications", !hidden)])
    }

    pub(super) async fn toggle_tripcode(&self, actor: &Actor) -> Outcome {
        let enabled = self
            .toggle(actor, |user| {
                user.tripcode_toggle = !user.tripcode_toggle;
                user.tripcode_toggle
            })
            .await?;
        Ok(vec![Reply::boolean_config("Username (tripcode)", enabled)])
    }

    pub(super) async fn tripcode(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        Ok(vec![Reply::TripcodeInfo {
            tripcode: user.tripcode.as_ref().map(|t| t.as_str().to_owned()),
        }])
    }

    pub(super) async fn set_tripcode(&self, actor: &Actor, text: &str) -> Outcome {
        let user = self.require_user(actor).await?;
        let now = self.now();

        let interval = self.settings.features.tripcode_interval();
        if interval > time::Duration::SECOND {
            if let Some(last_used) = user.tripcode_last_used {
                let elapsed = now - last_used;
                if elapsed < interval {
                    return Err(Reply::ErrSpammyTripcode {
                        time_left: interval - elapsed,
                    }
                    .into());
                }
            }
        }

        let tripcode = Tripcode::parse(text).map_err(|_| Reply::ErrInvalidTripFormat)?;
        let (_, identity) = self
            .ledger
            .modify(user.id, |user| user.set_tripcode(tripcode, now))
            .await?
            .ok_or(Rejection::Reply(Reply::UserNotInChat))?;
        info!(user_id = %user.id, tripname = %identity.name, "Tripcode changed");
        Ok(vec![Reply::TripcodeSet {
            tripname: identity.name,
            triphash: identity.hash,
        }])
    }

    pub(super) async fn toggle_lockdown(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let enabled = !self.lockdown.fetch_xor(true, Ordering::SeqCst);
        info!(user_id = %user.id, enabled, "Lockdown toggled");
        self.notify_admins(Reply::Lockdown { enabled }, Some(user.id))
            .await?;
        Ok(vec![Reply::Lockdown { enabled }])
    }

    pub(super) async fn toggle_mute(&self, actor: &Actor) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let enabled = !self.mute.fetch_xor(true, Ordering::SeqCst);
        info!(user_id = %user.id, enabled, "Mute toggled");
        self.notify_admins(Reply::Mute { enabled }, Some(user.id))
            .await?;
        Ok(vec![Reply::Mute { enabled }])
    }
}
