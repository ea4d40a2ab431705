//! 需要管理等级的命令

use domain::{Membership, Rank, Reply, User, UserId};
use tracing::info;

use super::{Actor, MessageRef, ModerationEngine, Outcome, Rejection, Target};
use crate::dispatcher::Audience;
use crate::store::AccessList;

impl ModerationEngine {
    /// 在目标锁下修改记录；目标在此期间消失时视为找不到用户
    pub(super) async fn modify_target<F, R>(&self, id: UserId, f: F) -> Result<(User, R), Rejection>
    where
        F: FnOnce(&mut User) -> R + Send,
    {
        self.ledger
            .modify(id, f)
            .await?
            .ok_or(Rejection::Reply(Reply::ErrNoUser))
    }

    pub(super) async fn mod_info(&self, actor: &Actor, message: MessageRef) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        let target = self
            .resolve_target(actor, &Target::Message(message))
            .await?;

        let now = self.now();
        let karma = target.obfuscated_karma(&mut rand::rng());
        Ok(vec![Reply::UserInfoMod {
            oid: target.obfuscated_id(now.date()),
            karma,
            cooldown: target.cooldown_until.filter(|_| target.is_in_cooldown(now)),
            muzzled: target.muzzled,
        }])
    }

    pub(super) async fn promote(&self, actor: &Actor, target: Target, rank: Rank) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        if rank >= user.rank || rank <= Rank::User {
            return Err(Rejection::Silent);
        }
        let target = self.resolve_target(actor, &target).await?;
        Self::require_above(&user, &target)?;
        if target.rank >= rank {
            return Err(Reply::ErrNothingToDo.into());
        }

        self.modify_target(target.id, |t| t.rank = rank).await?;
        let notice = if rank >= Rank::Admin {
            Reply::PromotedAdmin
        } else {
            Reply::PromotedMod
        };
        self.notify(notice, Audience::User(target.id), None).await;
        info!(user_id = %target.id, by = %user.id, rank = %rank, "User promoted");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn demote(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let target = self.resolve_target(actor, &target).await?;
        Self::require_above(&user, &target)?;
        if target.rank <= Rank::User {
            return Err(Reply::ErrNothingToDo.into());
        }

        self.modify_target(target.id, |t| t.rank = Rank::User).await?;
        self.notify(Reply::Demoted, Audience::User(target.id), None)
            .await;
        info!(user_id = %target.id, by = %user.id, "User demoted");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn warn(&self, actor: &Actor, message: MessageRef, delete: bool) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        let msid = self.resolve_message(actor, message)?;
        let target = self
            .resolve_target(actor, &Target::Message(MessageRef::Id(msid)))
            .await?;
        Self::require_above(&user, &target)?;

        // 检查与置位在同一临界区内完成，同一条消息只会被警告一次
        let already_warned = self
            .cache
            .update(msid, |cm| std::mem::replace(&mut cm.warned, true))
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))?;

        if !already_warned {
            let now = self.now();
            let policy = &self.settings.warnings;
            let penalty = self.settings.karma.warn_penalty;
            let (warned, duration) = self
                .modify_target(target.id, |t| {
                    let duration = t.add_warning(policy, now);
                    t.karma -= penalty;
                    duration
                })
                .await?;
            self.notify(
                Reply::GivenCooldown {
                    duration,
                    deleted: delete,
                },
                Audience::User(warned.id),
                Some(msid),
            )
            .await;
            info!(
                user_id = %warned.id,
                by = %user.id,
                msid = %msid,
                warnings = warned.warnings,
                deleted = delete,
                "User warned"
            );
        } else if !delete {
            return Err(Reply::ErrAlreadyWarned.into());
        }

        if delete {
            self.dispatcher.delete(msid, Some(user.id)).await;
        }
        Ok(vec![Reply::Success])
    }

    pub(super) async fn remove_message(&self, actor: &Actor, message: MessageRef) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        if !self.settings.features.allow_remove_command {
            return Err(Reply::ErrCommandDisabled.into());
        }
        let msid = self.resolve_message(actor, message)?;
        let target = self
            .resolve_target(actor, &Target::Message(MessageRef::Id(msid)))
            .await?;
        Self::require_above(&user, &target)?;

        self.notify(Reply::MessageDeleted, Audience::User(target.id), Some(msid))
            .await;
        self.dispatcher.delete(msid, Some(user.id)).await;
        info!(user_id = %target.id, by = %user.id, msid = %msid, "Message removed");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn uncooldown(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let target = self.resolve_target(actor, &target).await?;
        let now = self.now();
        if !target.is_in_cooldown(now) {
            return Err(Reply::ErrNotInCooldown.into());
        }

        let policy = &self.settings.warnings;
        let (_, was_until) = self
            .modify_target(target.id, |t| {
                t.remove_warning(policy, now);
                t.cooldown_until.take()
            })
            .await?;
        info!(user_id = %target.id, by = %user.id, ?was_until, "Cooldown removed");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn whitelist(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        // 等待批准的用户尚未加入，这里不要求目标已加入
        let id = match &target {
            Target::Id(id) => *id,
            Target::Username(name) => self
                .find_by_username(name, false)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser))?
                .id,
            _ => self.resolve_target(actor, &target).await?.id,
        };

        if !self.store().add_to_list(AccessList::Whitelist, id).await? {
            return Err(Reply::ErrAlreadyWhitelisted.into());
        }
        info!(user_id = %id, by = %user.id, "User whitelisted");

        let admitted = self
            .ledger
            .modify(id, |t| {
                // 只有被白名单拦下的加入请求才会被放行，主动离开的用户保持离开
                let waiting = t.membership() == Membership::AwaitingWhitelist;
                if waiting {
                    t.rejoin();
                }
                waiting
            })
            .await?;
        if let Some((_, true)) = admitted {
            info!(user_id = %id, "Whitelisted user admitted to chat");
            self.notify(Reply::WhitelistSuccess, Audience::User(id), None)
                .await;
        }
        Ok(vec![Reply::Success])
    }

    pub(super) async fn unwhitelist(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let id = match &target {
            Target::Id(id) => *id,
            Target::Username(name) => self
                .find_by_username(name, false)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser))?
                .id,
            _ => self.resolve_target(actor, &target).await?.id,
        };
        if id == user.id {
            return Err(Rejection::Silent);
        }
        if !self.store().remove_from_list(AccessList::Whitelist, id).await? {
            return Err(Reply::ErrNothingToDo.into());
        }
        info!(user_id = %id, by = %user.id, "User removed from whitelist");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn blacklist(&self, actor: &Actor, target: Target, reason: String) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        let msid = match &target {
            Target::Message(message) => Some(self.resolve_message(actor, *message)?),
            _ => None,
        };
        let target = self.resolve_target(actor, &target).await?;
        if target.is_blacklisted() {
            return Err(Reply::ErrAlreadyBlacklisted.into());
        }
        Self::require_above(&user, &target)?;

        let now = self.now();
        let (banned, ()) = self
            .modify_target(target.id, |t| t.set_blacklisted(reason.clone(), now))
            .await?;
        if let Some(msid) = msid {
            self.cache.update(msid, |cm| cm.warned = true);
        }
        self.store()
            .add_to_list(AccessList::Blacklist, banned.id)
            .await?;

        // 先取消排队中的投递，再发送通知
        self.dispatcher.stop_invoked(banned.id, true).await;
        self.notify(self.blacklisted_reply(&banned), Audience::User(banned.id), msid)
            .await;

        let mut purged: Vec<_> = self.cache.all_mappings(banned.id).into_iter().collect();
        purged.sort();
        for authored in &purged {
            self.dispatcher.delete(*authored, Some(user.id)).await;
        }
        info!(
            user_id = %banned.id,
            by = %user.id,
            reason = %reason,
            purged = purged.len(),
            "User blacklisted"
        );
        Ok(vec![Reply::Success])
    }

    pub(super) async fn unblacklist(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        // 被封禁的用户不在会话中，按用户名查找时需要包含离开的用户
        let target = match &target {
            Target::Username(name) => self
                .find_by_username(name, false)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser))?,
            _ => self.resolve_target(actor, &target).await?,
        };
        if !target.is_blacklisted() {
            return Err(Reply::ErrNotBlacklisted.into());
        }

        self.modify_target(target.id, User::unblacklist).await?;
        self.store()
            .remove_from_list(AccessList::Blacklist, target.id)
            .await?;
        info!(user_id = %target.id, by = %user.id, "User unblacklisted");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn muzzle(&self, actor: &Actor, target: Target, muzzled: bool) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        let target = self.resolve_target(actor, &target).await?;
        Self::require_above(&user, &target)?;
        if target.muzzled == muzzled {
            return Err(Reply::ErrNothingToDo.into());
        }

        self.modify_target(target.id, |t| t.muzzled = muzzled)
            .await?;
        info!(user_id = %target.id, by = %user.id, muzzled, "Muzzle changed");
        Ok(vec![Reply::Muzzled { muzzled }])
    }

    pub(super) async fn lock(&self, actor: &Actor, message: MessageRef, locked: bool) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        let msid = self.resolve_message(actor, message)?;
        self.cache
            .update(msid, |cm| cm.locked = locked)
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))?;
        info!(msid = %msid, by = %user.id, locked, "Message lock changed");
        Ok(vec![Reply::MessageLocked { locked }])
    }

    pub(super) async fn reset_karma(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let target = self.resolve_target(actor, &target).await?;
        Self::require_above(&user, &target)?;

        let (_, previous) = self
            .modify_target(target.id, |t| std::mem::take(&mut t.karma))
            .await?;
        info!(user_id = %target.id, by = %user.id, previous, "Karma reset");
        Ok(vec![Reply::Success])
    }

    pub(super) async fn mod_say(&self, actor: &Actor, text: String) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Mod)?;
        info!(user_id = %user.id, "Moderator broadcast");
        self.notify(Reply::ModMessage { text }, Audience::everyone(), None)
            .await;
        Ok(Vec::new())
    }

    pub(super) async fn admin_say(&self, actor: &Actor, text: String) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        info!(user_id = %user.id, "Admin broadcast");
        self.notify(Reply::AdminMessage { text }, Audience::everyone(), None)
            .await;
        Ok(Vec::new())
    }

    /// 删除某个用户仍在缓存中的全部消息
    pub(super) async fn cleanup(&self, actor: &Actor, target: Target) -> Outcome {
        let user = self.require_user(actor).await?;
        Self::require_rank(&user, Rank::Admin)?;
        let target = match &target {
            Target::Username(name) => self
                .find_by_username(name, false)
                .await?
                .ok_or(Rejection::Reply(Reply::ErrNoUser))?,
            _ => self.resolve_target(actor, &target).await?,
        };
        Self::require_above(&user, &target)?;

        let mut authored: Vec<_> = self.cache.all_mappings(target.id).into_iter().collect();
        authored.sort();
        for msid in &authored {
            self.dispatcher.delete(*msid, Some(user.id)).await;
        }
        info!(user_id = %target.id, by = %user.id, count = authored.len(), "Messages cleaned up");
        Ok(vec![Reply::CleanedUp {
            count: authored.len(),
        }])
    }
}
