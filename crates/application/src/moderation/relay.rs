//! 用户消息的转发、编辑、点赞与私下公开身份

use domain::{ContentKind, MessageId, Rank, RelayedMessage, Reply, Signature, User};
use tracing::{debug, info, warn};

use super::{Actor, EditRequest, MessageRef, ModerationEngine, Outcome, RelayRequest, Rejection, Signing};
use crate::cache::Delivered;
use crate::dispatcher::Audience;

impl ModerationEngine {
    /// 转发前的检查，顺序固定，命中即返回
    fn check_relay(&self, user: &User, request: &RelayRequest) -> Result<(), Rejection> {
        let now = self.now();
        let features = &self.settings.features;

        if let Some(until) = user.cooldown_until.filter(|_| user.is_in_cooldown(now)) {
            return Err(Reply::ErrCooldown { until }.into());
        }
        if request.signing == Signing::Expose && !features.enable_expose {
            return Err(Reply::ErrCommandDisabled.into());
        }
        if request.signing == Signing::Tripcode && user.tripcode.is_none() {
            return Err(Reply::ErrNoTripcode.into());
        }
        if features.require_tripcode && user.tripcode.is_none() {
            return Err(Reply::ErrNeedTripcode.into());
        }
        if request.content.is_media() && user.rank < Rank::Mod {
            if let Some(period) = features.media_limit_period() {
                if now - user.joined < period {
                    return Err(Reply::ErrMediaLimit.into());
                }
            }
        }

        let cost = request.content.spam_cost(&self.settings.costs);
        if !self.spam_gate.admit(user.id, cost) {
            debug!(user_id = %user.id, cost, "Message rejected by spam gate");
            return Err(Reply::ErrSpammy.into());
        }
        Ok(())
    }

    fn signature_for(user: &User, signing: Signing) -> Option<Signature> {
        match signing {
            Signing::Expose => Some(Signature::Exposed {
                name: user.formatted_name(),
            }),
            Signing::Tripcode => user.tripcode_identity().map(Signature::Tripcode),
            Signing::Anonymous if user.tripcode_toggle && user.tripcode.is_some() => {
                user.tripcode_identity().map(Signature::Tripcode)
            }
            Signing::Anonymous => None,
        }
    }

    /// 被禁言的作者只对管理团队可见；静音期间非 admin 的消息只对 admin 可见
    fn relay_audience(&self, user: &User) -> Audience {
        let min_rank = if user.muzzled {
            Some(Rank::Mod)
        } else if self.is_muted() && user.rank < Rank::Admin {
            Some(Rank::Admin)
        } else {
            None
        };
        Audience::Broadcast {
            except: Some(user.id),
            min_rank,
        }
    }

    pub(super) async fn relay_message(&self, actor: &Actor, request: RelayRequest) -> Outcome {
        let user = self.require_user(actor).await?;
        self.check_relay(&user, &request)?;

        let msid = self.cache.assign(Some(user.id));
        if let Some(source_id) = request.source_id {
            self.cache
                .save_mapping(user.id, msid, Delivered::Sent(source_id));
        }

        let reply_to = match request.reply_to {
            Some(transport_id) => {
                let found = self.cache.lookup_msid(user.id, transport_id);
                if found.is_none() {
                    warn!(user_id = %user.id, transport_id = %transport_id, "Replied-to message not found in cache");
                }
                found
            }
            None => None,
        };

        let message = RelayedMessage {
            signature: Self::signature_for(&user, request.signing),
            content: request.content,
            edited: false,
        };
        let audience = self.relay_audience(&user);
        debug!(user_id = %user.id, msid = %msid, ?reply_to, "Relaying message");
        self.dispatcher.relay(msid, message, audience, reply_to).await;
        Ok(Vec::new())
    }

    pub(super) async fn edit_message(&self, actor: &Actor, request: EditRequest) -> Outcome {
        let user = self.require_user(actor).await?;
        if !self.settings.features.allow_edits || request.content.kind != ContentKind::Text {
            return Err(Reply::ErrNoEditing.into());
        }
        let msid = self
            .cache
            .lookup_msid(user.id, request.source_id)
            .filter(|msid| {
                self.cache
                    .get(*msid)
                    .is_some_and(|cm| cm.is_authored_by(user.id))
            })
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))?;

        let cost = request.content.spam_cost(&self.settings.costs);
        if !self.spam_gate.admit(user.id, cost) {
            return Err(Reply::ErrSpammy.into());
        }

        let message = RelayedMessage {
            signature: Self::signature_for(&user, request.signing),
            content: request.content,
            edited: true,
        };
        debug!(user_id = %user.id, msid = %msid, "Editing relayed message");
        self.dispatcher.edit(msid, message).await;
        Ok(Vec::new())
    }

    pub(super) async fn give_karma(&self, actor: &Actor, message: MessageRef) -> Outcome {
        let user = self.require_user(actor).await?;
        let msid: MessageId = self.resolve_message(actor, message)?;

        // 重复点赞、给自己点赞与锁定消息的检查和记录在同一临界区内完成
        let author = self
            .cache
            .update(msid, |cm| {
                let author = cm.user_id.ok_or(Reply::ErrNotInCache)?;
                if cm.has_upvoted(user.id) {
                    return Err(Reply::ErrAlreadyUpvoted);
                }
                if author == user.id {
                    return Err(Reply::ErrUpvoteOwnMessage);
                }
                if cm.locked {
                    return Err(Reply::ErrMessageLocked);
                }
                cm.add_upvote(user.id);
                Ok(author)
            })
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))??;

        let plus_one = self.settings.karma.plus_one;
        let (author, ()) = self.modify_target(author, |a| a.karma += plus_one).await?;
        if !author.hide_karma {
            self.notify(Reply::KarmaNotification, Audience::User(author.id), Some(msid))
                .await;
        }
        info!(user_id = %author.id, by = %user.id, msid = %msid, "Karma given");
        Ok(vec![Reply::KarmaThankYou])
    }

    /// 向消息作者私下公开自己的真实名称
    pub(super) async fn expose_to(&self, actor: &Actor, message: MessageRef, confirmed: bool) -> Outcome {
        let user = self.require_user(actor).await?;
        if !self.settings.features.enable_expose {
            return Err(Reply::ErrCommandDisabled.into());
        }
        if !confirmed {
            return Err(Reply::ErrExposeConfirm.into());
        }
        let msid = self.resolve_message(actor, message)?;
        let cached = self
            .cache
            .get(msid)
            .ok_or(Rejection::Reply(Reply::ErrNotInCache))?;
        let author = cached.user_id.ok_or(Rejection::Reply(Reply::ErrNotInCache))?;
        if cached.locked {
            return Err(Reply::ErrMessageLocked.into());
        }
        if author == user.id {
            return Err(Reply::ErrNothingToDo.into());
        }
        let author = self
            .ledger
            .get(author)
            .await?
            .ok_or(Rejection::Reply(Reply::ErrNoUser))?;

        // 被禁言的用户看到成功回复，但作者收不到任何通知
        if user.muzzled {
            debug!(user_id = %user.id, msid = %msid, "Exposure by muzzled user dropped");
            return Ok(vec![Reply::Exposed]);
        }
        let reveal = Reply::ExposeTo {
            name: user.anonymized_name(self.now().date()),
            handle: user.formatted_name(),
        };
        self.notify(reveal, Audience::User(author.id), Some(msid)).await;
        info!(user_id = %user.id, to = %author.id, msid = %msid, "User exposed identity");
        Ok(vec![Reply::Exposed])
    }
}
