//! 影子审计接收器：与投递接收器并行注册，只记录不投递

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use application::{ApplicationError, Audience, Receiver};
use async_trait::async_trait;
use domain::{MessageId, Outbound, UserId};
use tracing::info;

/// 审计计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSnapshot {
    pub relayed: u64,
    pub system: u64,
    pub deleted: u64,
    pub edited: u64,
    pub stopped: u64,
}

#[derive(Debug, Default)]
pub struct AuditReceiver {
    relayed: AtomicU64,
    system: AtomicU64,
    deleted: AtomicU64,
    edited: AtomicU64,
    stopped: AtomicU64,
}

impl AuditReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            relayed: self.relayed.load(Ordering::Relaxed),
            system: self.system.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            edited: self.edited.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
        }
    }
}

fn describe(audience: &Audience) -> String {
    match audience {
        Audience::User(id) => format!("user:{id}"),
        Audience::Broadcast { min_rank: Some(rank), .. } => format!("broadcast:{rank}+"),
        Audience::Broadcast { .. } => "broadcast".to_string(),
    }
}

#[async_trait]
impl Receiver for AuditReceiver {
    async fn reply(
        &self,
        message: Arc<Outbound>,
        msid: Option<MessageId>,
        audience: &Audience,
        _reply_to: Option<MessageId>,
    ) -> Result<(), ApplicationError> {
        let kind = match message.as_ref() {
            Outbound::System(_) => {
                self.system.fetch_add(1, Ordering::Relaxed);
                "system"
            }
            Outbound::Relayed(_) => {
                self.relayed.fetch_add(1, Ordering::Relaxed);
                "relayed"
            }
        };
        info!(
            target: "audit",
            kind,
            msid = ?msid,
            audience = %describe(audience),
            "Message dispatched"
        );
        Ok(())
    }

    async fn delete(&self, msid: MessageId, acting: Option<UserId>) -> Result<(), ApplicationError> {
        self.deleted.fetch_add(1, Ordering::Relaxed);
        info!(target: "audit", msid = %msid, by = ?acting, "Message deleted");
        Ok(())
    }

    async fn stop_invoked(
        &self,
        user: UserId,
        cascade: Option<&HashSet<MessageId>>,
    ) -> Result<(), ApplicationError> {
        self.stopped.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "audit",
            user_id = %user,
            authored = cascade.map_or(0, HashSet::len),
            "Deliveries stopped"
        );
        Ok(())
    }

    async fn edit(&self, msid: MessageId, _message: Arc<Outbound>) -> Result<(), ApplicationError> {
        self.edited.fetch_add(1, Ordering::Relaxed);
        info!(target: "audit", msid = %msid, "Message edited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::store::memory::MemoryUserStore;
    use application::{
        Actor, Clock, Command, ManualClock, MessageRef, RelayContext, RelayContextDependencies,
        RelayRequest, Transport, TransportError,
    };
    use config::RelayConfig;
    use domain::TransportMessageId;
    use time::macros::datetime;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(
            &self,
            _recipient: UserId,
            _message: &Outbound,
            _reply_to: Option<TransportMessageId>,
        ) -> Result<TransportMessageId, TransportError> {
            Ok(TransportMessageId(1))
        }

        async fn delete(&self, _recipient: UserId, _id: TransportMessageId) -> Result<(), TransportError> {
            Ok(())
        }

        async fn edit(
            &self,
            _recipient: UserId,
            _id: TransportMessageId,
            _message: &Outbound,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shadow_receiver_sees_every_dispatch() {
        let audit = Arc::new(AuditReceiver::new());
        let mut deps = RelayContextDependencies::new(
            RelayConfig::default(),
            Arc::new(MemoryUserStore::new()),
            Arc::new(NullTransport),
        );
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        deps.clock = clock;
        deps.shadow_receivers.push(audit.clone());
        let context = RelayContext::build(deps);
        let engine = &context.engine;

        let alice = Actor::new(1, Some("alice".into()), "Alice");
        let bob = Actor::new(2, Some("bob".into()), "Bob");
        engine.execute(&alice, Command::Join).await;
        engine.execute(&bob, Command::Join).await;
        engine
            .execute(&bob, Command::Relay(RelayRequest::text("hi")))
            .await;
        let msid = context.cache.all_mappings(bob.id).into_iter().next().unwrap();
        engine
            .execute(&alice, Command::Remove(MessageRef::Id(msid)))
            .await;

        let snapshot = audit.snapshot();
        assert_eq!(snapshot.relayed, 1);
        assert_eq!(snapshot.deleted, 1);
        // 新用户通知与删除通知
        assert_eq!(snapshot.system, 2);
    }
}
