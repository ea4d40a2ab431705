//! 用户存储契约与按用户加锁的 checkout/commit
//!
//! 持久化引擎在核心之外，这里只定义契约和一个内存参考实现。

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use domain::{Rank, SystemConfig, User, UserId};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} already exists")]
    AlreadyExists(UserId),
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// 访问控制名单
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessList {
    Whitelist,
    Blacklist,
}

/// 遍历用户时的排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserOrder {
    #[default]
    Unordered,
    /// 最近活跃者在前
    LastActive,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn add_user(&self, user: User) -> Result<(), StoreError>;
    async fn set_user(&self, user: User) -> Result<(), StoreError>;
    async fn iterate_users(&self, order: UserOrder) -> Result<Vec<User>, StoreError>;
    /// 已加入会话且等级不低于 admin 的用户
    async fn iterate_admins(&self) -> Result<Vec<User>, StoreError>;
    async fn has_users(&self) -> Result<bool, StoreError>;

    async fn system_config(&self) -> Result<SystemConfig, StoreError>;
    async fn set_system_config(&self, config: SystemConfig) -> Result<(), StoreError>;

    /// 返回是否发生了变更
    async fn add_to_list(&self, list: AccessList, id: UserId) -> Result<bool, StoreError>;
    async fn remove_from_list(&self, list: AccessList, id: UserId) -> Result<bool, StoreError>;
    async fn list_contains(&self, list: AccessList, id: UserId) -> Result<bool, StoreError>;
    async fn list_members(&self, list: AccessList) -> Result<Vec<UserId>, StoreError>;
}

/// 用户记录的唯一写入口：同一用户的读-改-写在其专属锁下串行执行
pub struct UserLedger {
    store: Arc<dyn UserStore>,
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLedger {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    fn lock_for(&self, id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id).or_default().clone()
    }

    pub async fn get(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.store.get_user(id).await
    }

    /// 取出用户记录并持有该用户的锁，直到 commit 或丢弃
    pub async fn checkout(&self, id: UserId) -> Result<Option<UserCheckout>, StoreError> {
        let guard = self.lock_for(id).lock_owned().await;
        let user = self.store.get_user(id).await?;
        Ok(user.map(|user| UserCheckout {
            user,
            store: self.store.clone(),
            _guard: guard,
        }))
    }

    /// checkout + 修改 + commit 的便捷形式
    pub async fn modify<F, R>(&self, id: UserId, f: F) -> Result<Option<(User, R)>, StoreError>
    where
        F: FnOnce(&mut User) -> R,
    {
        let Some(mut checkout) = self.checkout(id).await? else {
            return Ok(None);
        };
        let out = f(&mut checkout);
        let user = checkout.commit().await?;
        Ok(Some((user, out)))
    }

    /// 在用户锁下创建记录；已存在时返回 false
    pub async fn register(&self, user: User) -> Result<bool, StoreError> {
        let _guard = self.lock_for(user.id).lock_owned().await;
        if self.store.get_user(user.id).await?.is_some() {
            return Ok(false);
        }
        self.store.add_user(user).await?;
        Ok(true)
    }
}

/// 持有用户锁的可变记录
pub struct UserCheckout {
    user: User,
    store: Arc<dyn UserStore>,
    _guard: OwnedMutexGuard<()>,
}

impl UserCheckout {
    pub async fn commit(self) -> Result<User, StoreError> {
        if self.user.is_blacklisted() && self.user.is_joined() {
            debug_assert!(false, "blacklisted user {} is still joined", self.user.id);
            error!(user_id = %self.user.id, "Committing a blacklisted user that is still joined");
        }
        self.store.set_user(self.user.clone()).await?;
        Ok(self.user)
    }
}

impl Deref for UserCheckout {
    type Target = User;

    fn deref(&self) -> &User {
        &self.user
    }
}

impl DerefMut for UserCheckout {
    fn deref_mut(&mut self) -> &mut User {
        &mut self.user
    }
}

/// 内存实现，便于测试与单机部署
pub mod memory {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct Inner {
        users: HashMap<UserId, User>,
        whitelist: HashSet<UserId>,
        blacklist: HashSet<UserId>,
        config: SystemConfig,
    }

    impl Inner {
        fn list(&self, list: AccessList) -> &HashSet<UserId> {
            match list {
                AccessList::Whitelist => &self.whitelist,
                AccessList::Blacklist => &self.blacklist,
            }
        }

        fn list_mut(&mut self, list: AccessList) -> &mut HashSet<UserId> {
            match list {
                AccessList::Whitelist => &mut self.whitelist,
                AccessList::Blacklist => &mut self.blacklist,
            }
        }
    }

    #[derive(Default)]
    pub struct MemoryUserStore {
        inner: RwLock<Inner>,
    }

    impl MemoryUserStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
            Ok(self.inner.read().await.users.get(&id).cloned())
        }

        async fn add_user(&self, user: User) -> Result<(), StoreError> {
            let mut inner = self.inner.write().await;
            if inner.users.contains_key(&user.id) {
                return Err(StoreError::AlreadyExists(user.id));
            }
            inner.users.insert(user.id, user);
            Ok(())
        }

        async fn set_user(&self, user: User) -> Result<(), StoreError> {
            let mut inner = self.inner.write().await;
            match inner.users.get_mut(&user.id) {
                Some(slot) => {
                    *slot = user;
                    Ok(())
                }
                None => Err(StoreError::NotFound(user.id)),
            }
        }

        async fn iterate_users(&self, order: UserOrder) -> Result<Vec<User>, StoreError> {
            let mut users: Vec<User> = self.inner.read().await.users.values().cloned().collect();
            match order {
                UserOrder::Unordered => users.sort_by_key(|u| u.id),
                UserOrder::LastActive => users.sort_by(|a, b| b.last_active.cmp(&a.last_active)),
            }
            Ok(users)
        }

        async fn iterate_admins(&self) -> Result<Vec<User>, StoreError> {
            let inner = self.inner.read().await;
            let mut admins: Vec<User> = inner
                .users
                .values()
                .filter(|u| u.is_joined() && u.rank >= Rank::Admin)
                .cloned()
                .collect();
            admins.sort_by_key(|u| u.id);
            Ok(admins)
        }

        async fn has_users(&self) -> Result<bool, StoreError> {
            Ok(!self.inner.read().await.users.is_empty())
        }

        async fn system_config(&self) -> Result<SystemConfig, StoreError> {
            Ok(self.inner.read().await.config.clone())
        }

        async fn set_system_config(&self, config: SystemConfig) -> Result<(), StoreError> {
            self.inner.write().await.config = config;
            Ok(())
        }

        async fn add_to_list(&self, list: AccessList, id: UserId) -> Result<bool, StoreError> {
            Ok(self.inner.write().await.list_mut(list).insert(id))
        }

        async fn remove_from_list(&self, list: AccessList, id: UserId) -> Result<bool, StoreError> {
            Ok(self.inner.write().await.list_mut(list).remove(&id))
        }

        async fn list_contains(&self, list: AccessList, id: UserId) -> Result<bool, StoreError> {
            Ok(self.inner.read().await.list(list).contains(&id))
        }

        async fn list_members(&self, list: AccessList) -> Result<Vec<UserId>, StoreError> {
            let mut ids: Vec<UserId> = self.inner.read().await.list(list).iter().copied().collect();
            ids.sort();
            Ok(ids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryUserStore;
    use super::*;
    use time::macros::datetime;

    fn user(id: i64) -> User {
        User::register(UserId(id), "anon", "0001".into(), datetime!(2024-01-01 00:00 UTC))
    }

    #[tokio::test]
    async fn test_checkout_commit_round_trip() {
        let ledger = UserLedger::new(Arc::new(MemoryUserStore::new()));
        assert!(ledger.register(user(1)).await.unwrap());
        assert!(!ledger.register(user(1)).await.unwrap());

        let mut checkout = ledger.checkout(UserId(1)).await.unwrap().unwrap();
        checkout.karma = 5;
        checkout.commit().await.unwrap();

        assert_eq!(ledger.get(UserId(1)).await.unwrap().unwrap().karma, 5);
        assert!(ledger.checkout(UserId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_modify_is_serialized() {
        let ledger = Arc::new(UserLedger::new(Arc::new(MemoryUserStore::new())));
        ledger.register(user(1)).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .modify(UserId(1), |u| u.karma += 1)
                        .await
                        .unwrap()
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ledger.get(UserId(1)).await.unwrap().unwrap().karma, 50);
    }

    #[tokio::test]
    async fn test_access_lists_and_admins() {
        let store = MemoryUserStore::new();
        let mut admin = user(1);
        admin.rank = Rank::Admin;
        let mut left_admin = user(2);
        left_admin.rank = Rank::Owner;
        left_admin.set_left(datetime!(2024-01-02 00:00 UTC));
        store.add_user(admin).await.unwrap();
        store.add_user(left_admin).await.unwrap();
        store.add_user(user(3)).await.unwrap();

        let admins = store.iterate_admins().await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, UserId(1));

        assert!(store.add_to_list(AccessList::Whitelist, UserId(3)).await.unwrap());
        assert!(!store.add_to_list(AccessList::Whitelist, UserId(3)).await.unwrap());
        assert!(store.list_contains(AccessList::Whitelist, UserId(3)).await.unwrap());
        assert!(!store.list_contains(AccessList::Blacklist, UserId(3)).await.unwrap());
        assert!(store.remove_from_list(AccessList::Whitelist, UserId(3)).await.unwrap());
        assert!(store.list_members(AccessList::Whitelist).await.unwrap().is_empty());
    }
}
