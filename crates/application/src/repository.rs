use async_trait::async_trait;
use domain::{NewUser, RepositoryError, User, UserEmail, UserId, UserUpdate};

/// 持久化用户存储
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 邮箱已存在时返回 `RepositoryError::Conflict`
    async fn create(&self, user: NewUser) -> Result<User, RepositoryError>;
    /// 部分更新，用户不存在时返回 `RepositoryError::NotFound`
    async fn update(&self, id: UserId, update: UserUpdate) -> Result<User, RepositoryError>;
    async fn delete(&self, id: UserId) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError>;
    /// 用户名或邮箱包含 `fragment` 的用户，排除 `exclude`，按 id 升序
    async fn search(&self, fragment: &str, exclude: UserId) -> Result<Vec<User>, RepositoryError>;
    /// 全部用户，按 id 升序
    async fn list_all(&self) -> Result<Vec<User>, RepositoryError>;
}

/// 内存实现的用户存储（用于测试与本地联调）
pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct State {
        next_id: i64,
        users: BTreeMap<UserId, User>,
    }

    #[derive(Default)]
    pub struct MemoryUserRepository {
        state: RwLock<State>,
    }

    impl MemoryUserRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl UserRepository for MemoryUserRepository {
        async fn create(&self, user: NewUser) -> Result<User, RepositoryError> {
            let mut state = self.state.write().await;
            if state.users.values().any(|existing| existing.email == user.email) {
                return Err(RepositoryError::Conflict);
            }

            state.next_id += 1;
            let id = UserId(state.next_id);
            let created = User {
                id,
                email: user.email,
                username: user.username,
                password: user.password,
                email_verified: false,
                role: None,
                otp: Some(user.otp),
                otp_sent_at: Some(user.otp_sent_at),
                avatar: None,
            };
            state.users.insert(id, created.clone());
            Ok(created)
        }

        async fn update(&self, id: UserId, update: UserUpdate) -> Result<User, RepositoryError> {
            let mut state = self.state.write().await;
            let user = state.users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            update.apply(user);
            Ok(user.clone())
        }

        async fn delete(&self, id: UserId) -> Result<(), RepositoryError> {
            let mut state = self.state.write().await;
            state
                .users
                .remove(&id)
                .map(|_| ())
                .ok_or(RepositoryError::NotFound)
        }

        async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
            Ok(self.state.read().await.users.get(&id).cloned())
        }

        async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state.users.values().find(|user| &user.email == email).cloned())
        }

        async fn search(
            &self,
            fragment: &str,
            exclude: UserId,
        ) -> Result<Vec<User>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state
                .users
                .values()
                .filter(|user| user.id != exclude)
                .filter(|user| {
                    user.username.as_str().contains(fragment) || user.email.as_str().contains(fragment)
                })
                .cloned()
                .collect())
        }

        async fn list_all(&self) -> Result<Vec<User>, RepositoryError> {
            Ok(self.state.read().await.users.values().cloned().collect())
        }
    }

}
