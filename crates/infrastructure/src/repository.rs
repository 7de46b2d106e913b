use application::UserRepository;
use async_trait::async_trait;
use domain::{
    NewUser, OneTimeCode, PasswordHash, RepositoryError, User, UserEmail, UserId, UserRole,
    UserUpdate, Username,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return RepositoryError::Conflict;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: i64,
    email: String,
    username: String,
    password_hash: String,
    email_verified: bool,
    role: Option<String>,
    otp: Option<i32>,
    otp_sent_at: Option<OffsetDateTime>,
    avatar: Option<String>,
}

impl TryFrom<UserRecord> for User {
    type Error = RepositoryError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        let email = UserEmail::parse(value.email).map_err(|err| invalid_data(err.to_string()))?;
        let username =
            Username::parse(value.username).map_err(|err| invalid_data(err.to_string()))?;
        let password =
            PasswordHash::new(value.password_hash).map_err(|err| invalid_data(err.to_string()))?;
        let role = value
            .role
            .map(|role| role.parse::<UserRole>())
            .transpose()
            .map_err(|err| invalid_data(err.to_string()))?;
        let otp = value
            .otp
            .map(|otp| {
                u32::try_from(otp)
                    .map_err(|_| invalid_data("negative otp"))
                    .and_then(|otp| {
                        OneTimeCode::new(otp).map_err(|err| invalid_data(err.to_string()))
                    })
            })
            .transpose()?;

        Ok(User {
            id: UserId::new(value.id),
            email,
            username,
            password,
            email_verified: value.email_verified,
            role,
            otp,
            otp_sent_at: value.otp_sent_at,
            avatar: value.avatar,
        })
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: NewUser) -> Result<User, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            INSERT INTO users (email, username, password_hash, email_verified, otp, otp_sent_at)
            VALUES ($1, $2, $3, FALSE, $4, $5)
            RETURNING id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            "#,
        )
        .bind(user.email.as_str())
        .bind(user.username.as_str())
        .bind(user.password.as_str())
        .bind(user.otp.value() as i32)
        .bind(user.otp_sent_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        User::try_from(record)
    }

    async fn update(&self, id: UserId, update: UserUpdate) -> Result<User, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            UPDATE users
            SET username = COALESCE($2, username),
                email_verified = COALESCE($3, email_verified),
                role = COALESCE($4, role),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            "#,
        )
        .bind(id.value())
        .bind(update.username.as_ref().map(Username::as_str))
        .bind(update.email_verified)
        .bind(update.role.map(|role| role.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record
            .map(User::try_from)
            .transpose()?
            .ok_or(RepositoryError::NotFound)
    }

    async fn delete(&self, id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(User::try_from).transpose()
    }

    async fn search(&self, fragment: &str, exclude: UserId) -> Result<Vec<User>, RepositoryError> {
        // strpos 做字面子串匹配，不需要转义 LIKE 通配符
        let records = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            FROM users
            WHERE id <> $1
              AND (strpos(username, $2) > 0 OR strpos(email, $2) > 0)
            ORDER BY id
            "#,
        )
        .bind(exclude.value())
        .bind(fragment)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(User::try_from).collect()
    }

    async fn list_all(&self) -> Result<Vec<User>, RepositoryError> {
        let records = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, username, password_hash, email_verified, role, otp, otp_sent_at, avatar
            FROM users
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(User::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record() -> UserRecord {
        UserRecord {
            id: 3,
            email: "a@x.com".into(),
            username: "alice".into(),
            password_hash: "$2b$04$hash".into(),
            email_verified: true,
            role: Some("ADMIN".into()),
            otp: Some(123_456),
            otp_sent_at: Some(datetime!(2024-01-01 12:00 UTC)),
            avatar: None,
        }
    }

    #[test]
    fn record_converts_to_user() {
        let user = User::try_from(record()).unwrap();
        assert_eq!(user.id, UserId(3));
        assert_eq!(user.role, Some(UserRole::Admin));
        assert_eq!(user.otp.map(OneTimeCode::value), Some(123_456));
    }

    #[test]
    fn corrupt_rows_surface_as_storage_errors() {
        let mut bad_role = record();
        bad_role.role = Some("ROOT".into());
        assert!(matches!(
            User::try_from(bad_role),
            Err(RepositoryError::Storage { .. })
        ));

        let mut bad_otp = record();
        bad_otp.otp = Some(-1);
        assert!(matches!(
            User::try_from(bad_otp),
            Err(RepositoryError::Storage { .. })
        ));
    }
}
