use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{is_unique_violation, now, parse_timestamp, timestamp, Database};
use crate::error::{AppError, AppResult, FieldErrors};
use crate::models::user::{
    Credentials, Principal, ProfilePatch, TokenPair, User, ValidRegistration,
};

/// Credential verification and token issuance, as seen by the review core.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn register(&self, registration: ValidRegistration) -> AppResult<(User, TokenPair)>;

    /// Verifies credentials and opens a new session.
    async fn authenticate(&self, credentials: &Credentials) -> AppResult<(User, TokenPair)>;

    /// Trades a live refresh token for a new pair; the old pair stops working.
    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair>;

    async fn revoke(&self, access_token: &str) -> AppResult<()>;

    /// `None` for unknown or expired tokens.
    async fn principal_for_token(&self, access_token: &str) -> AppResult<Option<Principal>>;

    async fn user(&self, user_id: &str) -> AppResult<User>;

    async fn update_profile(&self, user_id: &str, patch: ProfilePatch) -> AppResult<User>;

    /// Replaces the picture ref and hands back the previous one.
    async fn set_profile_picture(
        &self,
        user_id: &str,
        file_ref: Option<String>,
    ) -> AppResult<Option<String>>;
}

const USER_COLUMNS: &str = "id, username, email, first_name, last_name, birthday,
    profile_picture, is_admin, created_at";

/// Identity backed by the `users` and `sessions` tables of the shared database.
#[derive(Debug, Clone)]
pub struct SqliteIdentityStore {
    db: Database,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl SqliteIdentityStore {
    pub fn new(db: Database, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            db,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Administrators are appointed out of band; there is no HTTP path for this.
    pub async fn set_admin(&self, user_id: &str, is_admin: bool) -> AppResult<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE users SET is_admin = ?2 WHERE id = ?1",
            params![user_id, is_admin],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound);
        }
        info!("[AUTH] User {} admin={}", user_id, is_admin);
        Ok(())
    }

    fn open_session(&self, conn: &Connection, user_id: &str) -> AppResult<TokenPair> {
        let issued = now();
        let expiry = |ttl: Duration| {
            issued
                .checked_add_signed(ttl)
                .ok_or_else(|| {
                    AppError::Internal(format!("session lifetime {ttl} is out of range"))
                })
        };
        let refresh_expires_at = expiry(self.refresh_ttl)?;
        let pair = TokenPair {
            access: new_token(),
            refresh: new_token(),
            access_expires_at: expiry(self.access_ttl)?,
        };
        conn.execute(
            "INSERT INTO sessions
                (access_token, refresh_token, user_id, access_expires_at, refresh_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &pair.access,
                &pair.refresh,
                user_id,
                timestamp(pair.access_expires_at),
                timestamp(refresh_expires_at),
            ],
        )?;
        Ok(pair)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn register(&self, registration: ValidRegistration) -> AppResult<(User, TokenPair)> {
        let password = registration.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))??;

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: registration.username,
            email: registration.email,
            first_name: registration.first_name,
            last_name: registration.last_name,
            birthday: registration.birthday,
            profile_picture: None,
            is_admin: false,
            created_at: now(),
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users
                (id, username, email, first_name, last_name, birthday, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &user.id,
                &user.username,
                &user.email,
                &user.first_name,
                &user.last_name,
                user.birthday.map(|d| d.to_string()),
                password_hash,
                timestamp(user.created_at),
            ],
        )
        .map_err(account_conflict)?;
        let tokens = self.open_session(&tx, &user.id)?;
        tx.commit()?;

        info!("[AUTH] User {} registered successfully", user.username);
        Ok((user, tokens))
    }

    async fn authenticate(&self, credentials: &Credentials) -> AppResult<(User, TokenPair)> {
        let found = {
            let conn = self.db.lock().await;
            conn.query_row(
                &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE username = ?1"),
                [credentials.username.trim()],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(9)?)),
            )
            .optional()?
        };
        let Some((user, stored_hash)) = found else {
            debug!("[AUTH] Login for unknown user {}", credentials.username);
            return Err(AppError::Unauthorized);
        };

        let password = credentials.password.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        if !verified {
            warn!("[AUTH] Bad password for {}", user.username);
            return Err(AppError::Unauthorized);
        }

        let conn = self.db.lock().await;
        let tokens = self.open_session(&conn, &user.id)?;
        info!("[AUTH] User {} logged in", user.username);
        Ok((user, tokens))
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let user_id: Option<String> = tx
            .query_row(
                "SELECT user_id FROM sessions WHERE refresh_token = ?1 AND refresh_expires_at > ?2",
                [refresh_token, timestamp(now()).as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(user_id) = user_id else {
            return Err(AppError::Unauthorized);
        };

        tx.execute("DELETE FROM sessions WHERE refresh_token = ?1", [refresh_token])?;
        let tokens = self.open_session(&tx, &user_id)?;
        tx.commit()?;
        debug!("[AUTH] Rotated session for {}", user_id);
        Ok(tokens)
    }

    async fn revoke(&self, access_token: &str) -> AppResult<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM sessions WHERE access_token = ?1", [access_token])?;
        Ok(())
    }

    async fn principal_for_token(&self, access_token: &str) -> AppResult<Option<Principal>> {
        let conn = self.db.lock().await;
        let principal = conn
            .query_row(
                "SELECT u.id, u.username, u.is_admin
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.access_token = ?1 AND s.access_expires_at > ?2",
                [access_token, timestamp(now()).as_str()],
                |row| {
                    Ok(Principal {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_admin: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(principal)
    }

    async fn user(&self, user_id: &str) -> AppResult<User> {
        let conn = self.db.lock().await;
        load_user(&conn, user_id)?.ok_or(AppError::NotFound)
    }

    async fn update_profile(&self, user_id: &str, patch: ProfilePatch) -> AppResult<User> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let (set_birthday, birthday) = match patch.birthday {
            Some(value) => (true, value.map(|d| d.to_string())),
            None => (false, None),
        };
        let changed = tx
            .execute(
                "UPDATE users SET
                    first_name = COALESCE(?2, first_name),
                    last_name = COALESCE(?3, last_name),
                    email = COALESCE(?4, email),
                    birthday = CASE WHEN ?5 THEN ?6 ELSE birthday END
                 WHERE id = ?1",
                params![
                    user_id,
                    patch.first_name,
                    patch.last_name,
                    patch.email,
                    set_birthday,
                    birthday,
                ],
            )
            .map_err(account_conflict)?;
        if changed == 0 {
            return Err(AppError::NotFound);
        }
        let user = load_user(&tx, user_id)?.ok_or(AppError::NotFound)?;
        tx.commit()?;
        info!("[AUTH] Profile updated successfully for {}", user.username);
        Ok(user)
    }

    async fn set_profile_picture(
        &self,
        user_id: &str,
        file_ref: Option<String>,
    ) -> AppResult<Option<String>> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let previous: Option<Option<String>> = tx
            .query_row(
                "SELECT profile_picture FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(previous) = previous else {
            return Err(AppError::NotFound);
        };
        tx.execute(
            "UPDATE users SET profile_picture = ?2 WHERE id = ?1",
            params![user_id, file_ref],
        )?;
        tx.commit()?;
        Ok(previous)
    }
}

fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("[AUTH] Unreadable password hash: {}", e);
            false
        }
    }
}

/// Maps a UNIQUE failure on `users` to the field that clashed.
fn account_conflict(err: rusqlite::Error) -> AppError {
    if !is_unique_violation(&err) {
        return err.into();
    }
    let field = if err.to_string().contains("users.email") {
        ("email", "This email is already registered.")
    } else {
        ("username", "This username is already taken.")
    };
    AppError::Duplicate(FieldErrors::single(field.0, field.1))
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Option<User>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [user_id],
        user_from_row,
    )
    .optional()
}

fn user_from_row(row: &Row<'_>) -> Result<User, rusqlite::Error> {
    let birthday: Option<String> = row.get(5)?;
    let birthday = birthday
        .map(|raw| NaiveDate::parse_from_str(&raw, "%Y-%m-%d"))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        birthday,
        profile_picture: row.get(6)?,
        is_admin: row.get(7)?,
        created_at: parse_timestamp(row, 8)?,
    })
}
