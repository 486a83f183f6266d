//! In-memory user accounts with Argon2 password hashes and opaque bearer tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::http::{HeaderMap, header};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use clipmark::api::LoginResponse;

const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Username and password are required")]
    MissingFields,

    #[error("Password must be at least 4 characters long")]
    WeakPassword,

    #[error("Username already exists")]
    UsernameTaken,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
}

struct User {
    id: u64,
    password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

#[derive(Default)]
pub struct Accounts {
    users: RwLock<HashMap<String, User>>,
    tokens: RwLock<HashMap<String, Principal>>,
    next_id: AtomicU64,
}

impl Accounts {
    pub async fn register(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let password_hash = hash_password(password).map_err(AuthError::Hash)?;

        let id = {
            let mut users = self.users.write().await;
            if users.contains_key(username) {
                return Err(AuthError::UsernameTaken);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            users.insert(username.to_owned(), User { id, password_hash });
            id
        };

        let token = self.issue_token(id, username).await;
        Ok(LoginResponse {
            message: "User registered successfully".to_owned(),
            user_id: id.to_string(),
            token,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let (id, hash) = {
            let users = self.users.read().await;
            let user = users.get(username).ok_or(AuthError::InvalidCredentials)?;
            (user.id, user.password_hash.clone())
        };
        if !verify_password(password, &hash).map_err(AuthError::Hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.issue_token(id, username).await;
        Ok(LoginResponse {
            message: "Login successful".to_owned(),
            user_id: id.to_string(),
            token,
        })
    }

    /// Resolve the bearer token in `headers`, if it is one we issued.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = bearer_token(headers)?;
        self.tokens.read().await.get(token).cloned()
    }

    // One live token per user: signing in again retires the previous one.
    async fn issue_token(&self, id: u64, username: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let user_id = id.to_string();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, principal| principal.user_id != user_id);
        tokens.insert(
            token.clone(),
            Principal {
                user_id,
                username: username.to_owned(),
            },
        );
        token
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
        );
        headers
    }

    #[tokio::test]
    async fn register_then_login_issues_working_tokens() -> anyhow::Result<()> {
        let accounts = Accounts::default();
        let registered = accounts.register("ana", "secret").await?;
        assert_eq!(registered.user_id, "1");

        let logged_in = accounts.login("ana", "secret").await?;
        assert_eq!(logged_in.user_id, "1");
        assert_ne!(logged_in.token, registered.token);

        let who = accounts
            .authenticate(&bearer(&logged_in.token))
            .await
            .expect("token is known");
        assert_eq!(who.username, "ana");
        assert!(accounts.authenticate(&bearer(&registered.token)).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn repeated_logins_keep_one_token_per_user() -> anyhow::Result<()> {
        let accounts = Accounts::default();
        accounts.register("ana", "secret").await?;
        let bob = accounts.register("bob", "hunter2").await?;

        let mut last = String::new();
        for _ in 0..5 {
            last = accounts.login("ana", "secret").await?.token;
        }

        assert_eq!(accounts.tokens.read().await.len(), 2);
        assert!(accounts.authenticate(&bearer(&last)).await.is_some());
        assert!(accounts.authenticate(&bearer(&bob.token)).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() -> anyhow::Result<()> {
        let accounts = Accounts::default();
        accounts.register("ana", "secret").await?;

        assert!(matches!(
            accounts.login("ana", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            accounts.login("bob", "secret").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            accounts.register("ana", "other").await,
            Err(AuthError::UsernameTaken)
        ));
        assert!(matches!(
            accounts.register("cy", "abc").await,
            Err(AuthError::WeakPassword)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_or_malformed_tokens_do_not_authenticate() {
        let accounts = Accounts::default();
        assert!(accounts.authenticate(&bearer("made-up")).await.is_none());
        assert!(accounts.authenticate(&HeaderMap::new()).await.is_none());

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(accounts.authenticate(&basic).await.is_none());
    }
}
