//! Who is annotating, and the bearer token that proves it.
//!
//! The identity is persisted under three keys that are always written and cleared
//! together. A partially-populated store is treated as signed out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::api::{AnnotationApi, ApiError, Credentials, LoginResponse};
use crate::error::{Error, NetworkStage, Result};

pub const TOKEN_KEY: &str = "auth_token";
pub const USER_ID_KEY: &str = "user_id";
pub const USERNAME_KEY: &str = "username";

/// Key-value persistence for the signed-in identity.
pub trait CredentialStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Credentials that live only as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Credentials kept in a small JSON object on disk.
///
/// Every mutation rewrites the whole file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_owned(), value.to_owned());
        self.persist()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub token: String,
}

/// The signed-in identity plus the store it persists to.
pub struct IdentityContext {
    store: Box<dyn CredentialStore + Send>,
    identity: Option<Identity>,
}

impl IdentityContext {
    /// Restore the identity from `store`. All three keys must be present.
    pub fn load(store: impl CredentialStore + Send + 'static) -> Self {
        let identity = match (
            store.get(TOKEN_KEY),
            store.get(USER_ID_KEY),
            store.get(USERNAME_KEY),
        ) {
            (Some(token), Some(user_id), Some(username)) => Some(Identity {
                user_id,
                username,
                token,
            }),
            _ => None,
        };
        debug!(restored = identity.is_some(), "identity loaded");

        Self {
            store: Box::new(store),
            identity,
        }
    }

    /// A context with no persistence and nobody signed in.
    pub fn anonymous() -> Self {
        Self::load(MemoryStore::new())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.token.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Adopt and persist an identity.
    pub fn sign_in(&mut self, identity: Identity) -> Result<()> {
        self.store.set(TOKEN_KEY, &identity.token)?;
        self.store.set(USER_ID_KEY, &identity.user_id)?;
        self.store.set(USERNAME_KEY, &identity.username)?;
        info!(user_id = %identity.user_id, username = %identity.username, "signed in");
        self.identity = Some(identity);
        Ok(())
    }

    /// Forget the identity and clear all persisted keys.
    ///
    /// Store failures are logged; the in-memory identity is dropped regardless.
    pub fn invalidate(&mut self) {
        if let Some(identity) = self.identity.take() {
            warn!(user_id = %identity.user_id, "identity invalidated");
        }
        for key in [TOKEN_KEY, USER_ID_KEY, USERNAME_KEY] {
            if let Err(err) = self.store.remove(key) {
                warn!(key, error = %err, "failed to clear persisted credential");
            }
        }
    }

    pub fn login<A: AnnotationApi>(
        &mut self,
        api: &A,
        username: &str,
        password: &str,
    ) -> Result<Identity> {
        let credentials = Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let resp = api
            .login(&credentials)
            .map_err(|err| credential_error(err, "An error occurred during login"))?;
        self.adopt(resp, username)
    }

    pub fn register<A: AnnotationApi>(
        &mut self,
        api: &A,
        username: &str,
        password: &str,
    ) -> Result<Identity> {
        let credentials = Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let resp = api
            .register(&credentials)
            .map_err(|err| credential_error(err, "An error occurred during registration"))?;
        self.adopt(resp, username)
    }

    /// Check the current token with the server, invalidating it if rejected.
    ///
    /// Returns `Ok(false)` when nobody is signed in or the token was rejected.
    pub fn verify<A: AnnotationApi>(&mut self, api: &A) -> Result<bool> {
        let Some(token) = self.token() else {
            return Ok(false);
        };
        match api.verify_token(token) {
            Ok(true) => Ok(true),
            Ok(false) | Err(ApiError::Unauthorized) => {
                self.invalidate();
                Ok(false)
            }
            Err(err) => Err(Error::network(NetworkStage::VerifyToken, err)),
        }
    }

    fn adopt(&mut self, resp: LoginResponse, username: &str) -> Result<Identity> {
        let identity = Identity {
            user_id: resp.user_id,
            username: username.to_owned(),
            token: resp.token,
        };
        self.sign_in(identity.clone())?;
        Ok(identity)
    }
}

// Wrong credentials come back as a status error carrying the server's reason.
fn credential_error(err: ApiError, fallback: &str) -> Error {
    match err {
        ApiError::Unauthorized => Error::Auth(fallback.to_owned()),
        ApiError::Status { ref message, .. } if !message.is_empty() => {
            Error::Auth(message.clone())
        }
        ApiError::Status { .. } => Error::Auth(fallback.to_owned()),
        other => Error::network(NetworkStage::Login, other),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::api::ClipFetch;
    use crate::clip::ClipRequest;
    use crate::submission::AnnotationSubmission;

    struct FakeAuth {
        login: std::result::Result<LoginResponse, ApiError>,
        verify: std::result::Result<bool, ApiError>,
        verified: RefCell<Vec<String>>,
    }

    impl FakeAuth {
        fn accepting() -> Self {
            Self {
                login: Ok(LoginResponse {
                    message: "Login successful".into(),
                    user_id: "7".into(),
                    token: "tok-7".into(),
                }),
                verify: Ok(true),
                verified: RefCell::new(Vec::new()),
            }
        }
    }

    impl AnnotationApi for FakeAuth {
        fn fetch_clip(
            &self,
            _request: &ClipRequest,
            _token: Option<&str>,
        ) -> std::result::Result<ClipFetch, ApiError> {
            Ok(ClipFetch::Exhausted)
        }

        fn submit_annotation(
            &self,
            _token: &str,
            _submission: &AnnotationSubmission,
        ) -> std::result::Result<(), ApiError> {
            Ok(())
        }

        fn verify_token(&self, token: &str) -> std::result::Result<bool, ApiError> {
            self.verified.borrow_mut().push(token.to_owned());
            self.verify.clone()
        }

        fn login(&self, _credentials: &Credentials) -> std::result::Result<LoginResponse, ApiError> {
            self.login.clone()
        }

        fn register(
            &self,
            credentials: &Credentials,
        ) -> std::result::Result<LoginResponse, ApiError> {
            self.login(credentials)
        }
    }

    fn signed_in_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.set(TOKEN_KEY, "tok").unwrap();
        store.set(USER_ID_KEY, "42").unwrap();
        store.set(USERNAME_KEY, "ana").unwrap();
        store
    }

    #[test]
    fn load_requires_all_three_keys() {
        let ctx = IdentityContext::load(signed_in_store());
        assert_eq!(ctx.token(), Some("tok"));
        assert_eq!(ctx.identity().map(|i| i.user_id.as_str()), Some("42"));

        let mut partial = signed_in_store();
        partial.remove(USERNAME_KEY).unwrap();
        assert!(!IdentityContext::load(partial).is_authenticated());
    }

    #[test]
    fn login_persists_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("creds.json");

        let mut ctx = IdentityContext::load(FileStore::open(&path)?);
        let who = ctx.login(&FakeAuth::accepting(), "ana", "secret")?;
        assert_eq!(who.user_id, "7");
        assert_eq!(who.token, "tok-7");

        let reloaded = IdentityContext::load(FileStore::open(&path)?);
        assert_eq!(reloaded.identity(), Some(&who));
        Ok(())
    }

    #[test]
    fn login_failure_surfaces_server_text() {
        let mut api = FakeAuth::accepting();
        api.login = Err(ApiError::Status {
            status: 400,
            message: "Invalid credentials".into(),
        });

        let mut ctx = IdentityContext::anonymous();
        let err = ctx.login(&api, "ana", "wrong").unwrap_err();
        assert!(matches!(&err, Error::Auth(msg) if msg == "Invalid credentials"));
        assert!(!ctx.is_authenticated());

        api.login = Err(ApiError::Transport("connection refused".into()));
        let err = ctx.login(&api, "ana", "pw").unwrap_err();
        assert!(matches!(
            err,
            Error::Network {
                stage: NetworkStage::Login,
                ..
            }
        ));
    }

    #[test]
    fn invalidate_clears_every_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("creds.json");
        {
            let mut store = FileStore::open(&path)?;
            store.set(TOKEN_KEY, "tok")?;
            store.set(USER_ID_KEY, "42")?;
            store.set(USERNAME_KEY, "ana")?;
        }

        let mut ctx = IdentityContext::load(FileStore::open(&path)?);
        assert!(ctx.is_authenticated());
        ctx.invalidate();
        assert!(!ctx.is_authenticated());

        let store = FileStore::open(&path)?;
        for key in [TOKEN_KEY, USER_ID_KEY, USERNAME_KEY] {
            assert_eq!(store.get(key), None);
        }
        Ok(())
    }

    #[test]
    fn rejected_token_is_invalidated() -> anyhow::Result<()> {
        let mut api = FakeAuth::accepting();
        let mut ctx = IdentityContext::load(signed_in_store());
        assert!(ctx.verify(&api)?);
        assert!(ctx.is_authenticated());

        api.verify = Err(ApiError::Unauthorized);
        assert!(!ctx.verify(&api)?);
        assert!(!ctx.is_authenticated());
        assert_eq!(*api.verified.borrow(), vec!["tok", "tok"]);

        // Nobody to verify.
        assert!(!ctx.verify(&api)?);
        Ok(())
    }
}
