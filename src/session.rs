// ===============================
// src/session.rs
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : session.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a self-healing WebSocket to the FinLearn price stream,
          reconciles price snapshots into a local quote book, values the
          paper portfolio on every tick, and executes buy/sell orders
          against the backend with authoritative reconciliation.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
//
// Explicit session context (token + user id) with a JSON file as durable
// storage. Lifecycle:
//   login   -> Session created and persisted
//   restore -> read file, verify by fetching the profile; any failure clears it
//   logout  -> file removed, Session dropped
//
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::api::{ApiClient, UserProfile};
use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub async fn load(&self) -> Result<Option<Session>, SessionError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&self.path, serde_json::to_vec_pretty(session)?).await?;
        Ok(())
    }

    /// Idempotent.
    pub async fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub async fn login(
    api: &ApiClient,
    store: &SessionStore,
    username: &str,
    password: &str,
) -> Result<(Session, UserProfile), SessionError> {
    let rsp = api.login(username, password).await?;
    let session = Session { token: rsp.token, user_id: rsp.user_id };
    store.save(&session).await?;
    let profile = api.with_session(&session).profile(session.user_id).await?;
    info!(user_id = session.user_id, username = %profile.username, "logged in");
    Ok((session, profile))
}

/// New account, then signed in straight away.
pub async fn register(
    api: &ApiClient,
    store: &SessionStore,
    username: &str,
    email: &str,
    password: &str,
) -> Result<(Session, UserProfile), SessionError> {
    api.register(username, email, password).await?;
    info!(%username, "account created");
    login(api, store, username, password).await
}

/// Restores a stored session. Storage is cleared when the file is unreadable or
/// the backend no longer accepts it.
pub async fn restore(api: &ApiClient, store: &SessionStore) -> Option<(Session, UserProfile)> {
    let session = match store.load().await {
        Ok(Some(s)) => s,
        Ok(None) => return None,
        Err(e) => {
            warn!(%e, "discarding unreadable session");
            let _ = store.clear().await;
            return None;
        }
    };

    match api.with_session(&session).profile(session.user_id).await {
        Ok(profile) => {
            info!(user_id = session.user_id, username = %profile.username, "session restored");
            Some((session, profile))
        }
        Err(e) => {
            warn!(%e, user_id = session.user_id, "failed to fetch user, clearing session");
            let _ = store.clear().await;
            None
        }
    }
}

pub async fn logout(store: &SessionStore, session: Session) -> Result<(), SessionError> {
    store.clear().await?;
    info!(user_id = session.user_id, "logged out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use std::time::Duration;

    #[tokio::test]
    async fn save_load_clear_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/session.json"));
        assert_eq!(store.load().await.unwrap(), None);

        let s = Session { token: "tok".into(), user_id: 12 };
        store.save(&s).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(s.clone()));

        logout(&store, s).await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_cleared_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{oops").await.unwrap();
        let store = SessionStore::new(&path);
        assert!(matches!(store.load().await, Err(SessionError::Corrupt(_))));

        let api = ApiClient::new("http://127.0.0.1:9/api", Duration::from_millis(200)).unwrap();
        assert!(restore(&api, &store).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unreachable_backend_clears_session_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        store.save(&Session { token: "t".into(), user_id: 1 }).await.unwrap();

        let api = ApiClient::new("http://127.0.0.1:9/api", Duration::from_millis(200)).unwrap();
        assert!(restore(&api, &store).await.is_none());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_register_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let api = ApiClient::new("http://127.0.0.1:9/api", Duration::from_millis(200)).unwrap();

        let err = register(&api, &store, "ana", "ana@example.com", "pw123456").await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::Network(_))));
        assert!(!store.path().exists());
    }
}
