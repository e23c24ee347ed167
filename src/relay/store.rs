use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ACCESS_TOKEN_TTL, REFRESH_TOKEN_TTL};

/// Per-connection capability granted by a share token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareScope {
    View,
    Control,
}

impl ShareScope {
    pub fn parse(value: &str) -> Option<ShareScope> {
        match value.to_ascii_lowercase().as_str() {
            "view" => Some(ShareScope::View),
            "control" => Some(ShareScope::Control),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub status: String,
}

/// Live host connection bookkeeping for a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    #[serde(default)]
    pub host_connection_id: String,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub controller_client_id: String,
    pub cols: usize,
    pub rows: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareToken {
    pub token: String,
    pub session_id: String,
    pub scope: ShareScope,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ShareToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    sessions: HashMap<String, Session>,
    #[serde(default)]
    active: HashMap<String, ActiveSession>,
    #[serde(default)]
    share_tokens: HashMap<String, ShareToken>,
    #[serde(default)]
    access_tokens: HashMap<String, AccessToken>,
    #[serde(default)]
    refresh_tokens: HashMap<String, RefreshToken>,
}

/// Relay persistent state, saved to `state.json` in the data dir.
pub struct Store {
    state: Mutex<StoreState>,
}

const STATE_FILE: &str = "state.json";

impl Store {
    pub fn new() -> Store {
        Store {
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn load(data_dir: &Path) -> Result<Store> {
        let path = data_dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(Store::new());
        }
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let state: StoreState = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Store {
            state: Mutex::new(state),
        })
    }

    /// Persist atomically: serialize, write a temp file, rename over.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let raw = {
            let state = self.state.lock().unwrap();
            serde_json::to_vec_pretty(&*state)?
        };
        let path = data_dir.join(STATE_FILE);
        let tmp = tmp_path(&path);
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn upsert_session(&self, session: Session) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.id.clone(), session);
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.state.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn set_active_session(&self, active: ActiveSession) {
        let mut state = self.state.lock().unwrap();
        state.active.insert(active.session_id.clone(), active);
    }

    pub fn list_sessions(&self, username: &str) -> Vec<Session> {
        let state = self.state.lock().unwrap();
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|session| session.username == username)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn create_access_token(&self, username: &str, now: DateTime<Utc>) -> AccessToken {
        let token = AccessToken {
            token: new_token(),
            username: username.to_string(),
            created_at: now,
            expires_at: now + chrono_duration(ACCESS_TOKEN_TTL),
            last_used_at: None,
        };
        let mut state = self.state.lock().unwrap();
        state.access_tokens.insert(token.token.clone(), token.clone());
        token
    }

    pub fn validate_access_token(&self, token: &str, now: DateTime<Utc>) -> Result<AccessToken> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .access_tokens
            .get_mut(token)
            .ok_or_else(|| anyhow::anyhow!("invalid access token"))?;
        if now > entry.expires_at {
            anyhow::bail!("access token expired");
        }
        entry.last_used_at = Some(now);
        Ok(entry.clone())
    }

    pub fn create_refresh_token(&self, username: &str, now: DateTime<Utc>) -> RefreshToken {
        let token = RefreshToken {
            token: new_token(),
            username: username.to_string(),
            created_at: now,
            expires_at: now + chrono_duration(REFRESH_TOKEN_TTL),
            last_used_at: None,
            revoked_at: None,
        };
        let mut state = self.state.lock().unwrap();
        state
            .refresh_tokens
            .insert(token.token.clone(), token.clone());
        token
    }

    pub fn validate_refresh_token(&self, token: &str, now: DateTime<Utc>) -> Result<RefreshToken> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .refresh_tokens
            .get_mut(token)
            .ok_or_else(|| anyhow::anyhow!("invalid refresh token"))?;
        if entry.revoked_at.is_some() {
            anyhow::bail!("refresh token revoked");
        }
        if now > entry.expires_at {
            anyhow::bail!("refresh token expired");
        }
        entry.last_used_at = Some(now);
        Ok(entry.clone())
    }

    pub fn create_share_token(
        &self,
        session_id: &str,
        scope: ShareScope,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<ShareToken> {
        if session_id.is_empty() {
            anyhow::bail!("session id is required");
        }
        let token = ShareToken {
            token: new_token(),
            session_id: session_id.to_string(),
            scope,
            created_at: now,
            expires_at: ttl.map(|ttl| now + chrono_duration(ttl)),
            revoked_at: None,
        };
        let mut state = self.state.lock().unwrap();
        state.share_tokens.insert(token.token.clone(), token.clone());
        Ok(token)
    }

    pub fn get_share_token(&self, token: &str) -> Option<ShareToken> {
        self.state.lock().unwrap().share_tokens.get(token).cloned()
    }

    pub fn revoke_share_token(&self, token: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .share_tokens
            .get_mut(token)
            .ok_or_else(|| anyhow::anyhow!("unknown share token"))?;
        entry.revoked_at = Some(now);
        Ok(())
    }

    /// Drop all auth tokens belonging to a username (on user deletion).
    pub fn revoke_tokens_for_username(&self, username: &str) {
        let mut state = self.state.lock().unwrap();
        state.access_tokens.retain(|_, token| token.username != username);
        state
            .refresh_tokens
            .retain(|_, token| token.username != username);
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

pub fn new_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_token_lifecycle() {
        let store = Store::new();
        let now = Utc::now();
        let token = store
            .create_share_token("s1", ShareScope::View, Some(Duration::from_secs(60)), now)
            .unwrap();
        let fetched = store.get_share_token(&token.token).unwrap();
        assert_eq!(fetched.scope, ShareScope::View);
        assert!(!fetched.is_expired(now));
        assert!(fetched.is_expired(now + chrono::Duration::seconds(61)));

        store.revoke_share_token(&token.token, now).unwrap();
        assert!(store.get_share_token(&token.token).unwrap().is_expired(now));
    }

    #[test]
    fn access_token_expiry() {
        let store = Store::new();
        let now = Utc::now();
        let token = store.create_access_token("alice", now);
        assert!(store.validate_access_token(&token.token, now).is_ok());
        let later = now + chrono::Duration::hours(13);
        assert!(store.validate_access_token(&token.token, later).is_err());
        assert!(store.validate_access_token("bogus", now).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new();
        let now = Utc::now();
        store.upsert_session(Session {
            id: "s1".into(),
            username: "alice".into(),
            name: None,
            created_at: now,
            last_active_at: now,
            status: "active".into(),
        });
        store.create_access_token("alice", now);
        store.save(dir.path()).unwrap();

        let loaded = Store::load(dir.path()).unwrap();
        assert_eq!(loaded.get_session("s1").unwrap().username, "alice");
        assert_eq!(loaded.list_sessions("alice").len(), 1);
        assert!(loaded.list_sessions("bob").is_empty());
    }

    #[test]
    fn user_deletion_revokes_tokens() {
        let store = Store::new();
        let now = Utc::now();
        let token = store.create_access_token("alice", now);
        store.revoke_tokens_for_username("alice");
        assert!(store.validate_access_token(&token.token, now).is_err());
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(ShareScope::parse("view"), Some(ShareScope::View));
        assert_eq!(ShareScope::parse("Control"), Some(ShareScope::Control));
        assert_eq!(ShareScope::parse("admin"), None);
    }
}
