use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::USERS_WATCH_INTERVAL;
use crate::relay::auth;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub totp_secret: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, User>,
}

struct Inner {
    users: HashMap<String, User>,
    content_hash: [u8; 32],
}

/// User accounts backed by a JSON file. The file is also editable out of
/// band; [`UserStore::watch`] reloads it when the content hash changes.
pub struct UserStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl UserStore {
    pub fn load(path: &Path) -> Result<UserStore> {
        let (users, content_hash) = read_users(path)?;
        Ok(UserStore {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                users,
                content_hash,
            }),
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = {
            let inner = self.inner.lock().unwrap();
            serde_json::to_vec_pretty(&UsersFile {
                users: inner.users.clone(),
            })?
        };
        let hash = Sha256::digest(&raw).into();
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &self.path)?;
        self.inner.lock().unwrap().content_hash = hash;
        Ok(())
    }

    pub fn get(&self, username: &str) -> Option<User> {
        self.inner.lock().unwrap().users.get(username).cloned()
    }

    pub fn list(&self) -> Vec<User> {
        let inner = self.inner.lock().unwrap();
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().users.is_empty()
    }

    fn insert(&self, user: User) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user.username.clone(), user);
    }

    fn remove(&self, username: &str) -> Option<User> {
        self.inner.lock().unwrap().users.remove(username)
    }

    /// Poll the backing file and reload it when another process edited it.
    /// Runs until cancellation.
    pub async fn watch(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(USERS_WATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let (users, hash) = match read_users(&self.path) {
                Ok(read) => read,
                Err(err) => {
                    warn!(error = %err, "failed to re-read users file");
                    continue;
                }
            };
            let mut inner = self.inner.lock().unwrap();
            if inner.content_hash != hash {
                info!(count = users.len(), "users file changed on disk, reloaded");
                inner.users = users;
                inner.content_hash = hash;
            }
        }
    }
}

fn read_users(path: &Path) -> Result<(HashMap<String, User>, [u8; 32])> {
    if !path.exists() {
        return Ok((HashMap::new(), Sha256::digest(b"").into()));
    }
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: UsersFile = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok((parsed.users, Sha256::digest(&raw).into()))
}

/// Result of creating a user: the one-time plaintext credentials.
pub struct CreatedUser {
    pub user: User,
    pub password: String,
    pub totp_secret: String,
    pub totp_url: String,
}

pub fn create_user(store: &UserStore, username: &str, password: &str) -> Result<CreatedUser> {
    if username.is_empty() {
        anyhow::bail!("username is required");
    }
    if store.get(username).is_some() {
        anyhow::bail!("user already exists");
    }
    let password = if password.is_empty() {
        auth::generate_password()
    } else {
        password.to_string()
    };
    let totp_secret = auth::generate_totp_secret();
    let user = User {
        username: username.to_string(),
        password_hash: auth::hash_password(&password),
        totp_secret: totp_secret.clone(),
        created_at: Utc::now(),
    };
    store.insert(user.clone());
    debug!(username, "user created");
    Ok(CreatedUser {
        totp_url: auth::totp_url(username, &totp_secret),
        user,
        password,
        totp_secret,
    })
}

pub fn delete_user(store: &UserStore, username: &str) -> Result<User> {
    if username.is_empty() {
        anyhow::bail!("username is required");
    }
    store
        .remove(username)
        .ok_or_else(|| anyhow::anyhow!("user not found"))
}

pub fn change_user_password(store: &UserStore, username: &str, password: &str) -> Result<String> {
    let mut user = store
        .get(username)
        .ok_or_else(|| anyhow::anyhow!("user not found"))?;
    let password = if password.is_empty() {
        auth::generate_password()
    } else {
        password.to_string()
    };
    user.password_hash = auth::hash_password(&password);
    store.insert(user);
    Ok(password)
}

pub fn rotate_user_totp(store: &UserStore, username: &str) -> Result<(String, String)> {
    let mut user = store
        .get(username)
        .ok_or_else(|| anyhow::anyhow!("user not found"))?;
    let secret = auth::generate_totp_secret();
    user.totp_secret = secret.clone();
    let url = auth::totp_url(username, &secret);
    store.insert(user);
    Ok((secret, url))
}
