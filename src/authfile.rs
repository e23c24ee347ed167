//! On-disk credentials for the CLI: the token bundle obtained from
//! `/auth/login`, stored with owner-only permissions and refreshed through
//! `/auth/refresh` when the access token lapses.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAuth {
    pub endpoint: String,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

pub fn load(path: &Path) -> Result<StoredAuth> {
    let raw = fs::read(path).with_context(|| {
        format!(
            "no stored credentials at {}; run `cove login` first",
            path.display()
        )
    })?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save(path: &Path, auth: &StoredAuth) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_vec_pretty(auth)?;
    fs::write(path, raw)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// A valid access token for `endpoint`, refreshing and re-saving the bundle
/// when the stored one has expired.
pub async fn access_token(path: &Path, endpoint: &str) -> Result<String> {
    let auth = load(path)?;
    let stored_base = crate::wsclient::http_base(&auth.endpoint)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| auth.endpoint.clone());
    let wanted_base = crate::wsclient::http_base(endpoint)?.to_string();
    if !auth.endpoint.is_empty() && stored_base != wanted_base {
        bail!(
            "stored credentials are for {}, not {}; run `cove login` against this endpoint",
            auth.endpoint,
            endpoint
        );
    }
    let now = Utc::now();
    if now < auth.access_expires_at {
        return Ok(auth.access_token);
    }
    if now >= auth.refresh_expires_at {
        bail!("stored credentials expired; run `cove login` again");
    }
    let client = ApiClient::new(endpoint)?;
    let refreshed = client.refresh(&auth.refresh_token).await?;
    let auth = StoredAuth {
        endpoint: endpoint.to_string(),
        ..refreshed
    };
    save(path, &auth)?;
    Ok(auth.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredAuth {
        StoredAuth {
            endpoint: "http://relay.example".into(),
            access_token: "a".into(),
            access_expires_at: Utc::now() + chrono::Duration::hours(1),
            refresh_token: "r".into(),
            refresh_expires_at: Utc::now() + chrono::Duration::days(1),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        save(&path, &sample()).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.access_token, "a");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn missing_file_hints_at_login() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("auth.json")).unwrap_err();
        assert!(err.to_string().contains("cove login"));
    }

    #[tokio::test]
    async fn endpoint_mismatch_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        save(&path, &sample()).unwrap();
        let err = access_token(&path, "http://other.example").await.unwrap_err();
        assert!(err.to_string().contains("http://relay.example"));
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        save(&path, &sample()).unwrap();
        let token = access_token(&path, "http://relay.example").await.unwrap();
        assert_eq!(token, "a");
    }
}
