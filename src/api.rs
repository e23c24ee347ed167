//! Thin REST client for the relay's auth/share/session endpoints.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::authfile::StoredAuth;
use crate::relay::store::Session;
use crate::wsclient::http_base;

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    access_expires_at: DateTime<Utc>,
    refresh_token: String,
    refresh_expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

impl ApiClient {
    pub fn new(endpoint: &str) -> Result<ApiClient> {
        Ok(ApiClient {
            http: reqwest::Client::new(),
            base: http_base(endpoint)?,
        })
    }

    pub async fn login(&self, username: &str, password: &str, totp: &str) -> Result<StoredAuth> {
        let response = self
            .http
            .post(self.url("/auth/login")?)
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "totp": totp,
            }))
            .send()
            .await
            .context("login request failed")?;
        let tokens: TokenResponse = decode(response).await?;
        Ok(self.stored(tokens))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<StoredAuth> {
        let response = self
            .http
            .post(self.url("/auth/refresh")?)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .context("refresh request failed")?;
        let tokens: TokenResponse = decode(response).await?;
        Ok(self.stored(tokens))
    }

    pub async fn list_sessions(&self, token: &str) -> Result<Vec<Session>> {
        let response = self
            .http
            .get(self.url("/sessions")?)
            .bearer_auth(token)
            .send()
            .await
            .context("sessions request failed")?;
        decode(response).await
    }

    pub async fn share_create(
        &self,
        token: &str,
        session_id: &str,
        scope: &str,
        ttl: Option<&str>,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct ShareResponse {
            token: String,
        }
        let response = self
            .http
            .post(self.url("/share/create")?)
            .bearer_auth(token)
            .json(&serde_json::json!({
                "session_id": session_id,
                "scope": scope,
                "ttl": ttl,
            }))
            .send()
            .await
            .context("share create request failed")?;
        let share: ShareResponse = decode(response).await?;
        Ok(share.token)
    }

    pub async fn share_revoke(&self, token: &str, share_token: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("/share/revoke")?)
            .bearer_auth(token)
            .json(&serde_json::json!({ "token": share_token }))
            .send()
            .await
            .context("share revoke request failed")?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).context("invalid endpoint path")
    }

    fn stored(&self, tokens: TokenResponse) -> StoredAuth {
        StoredAuth {
            endpoint: self.base.to_string().trim_end_matches('/').to_string(),
            access_token: tokens.access_token,
            access_expires_at: tokens.access_expires_at,
            refresh_token: tokens.refresh_token,
            refresh_expires_at: tokens.refresh_expires_at,
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("invalid response body");
    }
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    bail!("{message}");
}
