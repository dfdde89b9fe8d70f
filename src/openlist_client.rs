//! Authenticated HTTP client to the OpenList list/fs API (spec.md §4.5).
//! The teacher has no HTTP client of its own (its `execute_http_request`
//! shells out to `curl`); this is rewritten with `reqwest`, the client used
//! throughout the broader example pack for exactly this shape of
//! authenticated JSON API.

use crate::error::{CloudGatherError, Result};
use crate::settings::OpenListConnection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const READ_TIMEOUT_SLOW_STORAGE: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i32,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListData {
    content: Vec<ListEntry>,
    total: u64,
}

pub struct OpenListClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: parking_lot::RwLock<Option<String>>,
}

impl OpenListClient {
    pub fn new(conn: &OpenListConnection, slow_storage: bool) -> Result<Self> {
        let read_timeout = if slow_storage {
            READ_TIMEOUT_SLOW_STORAGE
        } else {
            READ_TIMEOUT
        };
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(read_timeout)
            .build()
            .map_err(CloudGatherError::from)?;
        Ok(OpenListClient {
            http,
            base_url: conn.base_url.trim_end_matches('/').to_string(),
            username: conn.username.clone(),
            password: conn.password(),
            token: parking_lot::RwLock::new(conn.token.clone()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// `login(username, password) -> token`.
    pub async fn login(&self) -> Result<String> {
        let resp: ApiEnvelope<LoginData> = self
            .http
            .post(self.endpoint("/api/auth/login"))
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?
            .json()
            .await?;
        self.store_token(resp)
    }

    /// `loginHashed(user, sha256Pwd) -> token`.
    pub async fn login_hashed(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.password.as_bytes());
        let hashed = format!("{:x}", hasher.finalize());
        let resp: ApiEnvelope<LoginData> = self
            .http
            .post(self.endpoint("/api/auth/login/hash"))
            .json(&serde_json::json!({
                "username": self.username,
                "password": hashed,
            }))
            .send()
            .await?
            .json()
            .await?;
        self.store_token(resp)
    }

    fn store_token(&self, resp: ApiEnvelope<LoginData>) -> Result<String> {
        match resp.data {
            Some(data) if resp.code == 200 => {
                *self.token.write() = Some(data.token.clone());
                Ok(data.token)
            }
            _ => Err(CloudGatherError::Auth(resp.message)),
        }
    }

    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.current_token() {
            return Ok(token);
        }
        self.login().await
    }

    /// Runs one authenticated attempt; on `ErrAuth` re-logs in once and
    /// retries before surfacing the failure, per spec.md §4.5 and §7.
    async fn call_authed<T>(
        &self,
        attempt: impl Fn(&Self, String) -> futures::future::BoxFuture<'_, Result<T>>,
    ) -> Result<T> {
        let token = self.ensure_token().await?;
        match attempt(self, token).await {
            Err(CloudGatherError::Auth(_)) => {
                let token = self.login().await?;
                attempt(self, token).await
            }
            other => other,
        }
    }

    /// `list(path, page, perPage) -> (entries, total)`. Callers iterate
    /// pages until the returned page is short (spec.md §4.5 pagination
    /// contract); idempotent, so wrapped in the read-retry policy.
    pub async fn list(&self, path: &str, page: u32, per_page: u32) -> Result<(Vec<ListEntry>, u64)> {
        with_retry(|| async {
            self.call_authed(|client, token| {
                Box::pin(async move { client.list_once(path, page, per_page, token).await })
            })
            .await
        })
        .await
    }

    async fn list_once(&self, path: &str, page: u32, per_page: u32, token: String) -> Result<(Vec<ListEntry>, u64)> {
        let resp = self
            .http
            .post(self.endpoint("/api/fs/list"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "path": path,
                "page": page,
                "per_page": per_page,
                "refresh": false,
            }))
            .send()
            .await?;
        let envelope: ApiEnvelope<ListData> = resp.json().await?;
        match envelope.data {
            Some(data) if envelope.code == 200 => Ok((data.content, data.total)),
            _ if envelope.code == 401 => Err(CloudGatherError::Auth(envelope.message)),
            _ => Err(CloudGatherError::Remote(envelope.message)),
        }
    }

    /// `get(path) -> entry`.
    pub async fn get(&self, path: &str) -> Result<ListEntry> {
        with_retry(|| async {
            self.call_authed(|client, token| Box::pin(async move { client.get_once(path, token).await }))
                .await
        })
        .await
    }

    async fn get_once(&self, path: &str, token: String) -> Result<ListEntry> {
        let resp = self
            .http
            .post(self.endpoint("/api/fs/get"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await?;
        let envelope: ApiEnvelope<ListEntry> = resp.json().await?;
        match envelope.data {
            Some(entry) if envelope.code == 200 => Ok(entry),
            _ if envelope.code == 401 => Err(CloudGatherError::Auth(envelope.message)),
            _ => Err(CloudGatherError::Remote(envelope.message)),
        }
    }

    /// `download(path, sink)` — streams a pre-signed download URL into
    /// `sink`, writing via the same atomic write-then-rename the caller
    /// (the STRM worker) wraps this in.
    pub async fn download<W: tokio::io::AsyncWrite + Unpin>(&self, download_url: &str, sink: &mut W) -> Result<()> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let resp = self.http.get(download_url).send().await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(CloudGatherError::from)?;
            sink.write_all(&chunk)
                .await
                .map_err(|e| CloudGatherError::io(download_url, e))?;
        }
        sink.flush().await.map_err(|e| CloudGatherError::io(download_url, e))?;
        Ok(())
    }

    /// `delete(path)` — a write, attempted at most twice (spec.md §4.5),
    /// surfacing any failure rather than silently swallowing it.
    pub async fn delete(&self, dir: &str, names: &[String]) -> Result<()> {
        let mut last_err = None;
        for _ in 0..2 {
            match self
                .call_authed(|client, token| {
                    Box::pin(async move { client.delete_once(dir, names, token).await })
                })
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }

    async fn delete_once(&self, dir: &str, names: &[String], token: String) -> Result<()> {
        let resp = self
            .http
            .post(self.endpoint("/api/fs/remove"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "dir": dir, "names": names }))
            .send()
            .await?;
        let envelope: ApiEnvelope<serde_json::Value> = resp.json().await?;
        if envelope.code == 401 {
            return Err(CloudGatherError::Auth(envelope.message));
        }
        if envelope.code != 200 {
            return Err(CloudGatherError::Remote(envelope.message));
        }
        Ok(())
    }

    /// Builds a `.strm` URL in `AlistURL` mode: `<publicBase|base>/d/<path>?sign=<sign>`.
    pub fn alist_url(&self, public_base: Option<&str>, remote_path: &str, sign: &str) -> String {
        let base = public_base.unwrap_or(&self.base_url);
        let encoded = urlencoding_path(remote_path);
        if sign.is_empty() {
            format!("{base}/d{encoded}")
        } else {
            format!("{base}/d{encoded}?sign={sign}")
        }
    }
}

fn urlencoding_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            seg.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                        c.to_string()
                    } else {
                        c.to_string()
                            .bytes()
                            .map(|b| format!("%{b:02X}"))
                            .collect::<String>()
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Three-attempt exponential backoff for idempotent reads (list/get), per
/// spec.md §4.5.
async fn with_retry<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut backoff = Duration::from_secs(1);
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < 2 => {
                attempt += 1;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
                tracing::warn!(attempt, error = %e, "openlist request failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alist_url_omits_sign_when_empty() {
        let conn = OpenListConnection {
            base_url: "https://cloud.example".into(),
            ..Default::default()
        };
        let client = OpenListClient::new(&conn, false).unwrap();
        assert_eq!(
            client.alist_url(None, "/Movies/a.mkv", ""),
            "https://cloud.example/d/Movies/a.mkv"
        );
    }

    #[test]
    fn alist_url_includes_sign_and_public_base() {
        let conn = OpenListConnection {
            base_url: "https://cloud.example".into(),
            ..Default::default()
        };
        let client = OpenListClient::new(&conn, false).unwrap();
        let url = client.alist_url(Some("https://public.example"), "/Movies/a.mkv", "abc123");
        assert_eq!(url, "https://public.example/d/Movies/a.mkv?sign=abc123");
    }
}
