//! Dropbox binding of the [`BlobStore`] interface.
//!
//! Talks to the Dropbox HTTP API v2 with a bearer token. Conditional write
//! semantics map directly onto Dropbox upload modes: `add` fails on an
//! existing path, `update` fails unless the current rev matches, both with
//! `strict_conflict` so content-identical writes still conflict. Objects
//! above the chunk threshold go through upload sessions.
//!
//! The client honors `HTTP_PROXY` / `HTTPS_PROXY` through reqwest's default
//! proxy handling. Retries are the caller's concern; errors here are only
//! classified.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use dropbox_git::store::{BlobStore, Rev, StoreError};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Uploads larger than this go through an upload session.
pub const CHUNK_SIZE: usize = 50 * 1024 * 1024;

pub struct DropboxClient {
    http: reqwest::Client,
    token: String,
}

#[derive(Debug, Clone)]
enum WriteMode {
    Add,
    Overwrite,
    Update(String),
}

impl WriteMode {
    fn to_json(&self) -> Value {
        match self {
            WriteMode::Add => json!({".tag": "add"}),
            WriteMode::Overwrite => json!({".tag": "overwrite"}),
            WriteMode::Update(rev) => json!({".tag": "update", "update": rev}),
        }
    }
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Other(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    /// Validate the token with a cheap account lookup.
    pub async fn check_connection(&self) -> Result<(), StoreError> {
        self.rpc("users/get_current_account", &Value::Null).await?;
        Ok(())
    }

    async fn rpc(&self, endpoint: &str, args: &Value) -> Result<Value, StoreError> {
        let url = format!("{}/{}", API_BASE, endpoint);
        debug!(endpoint, "dropbox rpc");
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/json")
            .body(args.to_string())
            .send()
            .await
            .map_err(|e| StoreError::Transient(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transient(format!("{}: {}", endpoint, e)))?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| StoreError::Other(format!("{}: invalid response: {}", endpoint, e)))
    }

    /// Content-endpoint request: args travel in the `Dropbox-API-Arg`
    /// header, the body carries raw bytes.
    async fn content_request(
        &self,
        endpoint: &str,
        args: &Value,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StoreError> {
        let url = format!("{}/{}", CONTENT_BASE, endpoint);
        debug!(endpoint, bytes = body.len(), "dropbox content request");
        let arg_header = HeaderValue::from_str(&header_safe_json(args))
            .map_err(|e| StoreError::Other(format!("api arg header: {}", e)))?;
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", arg_header)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Transient(format!("{}: {}", endpoint, e)))?;
        Ok(response)
    }

    async fn upload(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: WriteMode,
    ) -> Result<Rev, StoreError> {
        if data.len() > CHUNK_SIZE {
            return self.upload_chunked(path, data, mode).await;
        }
        let args = json!({
            "path": path,
            "mode": mode.to_json(),
            "strict_conflict": true,
            "autorename": false,
            "mute": true,
        });
        let response = self.content_request("files/upload", &args, data).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transient(format!("upload: {}", e)))?;
        if !status.is_success() {
            return Err(classify_write_error(status, &body, &mode));
        }
        parse_rev(&body)
    }

    async fn upload_chunked(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: WriteMode,
    ) -> Result<Rev, StoreError> {
        let first = data[..CHUNK_SIZE].to_vec();
        let response = self
            .content_request("files/upload_session/start", &json!({"close": false}), first)
            .await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transient(format!("upload_session/start: {}", e)))?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        let session_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["session_id"].as_str().map(str::to_string))
            .ok_or_else(|| StoreError::Other("upload session without session_id".into()))?;

        let mut offset = CHUNK_SIZE;
        while data.len() - offset > CHUNK_SIZE {
            let chunk = data[offset..offset + CHUNK_SIZE].to_vec();
            let args = json!({
                "cursor": {"session_id": session_id, "offset": offset},
                "close": false,
            });
            let response = self
                .content_request("files/upload_session/append_v2", &args, chunk)
                .await?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| StoreError::Transient(format!("upload_session/append: {}", e)))?;
            if !status.is_success() {
                return Err(classify_error(status, &body));
            }
            offset += CHUNK_SIZE;
        }

        let last = data[offset..].to_vec();
        let args = json!({
            "cursor": {"session_id": session_id, "offset": offset},
            "commit": {
                "path": path,
                "mode": mode.to_json(),
                "strict_conflict": true,
                "autorename": false,
                "mute": true,
            },
        });
        let response = self
            .content_request("files/upload_session/finish", &args, last)
            .await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transient(format!("upload_session/finish: {}", e)))?;
        if !status.is_success() {
            return Err(classify_write_error(status, &body, &mode));
        }
        parse_rev(&body)
    }
}

#[async_trait]
impl BlobStore for DropboxClient {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Rev), StoreError> {
        let args = json!({"path": path});
        let response = self
            .content_request("files/download", &args, Vec::new())
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| StoreError::Transient(format!("download: {}", e)))?;
            return Err(classify_error(status, &body));
        }
        let rev = response
            .headers()
            .get("Dropbox-API-Result")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<Value>(v).ok())
            .and_then(|v| v["rev"].as_str().map(str::to_string))
            .ok_or_else(|| StoreError::Other("download response without rev".into()))?;
        let data = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transient(format!("download: {}", e)))?;
        Ok((data.to_vec(), Rev(rev)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Rev)>, StoreError> {
        let mut entries = Vec::new();
        let mut response = self
            .rpc(
                "files/list_folder",
                &json!({"path": prefix, "recursive": true}),
            )
            .await?;
        loop {
            for entry in response["entries"].as_array().into_iter().flatten() {
                if entry[".tag"].as_str() != Some("file") {
                    continue;
                }
                let path = entry["path_lower"].as_str();
                let rev = entry["rev"].as_str();
                if let (Some(path), Some(rev)) = (path, rev) {
                    entries.push((path.to_string(), Rev(rev.to_string())));
                }
            }
            if !response["has_more"].as_bool().unwrap_or(false) {
                break;
            }
            let cursor = response["cursor"]
                .as_str()
                .ok_or_else(|| StoreError::Other("list_folder without cursor".into()))?
                .to_string();
            response = self
                .rpc("files/list_folder/continue", &json!({"cursor": cursor}))
                .await?;
        }
        Ok(entries)
    }

    async fn put_create(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError> {
        self.upload(path, data, WriteMode::Add).await
    }

    async fn put_update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: &Rev,
    ) -> Result<Rev, StoreError> {
        self.upload(path, data, WriteMode::Update(expected.as_str().to_string()))
            .await
    }

    async fn put_overwrite(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError> {
        self.upload(path, data, WriteMode::Overwrite).await
    }

    async fn delete(&self, path: &str, expected: &Rev) -> Result<(), StoreError> {
        self.rpc(
            "files/delete_v2",
            &json!({"path": path, "parent_rev": expected.as_str()}),
        )
        .await?;
        Ok(())
    }
}

fn parse_rev(body: &str) -> Result<Rev, StoreError> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["rev"].as_str().map(str::to_string))
        .map(Rev)
        .ok_or_else(|| StoreError::Other("upload response without rev".into()))
}

fn error_summary(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error_summary"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Classify a non-success response for reads, lists and deletes.
fn classify_error(status: StatusCode, body: &str) -> StoreError {
    let summary = error_summary(body);
    if status == StatusCode::UNAUTHORIZED {
        return StoreError::Auth(summary);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return StoreError::Transient(summary);
    }
    if status == StatusCode::CONFLICT {
        if summary.contains("not_found") {
            return StoreError::NotFound(summary);
        }
        if summary.contains("conflict") {
            return StoreError::RevMismatch(summary);
        }
    }
    StoreError::Other(format!("{}: {}", status, summary))
}

/// Classify a failed conditional write according to the mode it used.
fn classify_write_error(status: StatusCode, body: &str, mode: &WriteMode) -> StoreError {
    let summary = error_summary(body);
    if status == StatusCode::CONFLICT && summary.contains("conflict") {
        return match mode {
            WriteMode::Add => StoreError::AlreadyExists(summary),
            WriteMode::Update(_) => StoreError::RevMismatch(summary),
            WriteMode::Overwrite => StoreError::Other(summary),
        };
    }
    classify_error(status, body)
}

/// JSON for the `Dropbox-API-Arg` header: non-ASCII and control characters
/// must be `\uXXXX`-escaped to stay header-safe.
fn header_safe_json(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if (' '..='\u{7e}').contains(&c) {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
