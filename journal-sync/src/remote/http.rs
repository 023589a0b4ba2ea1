//! PostgREST-backed remote store
//!
//! Table layout: `user_journal_data(user_id text primary key, data jsonb,
//! updated_at timestamptz)`, one row per owner. `data` holds the
//! [`EncryptedBlob`] JSON, or the plain document for backups written before
//! encryption existed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{EncryptedBlob, RemoteBlobClient, RemoteError, RemoteMetadata, RemoteResult};
use crate::config::RemoteConfig;
use crate::device::DeviceId;
use crate::error::{SyncError, SyncResult};
use crate::session::OwnerId;

const METADATA_COLUMNS: &str = "updated_at,device_id:data->>deviceId";
const BLOB_COLUMNS: &str = "data,updated_at";

pub struct HttpBlobClient {
    client: reqwest::Client,
    config: RemoteConfig,
    access_token: RwLock<Option<SecretString>>,
}

#[derive(Deserialize)]
struct MetadataRow {
    updated_at: DateTime<Utc>,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct BlobRow {
    /// Encrypted envelope, or the bare document for old unencrypted backups.
    data: serde_json::Value,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct UpsertRow<'a> {
    user_id: &'a str,
    data: &'a EncryptedBlob,
    updated_at: DateTime<Utc>,
}

impl HttpBlobClient {
    pub fn new(config: RemoteConfig) -> SyncResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            access_token: RwLock::new(None),
        })
    }

    /// Bearer token of the signed-in owner, supplied by the auth layer.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token.map(SecretString::new);
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.table
        )
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let mut req = self.client.request(method, self.table_url());

        if let Some(api_key) = &self.config.api_key {
            req = req.header("apikey", api_key);
        }
        if let Some(token) = self.access_token.read().as_ref() {
            req = req.bearer_auth(token.expose_secret());
        }

        req
    }

    async fn select<T: DeserializeOwned>(&self, owner: &OwnerId, columns: &str) -> RemoteResult<Vec<T>> {
        let filter = format!("eq.{owner}");
        let response = self
            .request(Method::GET)
            .query(&[("user_id", filter.as_str()), ("select", columns)])
            .send()
            .await
            .map_err(transport_error)?;

        read_rows(response).await
    }
}

#[async_trait]
impl RemoteBlobClient for HttpBlobClient {
    async fn get_metadata(&self, owner: &OwnerId) -> RemoteResult<Option<RemoteMetadata>> {
        let rows: Vec<MetadataRow> = self.select(owner, METADATA_COLUMNS).await?;

        Ok(rows.into_iter().next().map(|row| RemoteMetadata {
            updated_at: row.updated_at,
            device_id: row.device_id.map(DeviceId::from_string),
        }))
    }

    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<EncryptedBlob> {
        let rows: Vec<BlobRow> = self.select(owner, BLOB_COLUMNS).await?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(owner.to_string()))?;

        EncryptedBlob::from_stored(row.data, row.updated_at)
    }

    async fn upsert(&self, owner: &OwnerId, blob: &EncryptedBlob) -> RemoteResult<RemoteMetadata> {
        let row = UpsertRow {
            user_id: owner.as_str(),
            data: blob,
            updated_at: blob.updated_at,
        };

        let response = self
            .request(Method::POST)
            .query(&[("on_conflict", "user_id"), ("select", METADATA_COLUMNS)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&[row])
            .send()
            .await
            .map_err(transport_error)?;

        let rows: Vec<MetadataRow> = read_rows(response).await?;
        let stored = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Protocol("upsert returned no row".to_string()))?;

        tracing::debug!(owner = %owner, updated_at = %stored.updated_at, "Remote blob written");

        Ok(RemoteMetadata {
            updated_at: stored.updated_at,
            device_id: stored.device_id.map(DeviceId::from_string).or_else(|| blob.device_id.clone()),
        })
    }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::AuthExpired(message),
        _ => RemoteError::Network(message),
    }
}

pub(super) fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Network(err.to_string())
}

async fn read_rows<T: DeserializeOwned>(response: Response) -> RemoteResult<Vec<T>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| RemoteError::Protocol(e.to_string()))
}
