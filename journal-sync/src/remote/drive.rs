//! Google Drive backed remote store
//!
//! The blob is a single JSON file in the signed-in account's Drive, found by
//! name. Each upload tags the file's `appProperties` with the writing device,
//! so the metadata query alone tells whether this device wrote the current
//! copy. The account is chosen by the access token; `owner` is only used for
//! logging.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use super::http::transport_error;
use super::{EncryptedBlob, RemoteBlobClient, RemoteError, RemoteMetadata, RemoteResult};
use crate::config::DriveConfig;
use crate::device::DeviceId;
use crate::error::{SyncError, SyncResult};
use crate::session::OwnerId;

const FILE_FIELDS: &str = "id,modifiedTime,appProperties";
const BOUNDARY: &str = "class_journal_blob";
const FORMAT_VERSION: &str = "2.0";

pub struct DriveBlobClient {
    client: reqwest::Client,
    config: DriveConfig,
    access_token: RwLock<Option<SecretString>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    modified_time: DateTime<Utc>,
    #[serde(default)]
    app_properties: HashMap<String, String>,
}

impl DriveFile {
    fn device_id(&self) -> Option<DeviceId> {
        self.app_properties
            .get("deviceId")
            .map(|id| DeviceId::from_string(id.as_str()))
    }

    fn metadata(&self) -> RemoteMetadata {
        RemoteMetadata {
            updated_at: self.modified_time,
            device_id: self.device_id(),
        }
    }
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

impl DriveBlobClient {
    pub fn new(config: DriveConfig) -> SyncResult<Self> {
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

    /// OAuth access token with the `drive.file` scope.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token.map(SecretString::new);
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match self.access_token.read().as_ref() {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    /// The backup file, if it exists and is not in the trash.
    async fn find_file(&self) -> RemoteResult<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and trashed = false",
            self.config.file_name.replace('\'', "\\'")
        );
        let fields = format!("files({FILE_FIELDS})");

        let response = self
            .request(Method::GET, &self.config.api_url)
            .query(&[("q", query.as_str()), ("fields", fields.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let list: FileList = read_json(response).await?;
        Ok(list.files.into_iter().next())
    }
}

#[async_trait]
impl RemoteBlobClient for DriveBlobClient {
    async fn get_metadata(&self, _owner: &OwnerId) -> RemoteResult<Option<RemoteMetadata>> {
        Ok(self.find_file().await?.map(|file| file.metadata()))
    }

    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<EncryptedBlob> {
        let file = self
            .find_file()
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("{} for {owner}", self.config.file_name)))?;

        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), file.id);
        let response = self
            .request(Method::GET, &url)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(transport_error)?;

        let data: serde_json::Value = read_json(response).await?;
        let mut blob = EncryptedBlob::from_stored(data, file.modified_time)?;
        if blob.device_id.is_none() {
            blob.device_id = file.device_id();
        }
        Ok(blob)
    }

    async fn upsert(&self, owner: &OwnerId, blob: &EncryptedBlob) -> RemoteResult<RemoteMetadata> {
        let mut app_properties = serde_json::Map::new();
        app_properties.insert("timestamp".into(), json!(blob.updated_at.to_rfc3339()));
        app_properties.insert("version".into(), json!(FORMAT_VERSION));
        if let Some(device_id) = &blob.device_id {
            app_properties.insert("deviceId".into(), json!(device_id.as_str()));
        }

        let existing = self.find_file().await?;
        let upload_url = self.config.upload_url.trim_end_matches('/');
        let (method, url, metadata) = match &existing {
            Some(file) => (
                Method::PATCH,
                format!("{upload_url}/{}", file.id),
                json!({ "mimeType": "application/json", "appProperties": app_properties }),
            ),
            None => (
                Method::POST,
                upload_url.to_string(),
                json!({
                    "name": self.config.file_name,
                    "mimeType": "application/json",
                    "appProperties": app_properties,
                }),
            ),
        };

        let content =
            serde_json::to_string(blob).map_err(|e| RemoteError::Protocol(format!("blob: {e}")))?;

        let response = self
            .request(method, &url)
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={BOUNDARY}"),
            )
            .body(multipart_related(&metadata, &content))
            .send()
            .await
            .map_err(transport_error)?;

        let stored: DriveFile = read_json(response).await?;
        tracing::debug!(
            owner = %owner,
            file_id = %stored.id,
            created = existing.is_none(),
            modified_time = %stored.modified_time,
            "Drive backup written"
        );

        let mut metadata = stored.metadata();
        if metadata.device_id.is_none() {
            metadata.device_id = blob.device_id.clone();
        }
        Ok(metadata)
    }
}

/// Body for Drive's `uploadType=multipart`: file metadata, then content.
fn multipart_related(metadata: &serde_json::Value, content: &str) -> String {
    format!(
        "--{BOUNDARY}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\r\n\
         {metadata}\r\n\
         --{BOUNDARY}\r\n\
         Content-Type: application/json\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}--\r\n"
    )
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        // 403 is also used for rate limits, so it is not treated as a sign-out
        _ => RemoteError::Network(message),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> RemoteResult<T> {
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
