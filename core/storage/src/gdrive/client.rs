//! Google Drive API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use worldback_common::{Error, Result};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,appProperties";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    #[serde(default)]
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Created time.
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    /// Private key/value tags set by this application.
    #[serde(default)]
    pub app_properties: HashMap<String, String>,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// State of a resumable upload as reported by Drive.
#[derive(Debug, Clone)]
pub enum UploadStatus {
    /// `308 Resume Incomplete` with the durable byte count.
    Incomplete { bytes_confirmed: u64 },
    /// Upload finished; the file resource is returned.
    Complete(DriveFile),
}

/// Google Drive API client.
///
/// Holds no credentials; each call takes the access token to use.
pub struct DriveClient {
    http: Client,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("Worldback/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    /// Find a top-level folder by name.
    pub async fn find_folder(&self, token: &str, name: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query(name),
            FOLDER_MIME_TYPE
        );

        let response = self
            .http
            .get(format!("{}/files", DRIVE_API_BASE))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("fields", "files(id,name,mimeType)"),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to find folder: {}", e)))?;

        let list: FileListResponse = handle_response(response).await?;
        Ok(list.files.into_iter().next())
    }

    /// Create a top-level folder.
    pub async fn create_folder(&self, token: &str, name: &str) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
        });

        let response = self
            .http
            .post(format!("{}/files", DRIVE_API_BASE))
            .bearer_auth(token)
            .query(&[("fields", "id,name,mimeType")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

        handle_response(response).await
    }

    /// List files in `folder_id` tagged with `key = value`.
    pub async fn list_by_app_property(
        &self,
        token: &str,
        folder_id: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<DriveFile>> {
        let query = format!(
            "'{}' in parents and trashed = false and appProperties has {{ key='{}' and value='{}' }}",
            escape_query(folder_id),
            escape_query(key),
            escape_query(value)
        );
        let fields = format!("files({}),nextPageToken", FILE_FIELDS);

        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/files", DRIVE_API_BASE))
                .bearer_auth(token)
                .query(&[
                    ("q", query.as_str()),
                    ("spaces", "drive"),
                    ("fields", fields.as_str()),
                    ("pageSize", "1000"),
                ]);

            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list files: {}", e)))?;

            let list: FileListResponse = handle_response(response).await?;
            all_files.extend(list.files);

            match list.next_page_token {
                Some(page) => page_token = Some(page),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Start a resumable upload session and return its session URI.
    pub async fn start_resumable_upload(
        &self,
        token: &str,
        metadata: &serde_json::Value,
        total_size: u64,
    ) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/files", DRIVE_UPLOAD_BASE))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", "application/zip")
            .header("X-Upload-Content-Length", total_size.to_string())
            .json(metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start resumable upload: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Network("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Network(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Ask Drive how many bytes of a session it holds.
    pub async fn query_upload_status(
        &self,
        token: &str,
        upload_uri: &str,
        total_size: u64,
    ) -> Result<UploadStatus> {
        let response = self
            .http
            .put(upload_uri)
            .bearer_auth(token)
            .header(header::CONTENT_LENGTH, "0")
            .header(header::CONTENT_RANGE, format!("bytes */{}", total_size))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to query upload status: {}", e)))?;

        upload_status(response).await
    }

    /// Upload one chunk of a resumable session.
    pub async fn upload_chunk(
        &self,
        token: &str,
        upload_uri: &str,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<UploadStatus> {
        if data.is_empty() {
            return Err(Error::InvalidInput("Empty chunk".to_string()));
        }
        let end_byte = offset + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", offset, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .bearer_auth(token)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(Bytes::copy_from_slice(data))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload chunk: {}", e)))?;

        upload_status(response).await
    }

    /// Delete a file.
    pub async fn delete(&self, token: &str, file_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

/// Interpret the response to a chunk PUT or status query.
async fn upload_status(response: reqwest::Response) -> Result<UploadStatus> {
    let status = response.status();

    if status == StatusCode::OK || status == StatusCode::CREATED {
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse upload response: {}", e)))?;
        return Ok(UploadStatus::Complete(file));
    }

    if status == StatusCode::PERMANENT_REDIRECT {
        let range = response
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok());
        return Ok(UploadStatus::Incomplete {
            bytes_confirmed: parse_range_header(range),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_session_status(status, &body))
}

/// Handle API response with error checking.
async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map a Drive HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(format!("Drive rejected token: {}", body)),
        StatusCode::NOT_FOUND => Error::NotFound(format!("Drive resource not found: {}", body)),
        StatusCode::FORBIDDEN if body.contains("rateLimitExceeded") => {
            Error::Network(format!("Drive rate limit: {}", body))
        }
        StatusCode::FORBIDDEN => Error::NotPermitted(format!("Drive denied access: {}", body)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::Network(format!("Drive API error {}: {}", status, body))
        }
        s if s.is_server_error() => Error::Network(format!("Drive API error {}: {}", s, body)),
        s => Error::InvalidInput(format!("Drive API error {}: {}", s, body)),
    }
}

/// Like [`classify_status`], but a missing session means it expired.
pub(crate) fn classify_session_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Error::SessionExpired(format!("Drive upload session gone ({})", status))
        }
        _ => classify_status(status, body),
    }
}

/// Parse the `Range: bytes=0-N` header of a 308 response.
///
/// A missing header means Drive holds nothing yet.
pub(crate) fn parse_range_header(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

/// Escape a value for a Drive `q` string literal.
pub(crate) fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
