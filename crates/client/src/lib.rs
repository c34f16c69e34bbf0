//! Tombola client: the Felt REST surface the sampling pipeline needs.
//!
//! [`FeltApi`] is the seam every other crate depends on. [`FeltClient`] implements it
//! over HTTP; [`mock::MockFelt`] implements it in memory for tests. The polling and
//! upload primitives in [`poll`] and [`upload`] are written against the trait, so they
//! behave identically over either.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod mock;
pub mod poll;
pub mod upload;

pub use http::{FeltClient, DEFAULT_BASE_URL};
pub use poll::{wait_for_export, wait_for_layer, PollOptions};
pub use upload::upload_file;

/// Client-side errors. API and transport errors are never retried here.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("Felt API {method} {path} failed ({status}): {body}")]
    Api { method: String, path: String, status: u16, body: String },
    #[error("Felt API {method} {path} returned no content")]
    EmptyResponse { method: String, path: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding response from {path}: {source}")]
    Decode { path: String, #[source] source: serde_json::Error },
    #[error("export {export_id} failed")]
    ExportFailed { export_id: String },
    #[error("export {export_id} timed out after {elapsed_ms}ms")]
    ExportTimeout { export_id: String, elapsed_ms: u128 },
    #[error("layer {layer_id} processing failed")]
    LayerProcessingFailed { layer_id: String },
    #[error("layer {layer_id} processing timed out after {elapsed_ms}ms")]
    LayerProcessingTimeout { layer_id: String, elapsed_ms: u128 },
    #[error("presigned upload failed ({status}): {body}")]
    UploadTransport { status: u16, body: String },
    #[error("export download failed ({status})")]
    Download { status: u16 },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Status of an asynchronous platform job (export or layer processing).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Any status string this client does not know; treated as still running.
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeltMap {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeltLayer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportLink {
    pub export_link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRequest {
    pub export_request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportStatus {
    #[serde(default)]
    pub status: JobState,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Single-use upload credentials returned by `POST /maps/{id}/upload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub layer_id: String,
    pub layer_group_id: String,
    /// Storage endpoint (not the Felt API) that accepts the multipart form.
    pub url: String,
    #[serde(default)]
    pub presigned_attributes: BTreeMap<String, String>,
}

/// Felt operations used by the pipeline.
#[async_trait::async_trait]
pub trait FeltApi: Send + Sync {
    /// `POST /maps`
    async fn create_map(&self, title: Option<&str>) -> ClientResult<FeltMap>;

    /// `GET /maps/{map}/layers/{layer}`
    async fn get_layer(&self, map_id: &str, layer_id: &str) -> ClientResult<FeltLayer>;

    /// `GET /maps/{map}/layers/{layer}/get_export_link`
    async fn get_export_link(&self, map_id: &str, layer_id: &str) -> ClientResult<ExportLink>;

    /// `POST /maps/{map}/layers/{layer}/custom_export`
    async fn create_custom_export(&self, map_id: &str, layer_id: &str, output_format: &str) -> ClientResult<ExportRequest>;

    /// `GET /maps/{map}/layers/{layer}/custom_exports/{export}`
    async fn custom_export_status(&self, map_id: &str, layer_id: &str, export_id: &str) -> ClientResult<ExportStatus>;

    /// `POST /maps/{map}/upload`
    async fn request_upload(&self, map_id: &str, name: &str) -> ClientResult<UploadTarget>;

    /// Multipart POST of `payload` plus the presigned fields to `target.url`.
    async fn post_presigned(&self, target: &UploadTarget, file_name: &str, payload: Bytes) -> ClientResult<()>;

    /// Unauthenticated GET of an export archive.
    async fn download(&self, url: &str) -> ClientResult<Bytes>;
}

pub mod prelude {
    pub use super::{ClientError, ClientResult, FeltApi, FeltClient, JobState, PollOptions, UploadTarget};
}
