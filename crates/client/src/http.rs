//! reqwest-backed [`FeltApi`] implementation.

use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    ClientError, ClientResult, ExportLink, ExportRequest, ExportStatus, FeltApi, FeltLayer, FeltMap, UploadTarget,
};

pub const DEFAULT_BASE_URL: &str = "https://felt.com/api/v2";

const GEOJSON_MIME: &str = "application/geo+json";

fn http_timeout() -> Duration {
    let secs = std::env::var("TOMBOLA_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Authenticated Felt client. Cheap to clone.
#[derive(Clone)]
pub struct FeltClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for FeltClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeltClient").field("base_url", &self.base_url).field("token", &"<redacted>").finish()
    }
}

impl FeltClient {
    pub fn new(token: impl Into<String>) -> ClientResult<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Fails before any network activity if `token` is blank.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> ClientResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ClientError::Configuration("API token is required".into()));
        }
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Configuration("API base URL is empty".into()));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("tombola/", env!("CARGO_PKG_VERSION")))
            .timeout(http_timeout())
            .build()?;
        Ok(Self { http, base_url, token })
    }

    /// Token from `FELT_API_TOKEN`, base URL from `FELT_API_BASE` (optional).
    pub fn from_env() -> ClientResult<Self> {
        let token = std::env::var("FELT_API_TOKEN").unwrap_or_default();
        let base = std::env::var("FELT_API_BASE").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(token, base)
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    /// Issue an authenticated JSON request against `base_url + path`.
    ///
    /// Query pairs with a `None` value are skipped. A 204 yields `Ok(None)`; any other
    /// 2xx body is decoded into `T`. Non-2xx responses become [`ClientError::Api`]
    /// carrying the status and raw body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        query: &[(&str, Option<&str>)],
    ) -> ClientResult<Option<T>> {
        let t0 = Instant::now();
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json");
        let pairs: Vec<(&str, &str)> = query.iter().filter_map(|(k, v)| v.map(|v| (*k, v))).collect();
        if !pairs.is_empty() {
            req = req.query(&pairs);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        debug!(method = %method, path = %path, "felt: request start");
        counter!("felt_requests_total", 1u64);
        let res = req.send().await.map_err(|e| {
            counter!("felt_request_errors_total", 1u64);
            ClientError::Transport(e)
        })?;
        let status = res.status();
        histogram!("felt_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if !status.is_success() {
            counter!("felt_request_errors_total", 1u64);
            let text = res.text().await.unwrap_or_default();
            warn!(method = %method, path = %path, status = status.as_u16(), "felt: request failed");
            return Err(ClientError::Api { method: method.to_string(), path: path.to_string(), status: status.as_u16(), body: text });
        }
        if status == StatusCode::NO_CONTENT {
            debug!(method = %method, path = %path, "felt: no content");
            return Ok(None);
        }
        let bytes = res.bytes().await?;
        let value = serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode { path: path.to_string(), source })?;
        debug!(method = %method, path = %path, bytes = bytes.len(), took_ms = %t0.elapsed().as_millis(), "felt: request ok");
        Ok(Some(value))
    }

    /// Like [`request`](Self::request) but a 204 is an error.
    async fn request_some<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> ClientResult<T> {
        self.request(method.clone(), path, body, &[])
            .await?
            .ok_or_else(|| ClientError::EmptyResponse { method: method.to_string(), path: path.to_string() })
    }
}

#[async_trait::async_trait]
impl FeltApi for FeltClient {
    async fn create_map(&self, title: Option<&str>) -> ClientResult<FeltMap> {
        let body = match title {
            Some(t) => json!({ "title": t }),
            None => json!({}),
        };
        let map: FeltMap = self.request_some(Method::POST, "/maps", Some(&body)).await?;
        info!(map_id = %map.id, "felt: map created");
        Ok(map)
    }

    async fn get_layer(&self, map_id: &str, layer_id: &str) -> ClientResult<FeltLayer> {
        self.request_some(Method::GET, &format!("/maps/{}/layers/{}", map_id, layer_id), None).await
    }

    async fn get_export_link(&self, map_id: &str, layer_id: &str) -> ClientResult<ExportLink> {
        self.request_some(Method::GET, &format!("/maps/{}/layers/{}/get_export_link", map_id, layer_id), None).await
    }

    async fn create_custom_export(&self, map_id: &str, layer_id: &str, output_format: &str) -> ClientResult<ExportRequest> {
        let body = json!({ "output_format": output_format });
        let path = format!("/maps/{}/layers/{}/custom_export", map_id, layer_id);
        let req: ExportRequest = self.request_some(Method::POST, &path, Some(&body)).await?;
        info!(map_id = %map_id, layer_id = %layer_id, export_id = %req.export_request_id, "felt: export requested");
        Ok(req)
    }

    async fn custom_export_status(&self, map_id: &str, layer_id: &str, export_id: &str) -> ClientResult<ExportStatus> {
        let path = format!("/maps/{}/layers/{}/custom_exports/{}", map_id, layer_id, export_id);
        self.request_some(Method::GET, &path, None).await
    }

    async fn request_upload(&self, map_id: &str, name: &str) -> ClientResult<UploadTarget> {
        let body = json!({ "name": name });
        self.request_some(Method::POST, &format!("/maps/{}/upload", map_id), Some(&body)).await
    }

    async fn post_presigned(&self, target: &UploadTarget, file_name: &str, payload: Bytes) -> ClientResult<()> {
        let t0 = Instant::now();
        let size = payload.len();
        let mut form = Form::new();
        for (k, v) in &target.presigned_attributes {
            form = form.text(k.clone(), v.clone());
        }
        // Storage expects the file after every policy field.
        let part = Part::bytes(payload.to_vec()).file_name(file_name.to_string()).mime_str(GEOJSON_MIME)?;
        form = form.part("file", part);
        let res = self.http.post(&target.url).multipart(form).send().await?;
        let status = res.status();
        if !status.is_success() && status != StatusCode::NO_CONTENT {
            counter!("felt_upload_errors_total", 1u64);
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), layer_id = %target.layer_id, "felt: presigned upload rejected");
            return Err(ClientError::UploadTransport { status: status.as_u16(), body });
        }
        counter!("felt_uploads_total", 1u64);
        histogram!("felt_upload_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(layer_id = %target.layer_id, bytes = size, took_ms = %t0.elapsed().as_millis(), "felt: file uploaded");
        Ok(())
    }

    async fn download(&self, url: &str) -> ClientResult<Bytes> {
        let t0 = Instant::now();
        let res = self.http.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "felt: export download failed");
            return Err(ClientError::Download { status: status.as_u16() });
        }
        let bytes = res.bytes().await?;
        info!(bytes = bytes.len(), took_ms = %t0.elapsed().as_millis(), "felt: export downloaded");
        Ok(bytes)
    }
}
