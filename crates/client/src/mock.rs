//! Scripted in-memory [`FeltApi`] for tests. Records every call as `"METHOD path"`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use crate::{
    ClientError, ClientResult, ExportLink, ExportRequest, ExportStatus, FeltApi, FeltLayer, FeltMap, JobState,
    UploadTarget,
};

pub const MOCK_DOWNLOAD_URL: &str = "https://exports.example/archive.zip";
pub const MOCK_STORAGE_URL: &str = "https://storage.example/upload";

struct MockState {
    export_statuses: VecDeque<ExportStatus>,
    layer_statuses: VecDeque<JobState>,
    archive: Bytes,
    map: FeltMap,
    upload: UploadTarget,
    fail_create_map: Option<u16>,
    fail_upload: Option<u16>,
    calls: Vec<String>,
    uploads: Vec<(String, Bytes)>,
}

/// Pops scripted responses front-first; the last one repeats forever.
fn next<T: Clone>(q: &mut VecDeque<T>) -> Option<T> {
    if q.len() > 1 { q.pop_front() } else { q.front().cloned() }
}

pub struct MockFelt {
    state: Mutex<MockState>,
}

impl Default for MockFelt {
    fn default() -> Self {
        let mut presigned = BTreeMap::new();
        presigned.insert("key".to_string(), "uploads/randomized-selection.geojson".to_string());
        presigned.insert("policy".to_string(), "eyJ0ZXN0Ijp0cnVlfQ==".to_string());
        Self {
            state: Mutex::new(MockState {
                export_statuses: VecDeque::from(vec![ExportStatus {
                    status: JobState::Completed,
                    download_url: Some(MOCK_DOWNLOAD_URL.to_string()),
                }]),
                layer_statuses: VecDeque::from(vec![JobState::Completed]),
                archive: Bytes::new(),
                map: FeltMap { id: "new-map".into(), title: String::new(), url: "https://felt.com/map/new-map".into() },
                upload: UploadTarget {
                    layer_id: "new-layer".into(),
                    layer_group_id: "new-group".into(),
                    url: MOCK_STORAGE_URL.into(),
                    presigned_attributes: presigned,
                },
                fail_create_map: None,
                fail_upload: None,
                calls: Vec::new(),
                uploads: Vec::new(),
            }),
        }
    }
}

impl MockFelt {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&mut self) -> &mut MockState {
        self.state.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_export_statuses(mut self, statuses: Vec<ExportStatus>) -> Self {
        self.state_mut().export_statuses = statuses.into();
        self
    }

    pub fn with_layer_statuses(mut self, statuses: Vec<JobState>) -> Self {
        self.state_mut().layer_statuses = statuses.into();
        self
    }

    /// Bytes served by [`FeltApi::download`].
    pub fn with_archive(mut self, archive: impl Into<Bytes>) -> Self {
        self.state_mut().archive = archive.into();
        self
    }

    pub fn failing_create_map(mut self, status: u16) -> Self {
        self.state_mut().fail_create_map = Some(status);
        self
    }

    /// Make the storage post answer with `status`.
    pub fn failing_upload(mut self, status: u16) -> Self {
        self.state_mut().fail_upload = Some(status);
        self
    }

    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// `(file_name, payload)` for every accepted storage post.
    pub fn uploads(&self) -> Vec<(String, Bytes)> { self.lock().uploads.clone() }

    fn record(&self, call: String) -> MutexGuard<'_, MockState> {
        let mut st = self.lock();
        st.calls.push(call);
        st
    }
}

#[async_trait::async_trait]
impl FeltApi for MockFelt {
    async fn create_map(&self, title: Option<&str>) -> ClientResult<FeltMap> {
        let st = self.record("POST /maps".to_string());
        if let Some(status) = st.fail_create_map {
            return Err(ClientError::Api { method: "POST".into(), path: "/maps".into(), status, body: "{\"error\":\"mock\"}".into() });
        }
        let mut map = st.map.clone();
        map.title = title.unwrap_or_default().to_string();
        Ok(map)
    }

    async fn get_layer(&self, map_id: &str, layer_id: &str) -> ClientResult<FeltLayer> {
        let mut st = self.record(format!("GET /maps/{}/layers/{}", map_id, layer_id));
        let status = next(&mut st.layer_statuses).unwrap_or_default();
        Ok(FeltLayer { id: layer_id.to_string(), name: "randomized-selection".into(), status })
    }

    async fn get_export_link(&self, map_id: &str, layer_id: &str) -> ClientResult<ExportLink> {
        self.record(format!("GET /maps/{}/layers/{}/get_export_link", map_id, layer_id));
        Ok(ExportLink { export_link: MOCK_DOWNLOAD_URL.to_string() })
    }

    async fn create_custom_export(&self, map_id: &str, layer_id: &str, output_format: &str) -> ClientResult<ExportRequest> {
        self.record(format!("POST /maps/{}/layers/{}/custom_export {}", map_id, layer_id, output_format));
        Ok(ExportRequest { export_request_id: "export-1".into() })
    }

    async fn custom_export_status(&self, map_id: &str, layer_id: &str, export_id: &str) -> ClientResult<ExportStatus> {
        let mut st = self.record(format!("GET /maps/{}/layers/{}/custom_exports/{}", map_id, layer_id, export_id));
        Ok(next(&mut st.export_statuses).unwrap_or(ExportStatus { status: JobState::Pending, download_url: None }))
    }

    async fn request_upload(&self, map_id: &str, _name: &str) -> ClientResult<UploadTarget> {
        let st = self.record(format!("POST /maps/{}/upload", map_id));
        Ok(st.upload.clone())
    }

    async fn post_presigned(&self, target: &UploadTarget, file_name: &str, payload: Bytes) -> ClientResult<()> {
        let mut st = self.record(format!("STORAGE {}", target.url));
        if let Some(status) = st.fail_upload {
            return Err(ClientError::UploadTransport { status, body: "AccessDenied".into() });
        }
        st.uploads.push((file_name.to_string(), payload));
        Ok(())
    }

    async fn download(&self, url: &str) -> ClientResult<Bytes> {
        let st = self.record(format!("DOWNLOAD {}", url));
        Ok(st.archive.clone())
    }
}
