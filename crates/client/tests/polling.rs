#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use tombola_client::mock::{MockFelt, MOCK_DOWNLOAD_URL, MOCK_STORAGE_URL};
use tombola_client::{upload_file, wait_for_export, wait_for_layer, ClientError, ExportStatus, JobState, PollOptions};

fn pending() -> ExportStatus { ExportStatus { status: JobState::Pending, download_url: None } }

fn status_calls(api: &MockFelt) -> usize { api.count("GET /maps/m/layers/l/custom_exports/") }

#[tokio::test(start_paused = true)]
async fn export_never_terminal_times_out_after_timeout_over_interval_checks() {
    let api = MockFelt::new().with_export_statuses(vec![pending()]);
    let err = wait_for_export(&api, "m", "l", "ex-9", PollOptions::default()).await.unwrap_err();
    match err {
        ClientError::ExportTimeout { export_id, elapsed_ms } => {
            assert_eq!(export_id, "ex-9");
            assert!(elapsed_ms >= 60_000);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(status_calls(&api), 30);
}

#[tokio::test(start_paused = true)]
async fn export_failure_stops_on_first_check() {
    let api = MockFelt::new().with_export_statuses(vec![ExportStatus { status: JobState::Failed, download_url: None }]);
    let err = wait_for_export(&api, "m", "l", "ex-3", PollOptions::default()).await.unwrap_err();
    assert!(matches!(err, ClientError::ExportFailed { ref export_id } if export_id == "ex-3"));
    assert!(err.to_string().contains("ex-3"));
    assert_eq!(status_calls(&api), 1);
}

#[tokio::test(start_paused = true)]
async fn export_completed_needs_download_url() {
    let api = MockFelt::new().with_export_statuses(vec![
        pending(),
        ExportStatus { status: JobState::Completed, download_url: None },
        ExportStatus { status: JobState::Completed, download_url: Some(MOCK_DOWNLOAD_URL.into()) },
    ]);
    let url = wait_for_export(&api, "m", "l", "ex-1", PollOptions::default()).await.unwrap();
    assert_eq!(url, MOCK_DOWNLOAD_URL);
    assert_eq!(status_calls(&api), 3);
}

#[tokio::test(start_paused = true)]
async fn custom_interval_scales_check_count() {
    let api = MockFelt::new().with_layer_statuses(vec![JobState::Processing]);
    let opts = PollOptions { timeout: Duration::from_millis(1_000), interval: Duration::from_millis(100) };
    let err = wait_for_layer(&api, "m", "new-layer", opts).await.unwrap_err();
    assert!(matches!(err, ClientError::LayerProcessingTimeout { ref layer_id, .. } if layer_id == "new-layer"));
    assert_eq!(api.count("GET /maps/m/layers/new-layer"), 10);
}

#[tokio::test(start_paused = true)]
async fn layer_failure_and_success() {
    let api = MockFelt::new().with_layer_statuses(vec![JobState::Failed]);
    let err = wait_for_layer(&api, "m", "L1", PollOptions::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "layer L1 processing failed");
    assert_eq!(api.count("GET "), 1);

    let api = MockFelt::new().with_layer_statuses(vec![JobState::Pending, JobState::Processing, JobState::Completed]);
    let layer = wait_for_layer(&api, "m", "L2", PollOptions::default()).await.unwrap();
    assert_eq!(layer.id, "L2");
    assert_eq!(layer.status, JobState::Completed);
    assert_eq!(api.count("GET "), 3);
}

#[tokio::test]
async fn upload_requests_credentials_then_posts_to_storage() {
    let api = MockFelt::new();
    let target = upload_file(&api, "m", "sel.geojson", Bytes::from_static(b"{}")).await.unwrap();
    assert_eq!(target.layer_id, "new-layer");
    assert_eq!(api.calls(), vec!["POST /maps/m/upload".to_string(), format!("STORAGE {}", MOCK_STORAGE_URL)]);
    assert_eq!(api.uploads(), vec![("sel.geojson".to_string(), Bytes::from_static(b"{}"))]);
}

#[tokio::test]
async fn upload_storage_rejection_is_fatal() {
    let api = MockFelt::new().failing_upload(403);
    let err = upload_file(&api, "m", "sel.geojson", Bytes::from_static(b"{}")).await.unwrap_err();
    assert!(matches!(err, ClientError::UploadTransport { status: 403, .. }));
    assert!(api.uploads().is_empty());
}
