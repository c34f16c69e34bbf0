#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Notify};
use tombola_client::mock::MockFelt;
use tombola_client::{ExportStatus, FeltApi, JobState};
use tombola_core::{Feature, FeatureCollection, PipelineStatus, SourceLayer};
use tombola_pipeline::{CreatedLayers, MapWidget, Pipeline, PipelineConfig, PipelineError, WidgetLayer};

fn archive(n: usize) -> Vec<u8> {
    let fc = FeatureCollection::new(
        (0..n).map(|i| Feature::new(serde_json::json!({"type": "Point", "coordinates": [i, 0]}), serde_json::json!({ "n": i }))).collect(),
    );
    let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
    w.start_file("layer.geojson", zip::write::FileOptions::default()).unwrap();
    w.write_all(serde_json::to_string(&fc).unwrap().as_bytes()).unwrap();
    w.finish().unwrap().into_inner()
}

/// Records widget calls; run `n` creates layers `hl-n-0` and `hl-n-1`.
#[derive(Default)]
struct RecordingWidget {
    events: Mutex<Vec<String>>,
    runs: Mutex<usize>,
    fail_delete: HashSet<String>,
    fail_create: bool,
}

impl RecordingWidget {
    fn events(&self) -> Vec<String> { self.events.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl MapWidget for RecordingWidget {
    async fn create_layers_from_geojson(&self, name: &str, data: &FeatureCollection) -> anyhow::Result<Option<CreatedLayers>> {
        self.events.lock().unwrap().push(format!("create {} ({})", name, data.len()));
        if self.fail_create {
            anyhow::bail!("widget detached");
        }
        let run = {
            let mut runs = self.runs.lock().unwrap();
            *runs += 1;
            *runs
        };
        Ok(Some(CreatedLayers {
            layers: (0..2).map(|i| WidgetLayer { id: format!("hl-{}-{}", run, i) }).collect(),
        }))
    }

    async fn delete_layer(&self, id: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("delete {}", id));
        if self.fail_delete.contains(id) {
            anyhow::bail!("layer {} not found", id);
        }
        Ok(())
    }
}

fn pipeline(api: Arc<MockFelt>) -> Pipeline {
    Pipeline::new(api as Arc<dyn FeltApi>, PipelineConfig::new(SourceLayer::new("src-map", "src-layer")))
}

fn drain(rx: &mut broadcast::Receiver<PipelineStatus>) -> Vec<PipelineStatus> {
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
        out.push(s);
    }
    out
}

fn step_names(statuses: &[PipelineStatus]) -> Vec<&'static str> {
    statuses
        .iter()
        .map(|s| match s {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Exporting => "exporting",
            PipelineStatus::Randomizing => "randomizing",
            PipelineStatus::Highlighting => "highlighting",
            PipelineStatus::CreatingMap => "creating_map",
            PipelineStatus::Uploading => "uploading",
            PipelineStatus::Done { .. } => "done",
            PipelineStatus::Error { .. } => "error",
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn successful_run_walks_every_state() {
    let api = Arc::new(MockFelt::new().with_archive(archive(50)));
    let widget = Arc::new(RecordingWidget::default());
    let p = pipeline(api.clone()).with_widget(widget.clone());
    assert_eq!(p.status(), PipelineStatus::Idle);
    let mut rx = p.transitions();

    let outcome = p.run(10.0).await.unwrap();
    assert_eq!(outcome.selected, 5);
    assert_eq!(outcome.total, 50);

    let seen = drain(&mut rx);
    assert_eq!(step_names(&seen), vec!["exporting", "randomizing", "highlighting", "creating_map", "uploading", "done"]);
    match p.status() {
        PipelineStatus::Done { result, selected, total } => {
            assert_eq!((selected, total), (5, 50));
            assert_eq!(result.map_id, "new-map");
            assert_eq!(result.layer_id, "new-layer");
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(widget.events(), vec!["create Random 10% selection (5)".to_string()]);
    assert_eq!(p.highlight_layers().ids(), ["hl-1-0".to_string(), "hl-1-1".to_string()]);
    assert_eq!(api.uploads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_export_goes_straight_to_error() {
    let api = Arc::new(
        MockFelt::new().with_export_statuses(vec![ExportStatus { status: JobState::Failed, download_url: None }]),
    );
    let widget = Arc::new(RecordingWidget::default());
    let p = pipeline(api.clone()).with_widget(widget.clone());
    let mut rx = p.transitions();

    let err = p.run(10.0).await.unwrap_err();
    assert!(matches!(err, PipelineError::Export(_)));
    let seen = drain(&mut rx);
    assert_eq!(step_names(&seen), vec!["exporting", "error"]);
    match p.status() {
        PipelineStatus::Error { message } => assert!(message.contains("export-1"), "{}", message),
        other => panic!("unexpected status {:?}", other),
    }
    assert!(widget.events().is_empty());
    assert_eq!(api.count("POST /maps"), 1); // only the custom_export request
    assert_eq!(api.count("POST /maps/src-map/layers/src-layer/custom_export"), 1);
}

#[tokio::test(start_paused = true)]
async fn second_run_clears_previous_highlights_first_even_if_a_delete_fails() {
    let api = Arc::new(MockFelt::new().with_archive(archive(20)));
    let widget = Arc::new(RecordingWidget { fail_delete: HashSet::from(["hl-1-0".to_string()]), ..Default::default() });
    let p = pipeline(api.clone()).with_widget(widget.clone());

    p.run(10.0).await.unwrap();
    let mut rx = p.transitions();
    p.run(25.0).await.unwrap();

    assert_eq!(
        widget.events(),
        vec![
            "create Random 10% selection (2)".to_string(),
            "delete hl-1-0".to_string(),
            "delete hl-1-1".to_string(),
            "create Random 25% selection (5)".to_string(),
        ]
    );
    assert_eq!(p.highlight_layers().ids(), ["hl-2-0".to_string(), "hl-2-1".to_string()]);
    // Second run resets from done to idle before exporting again, and reuses the cache.
    assert_eq!(step_names(&drain(&mut rx))[..2], ["idle", "exporting"]);
    assert_eq!(api.count("DOWNLOAD "), 1);
}

#[tokio::test(start_paused = true)]
async fn runs_without_a_widget() {
    let api = Arc::new(MockFelt::new().with_archive(archive(3)));
    let p = pipeline(api.clone());
    let outcome = p.run(1.0).await.unwrap();
    assert_eq!(outcome.selected, 1);
    assert_eq!(outcome.total, 3);
    assert!(p.highlight_layers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn widget_failure_is_a_run_error_and_skips_publish() {
    let api = Arc::new(MockFelt::new().with_archive(archive(10)));
    let widget = Arc::new(RecordingWidget { fail_create: true, ..Default::default() });
    let p = pipeline(api.clone()).with_widget(widget);
    let err = p.run(50.0).await.unwrap_err();
    assert!(matches!(err, PipelineError::Widget(_)));
    assert!(matches!(p.status(), PipelineStatus::Error { ref message } if message.contains("widget detached")));
    assert_eq!(api.count("POST /maps/new-map"), 0);
    assert!(!api.calls().iter().any(|c| c == "POST /maps"));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_percentage_is_reported() {
    let api = Arc::new(MockFelt::new().with_archive(archive(10)));
    let p = pipeline(api);
    let err = p.run(0.0).await.unwrap_err();
    assert!(matches!(err, PipelineError::Sample(_)));
    assert!(matches!(p.status(), PipelineStatus::Error { .. }));
}

/// Blocks inside `create_layers_from_geojson` until released.
struct GatedWidget {
    gate: Notify,
}

#[async_trait::async_trait]
impl MapWidget for GatedWidget {
    async fn create_layers_from_geojson(&self, _name: &str, _data: &FeatureCollection) -> anyhow::Result<Option<CreatedLayers>> {
        self.gate.notified().await;
        Ok(None)
    }

    async fn delete_layer(&self, _id: &str) -> anyhow::Result<()> { Ok(()) }
}

#[tokio::test(start_paused = true)]
async fn concurrent_run_is_rejected_while_busy() {
    let api = Arc::new(MockFelt::new().with_archive(archive(10)));
    let widget = Arc::new(GatedWidget { gate: Notify::new() });
    let p = pipeline(api.clone()).with_widget(widget.clone());

    let (first, second) = tokio::join!(p.run(10.0), async {
        tokio::task::yield_now().await;
        assert!(p.is_busy());
        assert_eq!(p.status(), PipelineStatus::Highlighting);
        let second = p.run(10.0).await;
        assert_eq!(p.status(), PipelineStatus::Highlighting);
        widget.gate.notify_one();
        second
    });
    assert!(first.is_ok());
    assert!(matches!(second, Err(PipelineError::Busy)));
    assert!(!p.is_busy());
    assert_eq!(api.count("DOWNLOAD "), 1);
}
