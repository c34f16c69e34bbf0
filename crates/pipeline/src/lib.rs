//! Tombola pipeline orchestrator.
//!
//! One run: clear the previous preview layers, export the source layer (cached),
//! sample it, preview the sample on the live map, publish it as a new map. Progress
//! is exposed as a single [`PipelineStatus`] value; only one run may be active.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::{broadcast, watch};
use tombola_client::{FeltApi, PollOptions};
use tombola_core::{FeatureCollection, PipelineStatus, PublishedMap, SampleError, SourceLayer};
use tombola_export::{ExportCache, ExportError};
use tombola_publish::{publish_with_progress, PublishError, PublishStage};
use tracing::{debug, error, info, warn};

pub mod widget;

pub use widget::{CreatedLayers, HighlightLayerSet, MapWidget, WidgetLayer};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("a pipeline run is already in progress")]
    Busy,
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error("highlighting sample: {0:#}")]
    Widget(anyhow::Error),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceLayer,
    pub poll: PollOptions,
}

impl PipelineConfig {
    pub fn new(source: SourceLayer) -> Self {
        Self { source, poll: PollOptions::default() }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub published: PublishedMap,
    pub selected: usize,
    pub total: usize,
}

pub struct Pipeline {
    api: Arc<dyn FeltApi>,
    widget: Option<Arc<dyn MapWidget>>,
    config: PipelineConfig,
    cache: ExportCache,
    highlights: Mutex<HighlightLayerSet>,
    status: watch::Sender<PipelineStatus>,
    transitions: broadcast::Sender<PipelineStatus>,
    run_lock: tokio::sync::Mutex<()>,
}

impl Pipeline {
    pub fn new(api: Arc<dyn FeltApi>, config: PipelineConfig) -> Self {
        let (status, _) = watch::channel(PipelineStatus::Idle);
        let (transitions, _) = broadcast::channel(64);
        Self {
            api,
            widget: None,
            config,
            cache: ExportCache::new(),
            highlights: Mutex::new(HighlightLayerSet::new()),
            status,
            transitions,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach the live-map widget used for previews.
    pub fn with_widget(mut self, widget: Arc<dyn MapWidget>) -> Self {
        self.widget = Some(widget);
        self
    }

    pub fn config(&self) -> &PipelineConfig { &self.config }
    pub fn cache(&self) -> &ExportCache { &self.cache }

    /// Current status.
    pub fn status(&self) -> PipelineStatus { self.status.borrow().clone() }

    /// Latest-value view of the status.
    pub fn watch_status(&self) -> watch::Receiver<PipelineStatus> { self.status.subscribe() }

    /// Every transition, in order, from the moment of subscription.
    pub fn transitions(&self) -> broadcast::Receiver<PipelineStatus> { self.transitions.subscribe() }

    pub fn is_busy(&self) -> bool { self.run_lock.try_lock().is_err() }

    /// Preview layers currently on the map.
    pub fn highlight_layers(&self) -> HighlightLayerSet { self.highlights_guard().clone() }

    fn highlights_guard(&self) -> MutexGuard<'_, HighlightLayerSet> {
        self.highlights.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, next: PipelineStatus) {
        debug!(status = ?next, "pipeline: status");
        self.status.send_replace(next.clone());
        let _ = self.transitions.send(next);
    }

    /// Run the whole pipeline once with `percentage` in (0, 100].
    ///
    /// Returns [`PipelineError::Busy`] without touching the status if a run is active.
    /// Any other failure also leaves the status at `error`.
    pub async fn run(&self, percentage: f64) -> PipelineResult<PipelineOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("pipeline: run rejected, another run is active");
            counter!("pipeline_busy_rejections_total", 1u64);
            return Err(PipelineError::Busy);
        };
        let t0 = Instant::now();
        counter!("pipeline_runs_total", 1u64);
        if self.status.borrow().is_terminal() {
            self.set(PipelineStatus::Idle);
        }
        info!(source = %self.config.source, percentage, "pipeline: run start");
        self.clear_highlights().await;

        match self.steps(percentage).await {
            Ok(outcome) => {
                histogram!("pipeline_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(map_id = %outcome.published.map_id, selected = outcome.selected, total = outcome.total, took_ms = %t0.elapsed().as_millis(), "pipeline: done");
                self.set(PipelineStatus::Done {
                    result: outcome.published.clone(),
                    selected: outcome.selected,
                    total: outcome.total,
                });
                Ok(outcome)
            }
            Err(e) => {
                counter!("pipeline_failures_total", 1u64);
                error!(error = %e, took_ms = %t0.elapsed().as_millis(), "pipeline: failed");
                self.set(PipelineStatus::Error { message: e.to_string() });
                Err(e)
            }
        }
    }

    async fn steps(&self, percentage: f64) -> PipelineResult<PipelineOutcome> {
        self.set(PipelineStatus::Exporting);
        let source = self.cache.get_or_export(self.api.as_ref(), &self.config.source, self.config.poll).await?;

        self.set(PipelineStatus::Randomizing);
        let selected = tombola_core::sample(&source, percentage)?;
        info!(selected = selected.len(), total = source.len(), "pipeline: sample drawn");

        self.set(PipelineStatus::Highlighting);
        self.highlight(percentage, &selected).await?;

        let title = format!("Randomized {}% - {}", percentage, chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        let published = publish_with_progress(self.api.as_ref(), &selected, &title, self.config.poll, |stage| {
            self.set(match stage {
                PublishStage::CreatingMap => PipelineStatus::CreatingMap,
                PublishStage::Uploading => PipelineStatus::Uploading,
            })
        })
        .await?;

        Ok(PipelineOutcome { published, selected: selected.len(), total: source.len() })
    }

    async fn highlight(&self, percentage: f64, selected: &FeatureCollection) -> PipelineResult<()> {
        let Some(widget) = &self.widget else {
            debug!("pipeline: no map widget attached, skipping highlight");
            return Ok(());
        };
        let name = format!("Random {}% selection", percentage);
        let created = widget
            .create_layers_from_geojson(&name, selected)
            .await
            .map_err(PipelineError::Widget)?;
        if let Some(created) = created {
            let set = HighlightLayerSet::from_created(&created);
            info!(layers = set.len(), "pipeline: highlight layers created");
            *self.highlights_guard() = set;
        }
        Ok(())
    }

    /// Best-effort removal of the previous run's preview layers. Delete failures are
    /// logged and discarded; the set is empty afterwards either way.
    async fn clear_highlights(&self) {
        let stale = self.highlights_guard().take();
        if stale.is_empty() {
            return;
        }
        let Some(widget) = &self.widget else { return };
        for id in stale {
            match widget.delete_layer(&id).await {
                Ok(()) => debug!(layer_id = %id, "pipeline: highlight layer deleted"),
                Err(e) => {
                    counter!("pipeline_highlight_delete_errors_total", 1u64);
                    warn!(layer_id = %id, error = %e, "pipeline: highlight delete failed, ignoring");
                }
            }
        }
    }
}
