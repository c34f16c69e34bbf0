//! Tombola core types: GeoJSON features, source/published map references and the
//! pipeline status union. Everything here is plain data; no I/O.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod sample;

pub use sample::{sample, sample_with, selection_count, SampleError};

/// GeoJSON type tag for a single feature.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeatureTag {
    #[default]
    Feature,
}

/// GeoJSON type tag for a feature collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectionTag {
    #[default]
    FeatureCollection,
}

/// A geographic record. Geometry, properties, `bbox` and any foreign members are
/// carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub tag: FeatureTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<serde_json::Value>,
    #[serde(default)]
    pub geometry: serde_json::Value,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    pub fn new(geometry: serde_json::Value, properties: serde_json::Value) -> Self {
        Self { tag: FeatureTag::Feature, id: None, bbox: None, geometry, properties, extra: serde_json::Map::new() }
    }
}

/// Ordered group of features.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type", default)]
    pub tag: CollectionTag,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { tag: CollectionTag::FeatureCollection, features }
    }

    pub fn len(&self) -> usize { self.features.len() }
    pub fn is_empty(&self) -> bool { self.features.is_empty() }
}

/// Identifies the layer a run exports from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceLayer {
    pub map_id: String,
    pub layer_id: String,
}

impl SourceLayer {
    pub fn new(map_id: impl Into<String>, layer_id: impl Into<String>) -> Self {
        Self { map_id: map_id.into(), layer_id: layer_id.into() }
    }
}

impl std::fmt::Display for SourceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.map_id, self.layer_id)
    }
}

/// Result of publishing a sample as a new map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedMap {
    pub map_url: String,
    pub map_id: String,
    pub layer_id: String,
}

/// Externally observable progress of a pipeline run. Exactly one value is current.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Exporting,
    Randomizing,
    Highlighting,
    CreatingMap,
    Uploading,
    Done { result: PublishedMap, selected: usize, total: usize },
    Error { message: String },
}

impl PipelineStatus {
    /// `done` and `error` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Done { .. } | PipelineStatus::Error { .. })
    }

    /// True while a run is between its first step and a terminal state.
    pub fn is_busy(&self) -> bool {
        !self.is_terminal() && *self != PipelineStatus::Idle
    }

    /// Short operator-facing description of the phase.
    pub fn describe(&self) -> String {
        match self {
            PipelineStatus::Idle => "idle".into(),
            PipelineStatus::Exporting => "Exporting layer data...".into(),
            PipelineStatus::Randomizing => "Selecting random features...".into(),
            PipelineStatus::Highlighting => "Highlighting on map...".into(),
            PipelineStatus::CreatingMap => "Creating new map...".into(),
            PipelineStatus::Uploading => "Uploading selection...".into(),
            PipelineStatus::Done { result, selected, total } => {
                format!("Selected {} of {} features: {}", selected, total, result.map_url)
            }
            PipelineStatus::Error { message } => format!("Error: {}", message),
        }
    }
}

pub mod prelude {
    pub use super::{Feature, FeatureCollection, PipelineStatus, PublishedMap, SourceLayer};
}
