//! Live-map collaborator used to preview a sample, and the set of preview layers
//! the pipeline currently owns on it.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tombola_core::FeatureCollection;

/// A layer created on the live map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WidgetLayer {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedLayers {
    pub layers: Vec<WidgetLayer>,
}

/// Controller of an embedded map. Embedding itself happens outside this crate.
#[async_trait::async_trait]
pub trait MapWidget: Send + Sync {
    /// Render `data` as new overlay layer(s) named `name`. `None` means the widget
    /// accepted the request but reported no layers.
    async fn create_layers_from_geojson(&self, name: &str, data: &FeatureCollection) -> anyhow::Result<Option<CreatedLayers>>;

    /// Remove a layer. May fail if it is already gone.
    async fn delete_layer(&self, id: &str) -> anyhow::Result<()>;
}

/// Ordered layer ids previewing the current sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighlightLayerSet {
    ids: SmallVec<[String; 4]>,
}

impl HighlightLayerSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_created(created: &CreatedLayers) -> Self {
        Self { ids: created.layers.iter().map(|l| l.id.clone()).collect() }
    }

    pub fn ids(&self) -> &[String] { &self.ids }
    pub fn len(&self) -> usize { self.ids.len() }
    pub fn is_empty(&self) -> bool { self.ids.is_empty() }

    /// Empty the set, handing back what it held.
    pub fn take(&mut self) -> HighlightLayerSet { std::mem::take(self) }
}

impl IntoIterator for HighlightLayerSet {
    type Item = String;
    type IntoIter = smallvec::IntoIter<[String; 4]>;
    fn into_iter(self) -> Self::IntoIter { self.ids.into_iter() }
}
