//! Tombola export: materialise a layer as a [`FeatureCollection`] and memoise it.

#![forbid(unsafe_code)]

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tombola_client::{wait_for_export, ClientError, FeltApi, PollOptions};
use tombola_core::{FeatureCollection, SourceLayer};
use tracing::{debug, info};

/// Output format requested from the custom export endpoint.
pub const EXPORT_FORMAT: &str = "geojson";
/// Extension of the archive member holding the exported collection.
pub const GEOJSON_EXT: &str = ".geojson";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no .geojson file found in export archive ({members} members)")]
    ArchiveFormat { members: usize },
    #[error("reading export archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("reading archive member {name}: {source}")]
    Member { name: String, #[source] source: std::io::Error },
    #[error("parsing {name} as a FeatureCollection: {source}")]
    Parse { name: String, #[source] source: serde_json::Error },
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Decode the first `.geojson` member (central directory order) of a zip archive.
/// Other members are only looked up by name, never decompressed.
pub fn decode_archive(bytes: &[u8]) -> ExportResult<FeatureCollection> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut found = None;
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if !entry.is_dir() && entry.name().ends_with(GEOJSON_EXT) {
            found = Some(i);
            break;
        }
    }
    let idx = found.ok_or(ExportError::ArchiveFormat { members: archive.len() })?;
    let mut entry = archive.by_index(idx)?;
    let name = entry.name().to_string();
    let mut text = String::with_capacity(entry.size() as usize);
    entry
        .read_to_string(&mut text)
        .map_err(|source| ExportError::Member { name: name.clone(), source })?;
    debug!(member = %name, bytes = text.len(), "export: archive member read");
    serde_json::from_str(&text).map_err(|source| ExportError::Parse { name, source })
}

/// Request a GeoJSON export of `source`, wait for it, download and decode the archive.
pub async fn export_layer<A: FeltApi + ?Sized>(
    api: &A,
    source: &SourceLayer,
    opts: PollOptions,
) -> ExportResult<FeatureCollection> {
    let t0 = Instant::now();
    info!(source = %source, "export: start");
    let req = api.create_custom_export(&source.map_id, &source.layer_id, EXPORT_FORMAT).await?;
    let url = wait_for_export(api, &source.map_id, &source.layer_id, &req.export_request_id, opts).await?;
    let archive = api.download(&url).await?;
    let fc = decode_archive(&archive)?;
    histogram!("export_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(source = %source, features = fc.len(), took_ms = %t0.elapsed().as_millis(), "export: ok");
    Ok(fc)
}

struct Cached {
    source: SourceLayer,
    data: Arc<FeatureCollection>,
}

/// Holds at most one exported collection, keyed by its source layer.
///
/// The slot lock is held while an export runs, so concurrent callers wait for a single
/// export. Asking for a different source replaces the slot.
#[derive(Default)]
pub struct ExportCache {
    slot: Mutex<Option<Cached>>,
}

impl ExportCache {
    pub fn new() -> Self { Self::default() }

    /// Cached collection for `source`, exporting it first if the slot holds anything else.
    pub async fn get_or_export<A: FeltApi + ?Sized>(
        &self,
        api: &A,
        source: &SourceLayer,
        opts: PollOptions,
    ) -> ExportResult<Arc<FeatureCollection>> {
        let mut slot = self.slot.lock().await;
        if let Some(c) = slot.as_ref() {
            if c.source == *source {
                counter!("export_cache_hits_total", 1u64);
                debug!(source = %source, features = c.data.len(), "export cache: hit");
                return Ok(Arc::clone(&c.data));
            }
            info!(cached = %c.source, requested = %source, "export cache: source changed, replacing");
        }
        counter!("export_cache_misses_total", 1u64);
        let data = Arc::new(export_layer(api, source, opts).await?);
        *slot = Some(Cached { source: source.clone(), data: Arc::clone(&data) });
        Ok(data)
    }

    /// Cached collection for `source`, without any network activity.
    pub async fn cached(&self, source: &SourceLayer) -> Option<Arc<FeatureCollection>> {
        let slot = self.slot.lock().await;
        slot.as_ref().filter(|c| c.source == *source).map(|c| Arc::clone(&c.data))
    }

    /// Drop the cached collection. Returns whether anything was cached.
    pub async fn invalidate(&self) -> bool {
        let dropped = self.slot.lock().await.take();
        if let Some(c) = &dropped {
            info!(source = %c.source, "export cache: invalidated");
        }
        dropped.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_an_archive_error() {
        assert!(matches!(decode_archive(b"not a zip"), Err(ExportError::Archive(_))));
    }
}
