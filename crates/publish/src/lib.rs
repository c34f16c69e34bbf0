//! Tombola publish: turn a feature collection into a brand-new Felt map.
//!
//! Create map, upload the collection as GeoJSON, wait for the layer to process.
//! Nothing is rolled back on failure; a map created before a failed upload stays.

#![forbid(unsafe_code)]

use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tombola_client::{upload_file, wait_for_layer, ClientError, FeltApi, PollOptions};
use tombola_core::{FeatureCollection, PublishedMap};
use tracing::{info, warn};

/// File name the sample is uploaded under.
pub const UPLOAD_FILE_NAME: &str = "randomized-selection.geojson";

/// Progress reported while publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    CreatingMap,
    Uploading,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("serializing feature collection: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type PublishResult<T> = Result<T, PublishError>;

pub async fn publish<A: FeltApi + ?Sized>(
    api: &A,
    fc: &FeatureCollection,
    title: &str,
    opts: PollOptions,
) -> PublishResult<PublishedMap> {
    publish_with_progress(api, fc, title, opts, |_| {}).await
}

/// [`publish`], calling `on_stage` as each stage begins.
pub async fn publish_with_progress<A, F>(
    api: &A,
    fc: &FeatureCollection,
    title: &str,
    opts: PollOptions,
    mut on_stage: F,
) -> PublishResult<PublishedMap>
where
    A: FeltApi + ?Sized,
    F: FnMut(PublishStage) + Send,
{
    let t0 = Instant::now();
    counter!("publish_attempts_total", 1u64);
    on_stage(PublishStage::CreatingMap);
    let map = api.create_map(Some(title)).await.map_err(|e| {
        counter!("publish_errors_total", 1u64);
        PublishError::from(e)
    })?;
    info!(map_id = %map.id, title = %title, "publish: map created");

    on_stage(PublishStage::Uploading);
    let payload = Bytes::from(serde_json::to_vec(fc)?);
    let sent = payload.len();
    let result = async {
        let upload = upload_file(api, &map.id, UPLOAD_FILE_NAME, payload).await?;
        wait_for_layer(api, &map.id, &upload.layer_id, opts).await?;
        Ok::<_, ClientError>(upload.layer_id)
    }
    .await;
    let layer_id = match result {
        Ok(id) => id,
        Err(e) => {
            counter!("publish_errors_total", 1u64);
            warn!(map_id = %map.id, error = %e, "publish: upload failed; map left in place");
            return Err(e.into());
        }
    };

    histogram!("publish_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(map_id = %map.id, layer_id = %layer_id, features = fc.len(), bytes = sent, took_ms = %t0.elapsed().as_millis(), "publish: ok");
    Ok(PublishedMap { map_url: map.url, map_id: map.id, layer_id })
}
