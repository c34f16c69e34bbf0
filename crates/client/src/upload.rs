//! Two-step presigned upload: ask Felt for credentials, then push bytes to storage.

use bytes::Bytes;
use tracing::info;

use crate::{ClientResult, FeltApi, UploadTarget};

/// Request upload credentials for `map_id` and post `payload` to the returned storage URL.
///
/// The steps are not atomic: if the storage post fails, the credentials (and the
/// pre-assigned layer id) are simply abandoned. No retry happens here.
pub async fn upload_file<A: FeltApi + ?Sized>(
    api: &A,
    map_id: &str,
    file_name: &str,
    payload: Bytes,
) -> ClientResult<UploadTarget> {
    let target = api.request_upload(map_id, file_name).await?;
    info!(map_id = %map_id, layer_id = %target.layer_id, fields = target.presigned_attributes.len(), "upload: credentials issued");
    api.post_presigned(&target, file_name, payload).await?;
    Ok(target)
}
