use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use image::ImageFormat;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::SubmitBatchResponse;
use crate::models::batch::BatchSnapshot;
use crate::models::job::ImageRef;
use crate::models::receipt::ReceiptOverrides;
use crate::models::review::ReviewItem;
use crate::routes::auth::AuthUser;
use crate::routes::error::ApiError;
use crate::services::batch::ActiveBatch;
use crate::services::commit::CommitOutcome;
use crate::services::insights::InsightSummary;
use crate::services::review::ReviewView;
use crate::services::storage::image_key;

/// Detect the upload's format. Only formats the extractor accepts pass.
fn content_type(data: &[u8]) -> Result<&'static str, ApiError> {
    match image::guess_format(data) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => {
            Ok(format.to_mime_type())
        }
        _ => Err(ApiError::UnsupportedMedia),
    }
}

/// Run the batch in the background; progress is observed through snapshots.
fn spawn_run(batch: Arc<ActiveBatch>) {
    tokio::spawn(async move {
        if let Err(e) = batch.run().await {
            tracing::error!(batch_id = %batch.id(), error = %e, "Batch run failed");
        }
    });
}

/// POST /api/v1/batches: upload receipt images and start extraction.
pub async fn submit_batch(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), ApiError> {
    let mut uploads: Vec<(Vec<u8>, &'static str)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let mime = content_type(&data)?;
        uploads.push((data.to_vec(), mime));
    }

    // Checked before anything is uploaded; submit checks again.
    let admission = state.batches.admit(&user_id, uploads.len()).await?;

    let upload_id = Uuid::new_v4();
    let mut images = Vec::with_capacity(uploads.len());
    for (data, mime) in uploads {
        let key = image_key(upload_id, Uuid::new_v4());
        let stored = match state.encryption.seal(&key, &data) {
            Ok(sealed) => state.storage.upload(&key, &sealed).await.map_err(ApiError::from),
            Err(e) => Err(ApiError::from(e)),
        };
        if let Err(e) = stored {
            for image in &images {
                discard_upload(&state, image).await;
            }
            return Err(e);
        }
        images.push(ImageRef::new(key, mime));
    }

    let batch = state.batches.submit(&user_id, images).await?;
    tracing::info!(batch_id = %batch.id(), upload_id = %upload_id, "Batch images stored");
    let snapshot = batch.snapshot().await?;
    spawn_run(Arc::clone(&batch));

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBatchResponse {
            batch_id: batch.id(),
            job_ids: snapshot.jobs.iter().map(|j| j.id).collect(),
            admission,
            snapshot,
        }),
    ))
}

async fn discard_upload(state: &AppState, image: &ImageRef) {
    if let Err(e) = state.storage.delete(&image.key).await {
        tracing::warn!(image_key = %image.key, error = %e, "Failed to remove partial upload");
    }
}

/// GET /api/v1/batches/{id}
pub async fn get_batch(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.snapshot().await?))
}

/// GET /api/v1/batches/{id}/events: server-sent stream of snapshots.
///
/// The first event is the current snapshot. The subscription lives inside
/// the stream and is dropped with it when the client disconnects.
pub async fn batch_events(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = batch.subscribe(move |snapshot| {
        let _ = tx.send(snapshot);
    });
    let current = batch.snapshot().await?;

    let updates = futures::stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
        rx.recv()
            .await
            .map(|snapshot| (snapshot, (rx, subscription)))
    });
    let stream = futures::stream::once(async move { current })
        .chain(updates)
        .map(|snapshot| Event::default().event("snapshot").json_data(snapshot));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/v1/batches/{id}/cancel
pub async fn cancel_batch(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.cancel().await?))
}

/// POST /api/v1/batches/{id}/jobs/{job_id}/retry
pub async fn retry_job(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((batch_id, job_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<BatchSnapshot>), ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    batch.retry(job_id).await?;
    let snapshot = batch.snapshot().await?;
    spawn_run(batch);
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// GET /api/v1/batches/{id}/review
pub async fn get_review(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<ReviewView>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.review_view().await?))
}

/// PATCH /api/v1/batches/{id}/review/{item_id}
pub async fn edit_review_item(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
    Json(overrides): Json<ReceiptOverrides>,
) -> Result<Json<ReviewItem>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.edit(item_id, overrides).await?))
}

/// DELETE /api/v1/batches/{id}/review/{item_id}
pub async fn discard_review_item(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ReviewItem>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.discard(item_id).await?))
}

/// POST /api/v1/batches/{id}/save
pub async fn save_batch(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<CommitOutcome>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.save_all().await?))
}

/// GET /api/v1/batches/{id}/insights
pub async fn get_insights(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<InsightSummary>, ApiError> {
    let batch = state.batches.get(batch_id, &user_id)?;
    Ok(Json(batch.insights()))
}
