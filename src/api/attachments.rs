use crate::error::AppError;
use crate::hub::ServerEvent;
use crate::models::{Attachment, AttachmentView};
use crate::state::{AppState, SharedState};
use crate::storage::{check_size, StoredFile};
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

/// The parts of an upload form we care about.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Option<Vec<u8>>,
    pub uploader_id: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart, max: usize) -> Result<Self, AppError> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await? {
            match field.name() {
                Some("file") => {
                    form.file_name = field.file_name().map(str::to_string);
                    form.content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await?;
                    check_size(bytes.len(), max)?;
                    form.bytes = Some(bytes.to_vec());
                }
                Some("uploaderId") => form.uploader_id = Some(field.text().await?),
                _ => {}
            }
        }
        Ok(form)
    }
}

/// Record a stored file against a task. The stored object is removed again
/// if the row can't be written.
async fn attach(
    state: &AppState,
    task_id: Uuid,
    uploader_id: Uuid,
    file_name: String,
    content_type: String,
    stored: StoredFile,
) -> Result<AttachmentView, AppError> {
    let attachment = Attachment {
        id: Uuid::new_v4(),
        task_id,
        uploader_id: Some(uploader_id),
        file_name,
        file_type: content_type,
        file_size: stored.size,
        url: stored.url,
        external_id: stored.external_id.clone(),
        created_at: Utc::now(),
    };

    let inserted = {
        let mut world = state.write();
        world
            .insert_attachment(attachment)
            .map_err(AppError::from)
            .and_then(|view| state.commit(&mut world).map(|()| view))
    };

    match inserted {
        Ok(view) => Ok(view),
        Err(e) => {
            if let Err(cleanup) = state.files.delete(&stored.external_id).await {
                tracing::warn!(external_id = %stored.external_id, error = %cleanup, "orphaned stored file");
            }
            Err(e)
        }
    }
}

// POST /api/attachments/:task_id
pub async fn upload(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<AttachmentView>), AppError> {
    let form = UploadForm::read(multipart, state.settings.max_upload_bytes).await?;
    let Some(bytes) = form.bytes else {
        return Err(AppError::validation("No file uploaded"));
    };
    let uploader_id = form
        .uploader_id
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::validation("Uploader ID is required"))?;
    let uploader_id: Uuid = uploader_id
        .parse()
        .map_err(|_| AppError::validation("Uploader ID is not a valid id"))?;

    {
        let world = state.read();
        world.task(task_id)?;
        world.user(uploader_id)?;
    }

    let file_name = form.file_name.unwrap_or_else(|| "file".to_string());
    let content_type = form
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let stored = state.files.put(&file_name, &content_type, bytes).await?;
    let view = attach(&state, task_id, uploader_id, file_name, content_type, stored).await?;

    tracing::info!(%task_id, attachment_id = %view.attachment.id, bytes = view.attachment.file_size, "attachment uploaded");
    state.hub.publish(ServerEvent::AttachmentCreated {
        task_id,
        attachment: view.clone(),
    });
    Ok((StatusCode::CREATED, Json(view)))
}

// GET /api/attachments/:task_id
pub async fn list(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
) -> Json<Vec<AttachmentView>> {
    Json(state.read().attachments_for(task_id))
}

// DELETE /api/attachments/file/:id
pub async fn remove(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let external_id = state
        .read()
        .attachments
        .get(&id)
        .map(|a| a.external_id.clone())
        .ok_or(AppError::NotFound("Attachment"))?;

    if let Err(e) = state.files.delete(&external_id).await {
        tracing::warn!(attachment_id = %id, error = %e, "stored file not deleted");
    }

    {
        let mut world = state.write();
        world.remove_attachment(id)?;
        state.commit(&mut world)?;
    }

    tracing::info!(attachment_id = %id, "attachment deleted");
    state.hub.publish(ServerEvent::AttachmentDeleted { attachment_id: id });
    Ok(Json(json!({ "success": true })))
}
