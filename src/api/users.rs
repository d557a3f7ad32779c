use crate::calendar;
use crate::error::AppError;
use crate::hub::ServerEvent;
use crate::models::{TaskView, User, UserListEntry, UserProfile};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserEdit {
    pub name: Option<String>,
    pub avatar: Option<String>,
}

/// Notification settings. Every field is replaced: a missing flag means
/// "on", a missing email clears it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSettings {
    pub email: Option<String>,
    pub notify_on_assign: Option<bool>,
    pub notify_on_complete: Option<bool>,
    pub notify_on_comment: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminFlag {
    pub is_admin: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    pub export_date: DateTime<Utc>,
    pub total_tasks: usize,
    pub tasks: Vec<TaskView>,
}

// GET /api/users
pub async fn list_users(State(state): State<SharedState>) -> Json<Vec<UserListEntry>> {
    Json(state.read().user_list())
}

// POST /api/users
pub async fn create_user(
    State(state): State<SharedState>,
    Json(payload): Json<NewUser>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Name is required"));
    }

    let profile = {
        let mut world = state.write();
        if let Some(existing) = world.user_by_name(name) {
            return Ok((StatusCode::OK, Json(existing.profile())));
        }
        let avatar = payload.avatar.filter(|a| !a.is_empty());
        let profile = world.insert_user(User::new(name, avatar, Utc::now()))?.profile();
        state.commit(&mut world)?;
        profile
    };

    tracing::info!(user_id = %profile.id, name = %profile.name, "user created");
    state.hub.publish(ServerEvent::UsersUpdated);
    Ok((StatusCode::CREATED, Json(profile)))
}

// GET /api/users/:id
pub async fn get_user(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.read().user(id)?.profile()))
}

// PATCH /api/users/:id
pub async fn update_user(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UserEdit>,
) -> Result<Json<UserProfile>, AppError> {
    let name = payload.name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return Err(AppError::validation("Name cannot be empty"));
    }

    let profile = {
        let mut world = state.write();
        let profile = world
            .modify_user(id, |user| {
                if let Some(name) = name {
                    user.name = name.to_string();
                }
                if let Some(avatar) = payload.avatar {
                    user.avatar = Some(avatar);
                }
            })?
            .profile();
        state.commit(&mut world)?;
        profile
    };

    state.hub.publish(ServerEvent::UsersUpdated);
    Ok(Json(profile))
}

// PATCH /api/users/:id/settings
pub async fn update_settings(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UserSettings>,
) -> Result<Json<UserProfile>, AppError> {
    let email = payload
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());

    let mut world = state.write();
    let profile = world
        .modify_user(id, |user| {
            user.email = email;
            user.notify_on_assign = payload.notify_on_assign.unwrap_or(true);
            user.notify_on_complete = payload.notify_on_complete.unwrap_or(true);
            user.notify_on_comment = payload.notify_on_comment.unwrap_or(true);
        })?
        .profile();
    state.commit(&mut world)?;
    Ok(Json(profile))
}

// PATCH /api/users/:id/admin
pub async fn set_admin(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdminFlag>,
) -> Result<Json<UserProfile>, AppError> {
    let profile = {
        let mut world = state.write();
        let profile = world
            .modify_user(id, |user| user.is_admin = payload.is_admin)?
            .profile();
        state.commit(&mut world)?;
        profile
    };

    tracing::info!(user_id = %id, is_admin = profile.is_admin, "admin flag set");
    state.hub.publish(ServerEvent::UsersUpdated);
    Ok(Json(profile))
}

// DELETE /api/users/:id
pub async fn delete_user(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let (removed, detached) = {
        let mut world = state.write();
        let removed = world.remove_user(id)?;
        state.commit(&mut world)?;
        let detached: Vec<TaskView> = removed
            .detached_tasks
            .iter()
            .filter_map(|task_id| world.task_view_by_id(*task_id).ok())
            .collect();
        (removed, detached)
    };

    tracing::info!(user_id = %id, name = %removed.user.name, detached = detached.len(), "user deleted");
    state.hub.publish(ServerEvent::UsersUpdated);
    for view in detached {
        state.hub.publish(ServerEvent::TaskUpdated(view));
    }
    if removed.user.is_online {
        let online = state.read().online_users();
        state.hub.publish(ServerEvent::UsersOnline(online));
    }
    Ok(StatusCode::NO_CONTENT)
}

// GET /api/users/export
pub async fn export(State(state): State<SharedState>) -> Json<Export> {
    let world = state.read();
    let mut tasks: Vec<TaskView> = world.tasks.values().map(|t| world.task_view(t)).collect();
    tasks.sort_by(|a, b| b.task.created_at.cmp(&a.task.created_at));
    Json(Export {
        export_date: Utc::now(),
        total_tasks: tasks.len(),
        tasks,
    })
}

// GET /api/users/:id/tasks.ics
pub async fn calendar(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let body = {
        let world = state.read();
        let user = world.user(id)?;
        calendar::export_user_tasks(&world, user, &state.settings.client_url, Utc::now())
    };
    Ok((
        [
            (header::CONTENT_TYPE, "text/calendar; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"tasks.ics\""),
        ],
        body,
    ))
}
