use crate::error::AppError;
use crate::lifecycle::{self, Claim, NewComment, NewTask, TaskPatch, Visibility, VisibilityView};
use crate::models::{AuditView, CommentView, TaskView};
use crate::public::{self, PublicTask};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use uuid::Uuid;

// GET /api/tasks
pub async fn list_tasks(State(state): State<SharedState>) -> Json<Vec<TaskView>> {
    let world = state.read();
    let tasks = world
        .tasks_sorted()
        .into_iter()
        .map(|t| world.task_view(t))
        .collect();
    Json(tasks)
}

// POST /api/tasks
pub async fn create_task(
    State(state): State<SharedState>,
    Json(payload): Json<NewTask>,
) -> Result<(StatusCode, Json<TaskView>), AppError> {
    let view = lifecycle::create_task(&state, payload, Utc::now())?;
    Ok((StatusCode::CREATED, Json(view)))
}

// PATCH /api/tasks/:id
pub async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TaskPatch>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(lifecycle::update_task(&state, id, payload, Utc::now())?))
}

// DELETE /api/tasks/:id
pub async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    lifecycle::delete_task(&state, id)?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /api/tasks/:id/comments
pub async fn add_comment(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<NewComment>,
) -> Result<(StatusCode, Json<CommentView>), AppError> {
    let comment = lifecycle::add_comment(&state, id, payload, Utc::now())?;
    Ok((StatusCode::CREATED, Json(comment)))
}

// PATCH /api/tasks/:id/visibility
pub async fn set_visibility(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Visibility>,
) -> Result<Json<VisibilityView>, AppError> {
    Ok(Json(lifecycle::set_visibility(&state, id, payload, Utc::now())?))
}

// GET /api/tasks/public
pub async fn public_tasks(State(state): State<SharedState>) -> Json<Vec<PublicTask>> {
    Json(public::public_tasks(&state.read()))
}

// GET /api/tasks/:id/history
pub async fn history(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<Vec<AuditView>> {
    Json(state.read().history(id))
}

// POST /api/tasks/:id/claim
pub async fn claim_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Claim>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(lifecycle::claim_task(&state, id, payload, Utc::now())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::Harness;
    use serde_json::json;

    fn new_task(body: serde_json::Value) -> Json<NewTask> {
        Json(serde_json::from_value(body).unwrap())
    }

    #[tokio::test]
    async fn list_follows_board_order() {
        let h = Harness::new();
        for (title, status) in [("c", "todo"), ("a", "doing"), ("b", "done")] {
            let (status_code, _) = create_task(State(h.state.clone()), new_task(json!({ "title": title, "status": status })))
                .await
                .unwrap();
            assert_eq!(status_code, StatusCode::CREATED);
        }
        let Json(tasks) = list_tasks(State(h.state.clone())).await;
        let titles: Vec<&str> = tasks.iter().map(|t| t.task.title.as_str()).collect();
        assert_eq!(titles, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn public_list_hides_private_detail() {
        let h = Harness::new();
        create_task(
            State(h.state.clone()),
            new_task(json!({
                "title": "Internal: fix ACME",
                "isPublic": true,
                "publicSummary": "Billing fix",
                "approvalComment": "client is upset",
            })),
        )
        .await
        .unwrap();
        create_task(State(h.state.clone()), new_task(json!({ "title": "Secret" })))
            .await
            .unwrap();

        let Json(public) = public_tasks(State(h.state.clone())).await;
        let body = serde_json::to_string(&public).unwrap();
        assert_eq!(public.len(), 1);
        assert!(body.contains("Billing fix"));
        assert!(!body.contains("ACME"));
        assert!(!body.contains("upset"));
        assert!(!body.contains("ownerId"));
        assert!(!body.contains("Secret"));
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let h = Harness::new();
        let (_, Json(task)) = create_task(State(h.state.clone()), new_task(json!({ "title": "Track me" })))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        lifecycle::update_task(
            &h.state,
            task.task.id,
            serde_json::from_value(json!({ "priority": "urgent" })).unwrap(),
            later,
        )
        .unwrap();

        let Json(history) = history(State(h.state.clone()), Path(task.task.id)).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].entry.field.as_deref(), Some("priority"));
        assert_eq!(history[1].entry.field, None);

        let Json(unknown) = super::history(State(h.state.clone()), Path(Uuid::new_v4())).await;
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn delete_answers_no_content() {
        let h = Harness::new();
        let (_, Json(task)) = create_task(State(h.state.clone()), new_task(json!({ "title": "Bye" })))
            .await
            .unwrap();
        let status = delete_task(State(h.state.clone()), Path(task.task.id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
