use crate::error::AppError;
use crate::hub::ServerEvent;
use crate::models::{User, UserProfile};
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Deserialize;

const DEFAULT_AVATAR: &str = "👤";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewAccount {
    pub name: String,
    pub avatar: Option<String>,
    pub is_admin: bool,
}

// POST /api/admin/users
//
// Unlike `POST /api/users`, an existing name is an error rather than a
// lookup, and the admin flag can be set up front.
pub async fn create_user(
    State(state): State<SharedState>,
    Json(payload): Json<NewAccount>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Name is required"));
    }

    let profile = {
        let mut world = state.write();
        if world.user_by_name(name).is_some() {
            return Err(AppError::validation("User with this name already exists"));
        }
        let avatar = payload
            .avatar
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DEFAULT_AVATAR.to_string());
        let mut user = User::new(name, Some(avatar), Utc::now());
        user.is_admin = payload.is_admin;
        let profile = world.insert_user(user)?.profile();
        state.commit(&mut world)?;
        profile
    };

    tracing::info!(user_id = %profile.id, name = %profile.name, is_admin = profile.is_admin, "user created by admin");
    state.hub.publish(ServerEvent::UsersUpdated);
    Ok((StatusCode::CREATED, Json(profile)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::Harness;
    use serde_json::json;

    fn account(body: serde_json::Value) -> Json<NewAccount> {
        Json(serde_json::from_value(body).unwrap())
    }

    #[tokio::test]
    async fn creates_an_admin_and_announces_it() {
        let h = Harness::new();
        let mut rx = h.state.hub.subscribe();

        let (status, Json(profile)) = create_user(
            State(h.state.clone()),
            account(json!({ "name": "  Grace ", "isAdmin": true })),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(profile.name, "Grace");
        assert!(profile.is_admin);
        assert_eq!(profile.avatar.as_deref(), Some(DEFAULT_AVATAR));
        assert!(rx.try_recv().unwrap().contains("users:updated"));

        let reloaded = h.state.save_file.load_world().unwrap();
        assert!(reloaded.users[&profile.id].is_admin);
    }

    #[tokio::test]
    async fn plain_user_keeps_the_chosen_avatar() {
        let h = Harness::new();
        let (_, Json(profile)) = create_user(
            State(h.state.clone()),
            account(json!({ "name": "Linus", "avatar": "🐧" })),
        )
        .await
        .unwrap();
        assert!(!profile.is_admin);
        assert_eq!(profile.avatar.as_deref(), Some("🐧"));
    }

    #[tokio::test]
    async fn rejects_blank_and_taken_names() {
        let h = Harness::new();
        let err = create_user(State(h.state.clone()), account(json!({ "name": " " })))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        create_user(State(h.state.clone()), account(json!({ "name": "Ada" })))
            .await
            .unwrap();
        let err = create_user(State(h.state.clone()), account(json!({ "name": "Ada", "isAdmin": true })))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("already exists")));
        assert_eq!(h.state.read().users.len(), 1);
    }
}
