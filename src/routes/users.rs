//! Member routes
//!
//! - `GET  /api/users`               list members
//! - `POST /api/users`               register a member
//! - `GET  /api/users/{id}`          one member
//! - `GET  /api/users/{id}/kpis`     a member's assignments
//! - `PUT  /api/users/{id}/role`     `{"role": "commander"}`
//! - `PUT  /api/users/{id}/status`   `{"isActive": false, "reason": "..."}`
//! - `PUT  /api/users/{id}/profile`  `{"firstName", "lastName", "battalion"}`;
//!   `"battalion": null` clears it

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

use super::util::{actor, created, ok, parse_id, read_json, respond, FullBody};
use crate::db::schemas::{Battalion, Role};
use crate::members::{NewMember, ProfileUpdate};
use crate::server::AppState;
use crate::types::{BarracksError, Result};
use crate::views::UserView;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub battalion: Option<Battalion>,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatusRequest {
    #[serde(alias = "is_active")]
    pub is_active: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Present-but-null becomes `Some(None)`; absent stays `None`
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub battalion: Option<Option<Battalion>>,
}

pub async fn handle_user_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/users").unwrap_or("");

    let result = match (method, subpath) {
        (Method::GET, "") | (Method::GET, "/") => list_users(state).await,
        (Method::POST, "") | (Method::POST, "/") => register(req, state).await,

        (Method::GET, p) if p.ends_with("/kpis") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/kpis"))
                .unwrap_or("");
            user_kpis(state, id).await
        }
        (Method::PUT, p) if p.ends_with("/role") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/role"))
                .unwrap_or("")
                .to_string();
            change_role(req, state, &id).await
        }
        (Method::PUT, p) if p.ends_with("/status") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/status"))
                .unwrap_or("")
                .to_string();
            set_active(req, state, &id).await
        }
        (Method::PUT, p) if p.ends_with("/profile") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/profile"))
                .unwrap_or("")
                .to_string();
            update_profile(req, state, &id).await
        }

        (Method::GET, p) if p.matches('/').count() == 1 => get_user(state, &p[1..]).await,

        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

async fn list_users(state: Arc<AppState>) -> Result<Response<FullBody>> {
    let users = state.members.list().await?;
    ok(&users.iter().map(UserView::from).collect::<Vec<_>>())
}

async fn register(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<FullBody>> {
    let body: RegisterRequest = read_json(req).await?;
    let user = state
        .members
        .register(NewMember {
            first_name: body.first_name,
            last_name: body.last_name,
            email: body.email,
            role: body.role,
            battalion: body.battalion,
        })
        .await?;
    created(&UserView::from(&user))
}

async fn get_user(state: Arc<AppState>, id: &str) -> Result<Response<FullBody>> {
    let user = state.members.get(parse_id(id, "user")?).await?;
    ok(&UserView::from(&user))
}

async fn user_kpis(state: Arc<AppState>, id: &str) -> Result<Response<FullBody>> {
    let id = parse_id(id, "user")?;
    state.members.get(id).await?;
    ok(&state.dashboard.my_kpis(id).await?)
}

async fn change_role(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let id = parse_id(id, "user")?;
    let body: RoleRequest = read_json(req).await?;
    let user = state.members.change_role(actor, id, body.role).await?;
    ok(&UserView::from(&user))
}

async fn set_active(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let id = parse_id(id, "user")?;
    let body: AccountStatusRequest = read_json(req).await?;
    let user = state
        .members
        .set_active(actor, id, body.is_active, body.reason)
        .await?;
    ok(&UserView::from(&user))
}

async fn update_profile(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let id = parse_id(id, "user")?;
    let body: ProfileRequest = read_json(req).await?;
    let user = state
        .members
        .update_profile(
            id,
            ProfileUpdate {
                first_name: body.first_name,
                last_name: body.last_name,
                battalion: body.battalion,
            },
        )
        .await?;
    ok(&UserView::from(&user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_battalion_null_clears() {
        let absent: ProfileRequest = serde_json::from_str(r#"{"firstName": "Ada"}"#).unwrap();
        assert_eq!(absent.battalion, None);

        let cleared: ProfileRequest = serde_json::from_str(r#"{"battalion": null}"#).unwrap();
        assert_eq!(cleared.battalion, Some(None));

        let moved: ProfileRequest = serde_json::from_str(r#"{"battalion": "bravo"}"#).unwrap();
        assert_eq!(moved.battalion, Some(Some(Battalion::Bravo)));
    }

    #[test]
    fn test_register_accepts_legacy_role_spelling() {
        let body: RegisterRequest = serde_json::from_str(
            r#"{"firstName": "A", "lastName": "B", "email": "a@b.co", "role": "soldier"}"#,
        )
        .unwrap();
        assert_eq!(body.role, Some(Role::GlobalSoldier));
    }
}
