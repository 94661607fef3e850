use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    routing::get,
    Json, Router,
};
use tracing::{debug, instrument};

use super::{
    dto::{AvatarUpload, UpdateUserForm, UserView},
    validation::parse_user_id,
};
use crate::{
    auth::AuthUser,
    error::{MessageResponse, ServiceError, ServiceResult},
    state::AppState,
};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(get_all_users))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

#[instrument(skip(state))]
pub async fn get_all_users(State(state): State<AppState>) -> ServiceResult<Json<Vec<UserView>>> {
    Ok(Json(state.users.get_all_users().await?))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<UserView>> {
    let id = parse_user_id(&id)?;
    Ok(Json(state.users.get_user_by_id(id).await?))
}

/// PUT /users/:id (multipart)
#[instrument(skip(state, principal, mp), fields(requester = %principal.id))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(id): Path<String>,
    mp: Multipart,
) -> ServiceResult<Json<UserView>> {
    let id = parse_user_id(&id)?;
    let (form, avatar) = read_update_form(mp).await?;
    let view = state.users.update_user(&principal, id, form, avatar).await?;
    Ok(Json(view))
}

#[instrument(skip(state, principal), fields(requester = %principal.id))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(id): Path<String>,
) -> ServiceResult<Json<MessageResponse>> {
    let id = parse_user_id(&id)?;
    state.users.delete_user_by_id(&principal, id).await?;
    Ok(MessageResponse::success("User deleted"))
}

fn malformed(e: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::invalid(format!("malformed multipart body: {e}"))
}

/// Collects the text fields and the optional `avatar` file of an update request.
async fn read_update_form(
    mut mp: Multipart,
) -> ServiceResult<(UpdateUserForm, Option<AvatarUpload>)> {
    let mut form = UpdateUserForm::default();
    let mut avatar = None;

    while let Some(field) = mp.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "avatar" {
            let content_type = field
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| "application/octet-stream".into());
            let body = field.bytes().await.map_err(malformed)?;
            // browsers send an empty part when no file was picked
            if !body.is_empty() {
                avatar = Some(AvatarUpload { body, content_type });
            }
            continue;
        }

        let value = field.text().await.map_err(malformed)?;
        match name.as_str() {
            "firstname" => form.firstname = Some(value),
            "lastname" => form.lastname = Some(value),
            "email" => form.email = Some(value),
            "about" => form.about = Some(value),
            "dateOfBirth" => form.date_of_birth = Some(value),
            "gender" => form.gender = Some(value),
            "location" => form.location = Some(value),
            "socials" | "socials[]" => form.socials.push(value),
            other => debug!(field = other, "unknown form field ignored"),
        }
    }
    Ok((form, avatar))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        app::build_app,
        auth::{JwtKeys, Principal},
        config::AppConfig,
        state::{AppState, Backends},
        users::{
            memory::InMemoryUserRepository,
            model::{Role, User},
        },
    };

    const BOUNDARY: &str = "XyZboundary";

    fn multipart(text: &[(&str, &str)], avatar: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in text {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((ct, bytes)) = avatar {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"avatar\"; filename=\"a\"\r\nContent-Type: {ct}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn token(state: &AppState, id: Uuid, role: Role) -> String {
        let keys: JwtKeys = state.jwt.clone();
        keys.sign(
            &Principal {
                id,
                role,
            },
            Duration::from_secs(60),
        )
        .unwrap()
    }

    async fn seed(state: &AppState) -> User {
        let user = User::provisioned(
            Uuid::new_v4(),
            "jane@example.com".into(),
            "Jane".into(),
            "Smith".into(),
        );
        state.backends.repo.create(&user).await.unwrap();
        user
    }

    async fn json(res: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put(uri: &str, token: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut req = Request::builder()
            .method("PUT")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn get_user_and_list() {
        let state = AppState::fake();
        let user = seed(&state).await;
        let app = build_app(state);

        let res = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/users/{}", user.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json(res).await["email"], "jane@example.com");

        let res = app
            .clone()
            .oneshot(Request::get("/api/v1/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(res).await.as_array().unwrap().len(), 1);

        let res = app
            .oneshot(
                Request::get(format!("/api/v1/users/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = json(res).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn store_outage_is_internal_error() {
        let config = Arc::new(AppConfig::for_tests());
        let repo = Arc::new(InMemoryUserRepository::new());
        let mut backends = Backends::in_memory(&config);
        backends.repo = repo.clone();
        let app = build_app(AppState::from_parts(config, backends));
        repo.set_unavailable(true);

        let res = app
            .clone()
            .oneshot(Request::get("/api/v1/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json(res).await;
        assert_eq!(body["code"], "UPSTREAM_ERROR");
        assert!(!body.to_string().contains("store unavailable"));

        let res = app
            .oneshot(
                Request::get(format!("/api/v1/users/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn malformed_id_is_bad_request() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::get("/api/v1/users/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_via_multipart() {
        let state = AppState::fake();
        let user = seed(&state).await;
        let t = token(&state, user.id, Role::User);
        let app = build_app(state.clone());

        let body = multipart(
            &[
                ("firstname", "Janet"),
                ("lastname", "Smith"),
                ("email", "ignored@example.com"),
                ("dateOfBirth", "02.01.2004"),
                ("gender", "female"),
                ("socials[]", "https://github.com/janet"),
                ("socials[]", "https://t.me/janet"),
            ],
            Some(("image/png", b"\x89PNG")),
        );
        let res = app
            .oneshot(put(&format!("/api/v1/users/{}", user.id), Some(&t), body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let view = json(res).await;
        assert_eq!(view["firstname"], "Janet");
        assert_eq!(view["email"], "jane@example.com");
        assert_eq!(view["date_of_birth"], "02.01.2004");
        assert_eq!(view["socials"].as_array().unwrap().len(), 2);
        assert!(view["avatar_url"].as_str().unwrap().ends_with(".png"));
    }

    #[tokio::test]
    async fn update_rejects_missing_name_and_auth() {
        let state = AppState::fake();
        let user = seed(&state).await;
        let t = token(&state, user.id, Role::User);
        let app = build_app(state.clone());
        let uri = format!("/api/v1/users/{}", user.id);

        let res = app
            .clone()
            .oneshot(put(&uri, Some(&t), multipart(&[("lastname", "Smith")], None)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(res).await["code"], "INVALID_INPUT");

        let res = app
            .clone()
            .oneshot(put(&uri, None, multipart(&[("firstname", "A"), ("lastname", "B")], None)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let stranger = token(&state, Uuid::new_v4(), Role::Moderator);
        let res = app
            .oneshot(put(
                &uri,
                Some(&stranger),
                multipart(&[("firstname", "A"), ("lastname", "B")], None),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn delete_user_route() {
        let state = AppState::fake();
        let user = seed(&state).await;
        let t = token(&state, user.id, Role::User);
        let app = build_app(state);
        let uri = format!("/api/v1/users/{}", user.id);

        let delete = |token: String| {
            Request::delete(uri.clone())
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };

        let res = app.clone().oneshot(delete(t.clone())).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json(res).await["status"], "success");

        let res = app.oneshot(delete(t)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
