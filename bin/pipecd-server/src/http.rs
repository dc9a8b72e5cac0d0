//! HTTP surface: static-admin login, logout and the web console assets

use crate::jwt::{COOKIE_NAME, Claims, JwtManager, Role};
use axum::extract::{Form, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use pipecd_common::model::{ROLE_ADMIN, hash_id, now_unix};
use pipecd_common::{ControlPlaneConfig, Error, Result};
use pipecd_datastore::ProjectStore;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const LOGIN_PATH: &str = "/auth/login/static";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct HttpState {
    pub config: Arc<ControlPlaneConfig>,
    pub projects: Arc<ProjectStore>,
    pub jwt: Arc<JwtManager>,
    pub secure_cookie: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub project: String,
    pub username: String,
    pub password: String,
}

pub fn router(state: HttpState, static_dir: &Path) -> Router {
    let assets = ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html")));
    Router::new()
        .route(LOGIN_PATH, post(static_login))
        .route(LOGOUT_PATH, get(logout))
        .fallback_service(assets)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cookie(value: &str, max_age: u64, secure: bool) -> String {
    let mut c = format!("{COOKIE_NAME}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if secure {
        c.push_str("; Secure");
    }
    c
}

fn with_cookie(cookie: &str) -> Response {
    let mut resp = Redirect::to("/").into_response();
    match HeaderValue::from_str(cookie) {
        Ok(v) => {
            resp.headers_mut().insert(header::SET_COOKIE, v);
            resp
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Password hash of the project's static admin; the config file wins over the datastore
async fn static_admin(state: &HttpState, project_id: &str, username: &str) -> Result<String> {
    let (user, hash) = if let Some(p) = state.config.spec.find_project(project_id) {
        (p.static_admin.username.clone(), p.static_admin.password_hash.clone())
    } else {
        let project = state.projects.get(project_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::unauthenticated(format!("unknown project {project_id}"))
            } else {
                e
            }
        })?;
        if project.static_admin_disabled {
            return Err(Error::unauthenticated("static admin is disabled"));
        }
        (project.static_admin.username, project.static_admin.password_hash)
    };
    if user != username {
        return Err(Error::unauthenticated("wrong username or password"));
    }
    Ok(hash)
}

async fn login(state: &HttpState, form: &LoginForm) -> Result<String> {
    let hash = static_admin(state, &form.project, &form.username).await?;
    if hash.is_empty() || hash_id(&[&form.password]) != hash {
        return Err(Error::unauthenticated("wrong username or password"));
    }
    let claims = Claims::new(
        form.username.clone(),
        Role {
            project_id: form.project.clone(),
            project_rbac_roles: vec![ROLE_ADMIN.to_string()],
        },
        now_unix(),
        TOKEN_TTL,
    );
    state.jwt.sign(&claims)
}

async fn static_login(State(state): State<HttpState>, Form(form): Form<LoginForm>) -> Response {
    match login(&state, &form).await {
        Ok(token) => {
            info!(project = %form.project, user = %form.username, "static admin logged in");
            with_cookie(&cookie(&token, TOKEN_TTL.as_secs(), state.secure_cookie))
        }
        Err(e) if e.kind() == pipecd_common::ErrorKind::Unauthenticated => {
            warn!(project = %form.project, error = %e, "static login rejected");
            (StatusCode::UNAUTHORIZED, "wrong project, username or password").into_response()
        }
        Err(e) => {
            warn!(project = %form.project, error = %e, "static login failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn logout(State(state): State<HttpState>) -> Response {
    with_cookie(&cookie("", 0, state.secure_cookie))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::body::Body;
    use axum::http::Request;
    use pipecd_common::model::{Project, ProjectStaticUser};
    use pipecd_datastore::Commander;
    use tower::ServiceExt;

    async fn state() -> HttpState {
        let deps = testing::deps();
        let projects = ProjectStore::new(deps.datastore.clone(), Commander::Ops);
        projects
            .add(Project {
                id: "team".into(),
                static_admin: ProjectStaticUser {
                    username: "root".into(),
                    password_hash: hash_id(&["pass"]),
                },
                ..Default::default()
            })
            .await
            .unwrap();
        HttpState {
            config: deps.config,
            projects: Arc::new(projects),
            jwt: deps.jwt,
            secure_cookie: true,
        }
    }

    fn login_request(body: &'static str) -> Request<Body> {
        Request::post(LOGIN_PATH)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_static_login_sets_token_cookie() {
        let state = state().await;
        let jwt = state.jwt.clone();
        let dir = tempfile::tempdir().unwrap();
        let app = router(state, dir.path());

        let resp = app
            .clone()
            .oneshot(login_request("project=p&username=admin&password=admin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let set = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set.ends_with("; Secure"));
        let token = set.strip_prefix("token=").unwrap().split(';').next().unwrap();
        let claims = jwt.verify(token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.role.project_id, "p");

        let resp = app
            .clone()
            .oneshot(login_request("project=team&username=root&password=pass"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);

        let resp = app
            .oneshot(login_request("project=p&username=admin&password=nope"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_static_assets_fall_back_to_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>console</html>").unwrap();
        let app = router(state().await, dir.path());
        let resp = app
            .oneshot(Request::get("/applications/abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<html>console</html>");
    }

    #[tokio::test]
    async fn test_logout_clears_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state().await, dir.path());
        let resp = app
            .oneshot(Request::get(LOGOUT_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let set = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set.starts_with("token=; Path=/; Max-Age=0"));
    }
}
