//! Ops HTTP surface: project listing, project creation and static-admin reset
//!
//! Served on the internal ops port only; there is no authentication.

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use pipecd_common::config::SharedSsoConfig;
use pipecd_common::model::{Project, ProjectSsoConfig, ProjectStaticUser, hash_id};
use pipecd_datastore::{ListOptions, ProjectStore};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const USERNAME_LEN: usize = 10;
const PASSWORD_LEN: usize = 30;

#[derive(Clone)]
pub struct OpsState {
    pub projects: Arc<ProjectStore>,
    pub shared_sso_configs: Arc<Vec<SharedSsoConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddProjectForm {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "SharedSSO")]
    pub shared_sso: String,
    #[serde(rename = "AllowStrayAsViewer")]
    pub allow_stray_as_viewer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResetStaticAdminForm {
    #[serde(rename = "ID")]
    pub id: String,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/", get(top))
        .route("/projects", get(list_projects))
        .route("/projects/add", get(add_project_form).post(add_project))
        .route("/projects/reset-static-admin", get(reset_form).post(reset_static_admin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>{title} - PipeCD Ops</title>
<style>
body {{ font-family: sans-serif; margin: 24px; }}
table {{ border-collapse: collapse; }}
th, td {{ border: 1px solid #ccc; padding: 4px 8px; text-align: left; }}
label {{ display: block; margin-top: 8px; }}
</style>
</head>
<body>
<h1>{title}</h1>
{body}
</body>
</html>"#,
        title = html_escape(title),
    ))
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

async fn top() -> Html<String> {
    page(
        "PipeCD Ops",
        r#"<ul>
<li><a href="/projects">List projects</a></li>
<li><a href="/projects/add">Add project</a></li>
<li><a href="/projects/reset-static-admin">Reset static admin</a></li>
</ul>"#,
    )
}

fn format_time(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0).map_or_else(|| ts.to_string(), |t| t.to_rfc3339())
}

async fn list_projects(State(state): State<OpsState>) -> Response {
    let projects = match state.projects.list_all(&ListOptions::default()).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to list projects");
            return fail(StatusCode::INTERNAL_SERVER_ERROR, "Unable to retrieve projects");
        }
    };
    let mut rows = String::new();
    for p in &projects {
        let sso = p.sso.as_ref().map_or("", |s| s.shared_config_name.as_str());
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            html_escape(&p.id),
            html_escape(&p.desc),
            p.static_admin_disabled,
            html_escape(sso),
            format_time(p.created_at),
        ));
    }
    page(
        "Projects",
        &format!(
            "<table>\n<tr><th>ID</th><th>Description</th><th>Static Admin Disabled</th>\
             <th>Shared SSO</th><th>Created At</th></tr>\n{rows}</table>"
        ),
    )
    .into_response()
}

async fn add_project_form() -> Html<String> {
    page(
        "Add Project",
        r#"<form method="post" action="/projects/add">
<label>ID <input type="text" name="ID" required></label>
<label>Description <input type="text" name="Description"></label>
<label>Shared SSO <input type="text" name="SharedSSO"></label>
<label>Allow stray users as viewer <input type="checkbox" name="AllowStrayAsViewer"></label>
<button type="submit">Add</button>
</form>"#,
    )
}

async fn add_project(State(state): State<OpsState>, Form(form): Form<AddProjectForm>) -> Response {
    if form.id.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "invalid id");
    }
    let sso = if form.shared_sso.is_empty() {
        None
    } else {
        let Some(shared) = state.shared_sso_configs.iter().find(|s| s.name == form.shared_sso) else {
            return fail(
                StatusCode::BAD_REQUEST,
                format!("SharedSSOConfig {:?} was not found in Control Plane configuration", form.shared_sso),
            );
        };
        Some(ProjectSsoConfig {
            provider: shared.provider.clone(),
            shared_config_name: shared.name.clone(),
            ..Default::default()
        })
    };

    let username = random_string(USERNAME_LEN);
    let password = random_string(PASSWORD_LEN);
    let project = Project {
        id: form.id.clone(),
        desc: form.description.clone(),
        static_admin: ProjectStaticUser {
            username: username.clone(),
            password_hash: hash_id(&[&password]),
        },
        sso,
        allow_stray_as_viewer: form.allow_stray_as_viewer.as_deref() == Some("on"),
        ..Default::default()
    };
    if let Err(e) = state.projects.add(project).await {
        error!(project_id = %form.id, error = %e, "failed to add project");
        return fail(StatusCode::INTERNAL_SERVER_ERROR, format!("Unable to add the project ({e})"));
    }
    info!(project_id = %form.id, "added project");

    page(
        "Project Added",
        &format!(
            "<table>\n<tr><th>ID</th><td>{}</td></tr>\n<tr><th>Description</th><td>{}</td></tr>\n\
             <tr><th>Shared SSO</th><td>{}</td></tr>\n<tr><th>Static Admin Username</th><td>{}</td></tr>\n\
             <tr><th>Static Admin Password</th><td>{}</td></tr>\n</table>",
            html_escape(&form.id),
            html_escape(&form.description),
            html_escape(&form.shared_sso),
            username,
            password,
        ),
    )
    .into_response()
}

async fn reset_form() -> Html<String> {
    page(
        "Reset Static Admin",
        r#"<form method="post" action="/projects/reset-static-admin">
<label>Project ID <input type="text" name="ID" required></label>
<button type="submit">Reset</button>
</form>"#,
    )
}

/// Issue a new static-admin password for an existing project
async fn reset_static_admin(State(state): State<OpsState>, Form(form): Form<ResetStaticAdminForm>) -> Response {
    if form.id.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "invalid id");
    }
    let project = match state.projects.get(&form.id).await {
        Ok(p) => p,
        Err(e) if e.is_not_found() => return fail(StatusCode::NOT_FOUND, format!("project {} not found", form.id)),
        Err(e) => {
            error!(project_id = %form.id, error = %e, "failed to get project");
            return fail(StatusCode::INTERNAL_SERVER_ERROR, "Unable to retrieve the project");
        }
    };
    let username = if project.static_admin.username.is_empty() {
        random_string(USERNAME_LEN)
    } else {
        project.static_admin.username
    };
    let password = random_string(PASSWORD_LEN);
    if let Err(e) = state
        .projects
        .update_static_admin(&form.id, &username, &hash_id(&[&password]))
        .await
    {
        error!(project_id = %form.id, error = %e, "failed to reset static admin");
        return fail(StatusCode::INTERNAL_SERVER_ERROR, format!("Unable to reset the static admin ({e})"));
    }
    info!(project_id = %form.id, "reset static admin password");

    page(
        "Static Admin Reset",
        &format!(
            "<table>\n<tr><th>ID</th><td>{}</td></tr>\n<tr><th>Static Admin Username</th><td>{}</td></tr>\n\
             <tr><th>Static Admin Password</th><td>{}</td></tr>\n</table>",
            html_escape(&form.id),
            html_escape(&username),
            password,
        ),
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::body::Body;
    use axum::http::{Request, header};
    use pipecd_datastore::Commander;
    use tower::ServiceExt;

    fn state() -> OpsState {
        OpsState {
            projects: Arc::new(ProjectStore::new(testing::datastore(), Commander::Ops)),
            shared_sso_configs: Arc::new(vec![SharedSsoConfig {
                name: "github".into(),
                provider: "GITHUB".into(),
                ..Default::default()
            }]),
        }
    }

    fn post(path: &str, body: &'static str) -> Request<Body> {
        Request::post(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Value of the table row labelled `th`
    fn row<'a>(html: &'a str, th: &str) -> &'a str {
        let start = html.find(&format!("<th>{th}</th><td>")).unwrap() + th.len() + 13;
        let end = start + html[start..].find("</td>").unwrap();
        &html[start..end]
    }

    #[tokio::test]
    async fn test_add_project_issues_static_admin() {
        let state = state();
        let projects = state.projects.clone();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(post("/projects/add", "ID=team&Description=Team&SharedSSO=github&AllowStrayAsViewer=on"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        let username = row(&html, "Static Admin Username").to_string();
        let password = row(&html, "Static Admin Password").to_string();
        assert_eq!(username.len(), USERNAME_LEN);
        assert_eq!(password.len(), PASSWORD_LEN);

        let project = projects.get("team").await.unwrap();
        assert_eq!(project.static_admin.username, username);
        assert_eq!(project.static_admin.password_hash, hash_id(&[&password]));
        assert_eq!(project.sso.unwrap().shared_config_name, "github");
        assert!(project.allow_stray_as_viewer);

        let resp = app
            .clone()
            .oneshot(Request::get("/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_text(resp).await.contains("<td>team</td>"));

        let resp = app.oneshot(post("/projects/add", "ID=team")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_add_project_rejects_bad_input() {
        let app = router(state());
        let resp = app.clone().oneshot(post("/projects/add", "Description=x")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = app.oneshot(post("/projects/add", "ID=x&SharedSSO=gitlab")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reset_static_admin_rotates_password() {
        let state = state();
        let projects = state.projects.clone();
        projects
            .add(Project {
                id: "team".into(),
                static_admin: ProjectStaticUser {
                    username: "root".into(),
                    password_hash: hash_id(&["old"]),
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(post("/projects/reset-static-admin", "ID=team"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert_eq!(row(&html, "Static Admin Username"), "root");
        let password = row(&html, "Static Admin Password");
        assert_eq!(projects.get("team").await.unwrap().static_admin.password_hash, hash_id(&[password]));

        let resp = app.oneshot(post("/projects/reset-static-admin", "ID=nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
