//! Web front end.
//!
//! Serves the JSON status feed, status-icon images, the registration form
//! endpoint, the account page API, and `/metrics` for Prometheus scraping.
//! Runs on a separate tokio task; all state mutation still goes through the
//! account store's reconcile.

use crate::address::{BareAddress, validate_username};
use crate::config::SiteConfig;
use crate::db::{Account, AccountPatch, Database, MatchKey};
use crate::error::Error;
use crate::registration::RegistrationMessenger;
use crate::transport::Transport;
use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Feed responses are cacheable for one minute.
const CACHE_MINUTES: i64 = 1;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub site: SiteConfig,
    pub transport: Arc<dyn Transport>,
    pub messenger: Arc<RegistrationMessenger>,
}

/// Build the site router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status/:username", get(status_feed))
        .route("/status/:username/icon.png", get(status_icon))
        .route("/account/register", post(register))
        .route("/account/:code", get(account_view).post(claim_username))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the HTTP server for the site.
///
/// This is a long-running task that should be spawned in the background.
pub async fn run_http_server(bind: SocketAddr, state: AppState) {
    let app = router(state);

    info!(addr = %bind, "Site listening");
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %bind, error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "HTTP server error");
    }
}

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn map_error(err: Error) -> Response {
    let status = err.http_status();
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    error_json(status, &err.to_string())
}

/// Last-Modified from the account row plus a short Expires window.
fn cache_headers(account: Option<&Account>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let last_modified = account
        .and_then(|a| DateTime::<Utc>::from_timestamp(a.updated_at, 0))
        .unwrap_or_else(Utc::now);
    let expires = Utc::now() + Duration::minutes(CACHE_MINUTES);

    let fmt = "%a, %d %b %Y %H:%M:%S GMT";
    if let Ok(value) = last_modified.format(fmt).to_string().parse() {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = expires.format(fmt).to_string().parse() {
        headers.insert(header::EXPIRES, value);
    }
    headers
}

fn account_json(site: &SiteConfig, account: &Account) -> serde_json::Value {
    json!({
        "state": account.state.friendly(),
        "rawState": account.state.as_str(),
        "icon": site.icon_url(account.state.icon()),
        "statusText": account.status_text,
        "createdAt": account.created_at,
        "updatedAt": account.updated_at,
    })
}

/// GET /status/{username} - JSON feed for one contact's status.
async fn status_feed(State(state): State<AppState>, Path(username): Path<String>) -> Response {
    let account = match state.db.accounts().find_by_username(&username).await {
        Ok(account) => account,
        Err(e) => return map_error(e.into()),
    };

    let Some(account) = account else {
        warn!(username = %username, "Status feed requested for unknown user");
        return error_json(StatusCode::NOT_FOUND, "User not found");
    };

    (
        cache_headers(Some(&account)),
        Json(account_json(&state.site, &account)),
    )
        .into_response()
}

/// GET /status/{username}/icon.png - status icon for embedding elsewhere.
///
/// Unknown users get the offline icon rather than an error, so embedded
/// images never break.
async fn status_icon(State(state): State<AppState>, Path(username): Path<String>) -> Response {
    let account = match state.db.accounts().find_by_username(&username).await {
        Ok(account) => account,
        Err(e) => return map_error(e.into()),
    };

    let icon = account
        .as_ref()
        .map(|a| a.state.icon())
        .unwrap_or("offline");
    let path = format!("{}/img/icons/{}.png", state.site.public_dir, icon);

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            cache_headers(account.as_ref()),
            [(header::CONTENT_TYPE, "image/png")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(path = %path, error = %e, "Icon file missing");
            error_json(StatusCode::NOT_FOUND, "Icon not found")
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterForm {
    address: String,
}

/// POST /account/register - registration form submission.
///
/// Known contacts get their registration link re-sent immediately. Unknown
/// addresses get a subscribe request; the bot sends the link once the
/// contact accepts.
async fn register(State(state): State<AppState>, Form(form): Form<RegisterForm>) -> Response {
    let address = match BareAddress::parse(&form.address) {
        Ok(address) => address,
        Err(e) => return map_error(e),
    };

    let existing = match state.db.accounts().find_by_address(address.as_str()).await {
        Ok(existing) => existing,
        Err(e) => return map_error(e.into()),
    };

    match existing {
        Some(account) => {
            if let Err(e) = state
                .messenger
                .send_registration_message(&address, account.account_code.as_deref())
                .await
            {
                return map_error(e);
            }
            Json(json!({ "status": "message-sent" })).into_response()
        }
        None => {
            info!(address = %address, "Registration for new contact, subscribing");
            if let Err(e) = state.transport.request_subscription(address.as_str()).await {
                return map_error(e.into());
            }
            Json(json!({ "status": "subscription-requested" })).into_response()
        }
    }
}

/// GET /account/{code} - account page data, keyed by registration code.
async fn account_view(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    let account = match state.db.accounts().find_by_account_code(&code).await {
        Ok(account) => account,
        Err(e) => return map_error(e.into()),
    };

    let Some(account) = account else {
        info!("Account page requested for unknown code");
        return error_json(StatusCode::NOT_FOUND, "User not found");
    };

    let feed_url = account
        .username
        .as_deref()
        .map(|u| format!("{}status/{}", state.site.base_url, u));
    Json(json!({
        "address": account.address,
        "username": account.username,
        "state": account.state.as_str(),
        "statusText": account.status_text,
        "feedUrl": feed_url,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UsernameForm {
    username: String,
}

/// POST /account/{code} - claim or change the feed username.
async fn claim_username(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Form(form): Form<UsernameForm>,
) -> Response {
    if let Err(e) = validate_username(&form.username) {
        return map_error(e);
    }

    let account = match state.db.accounts().find_by_account_code(&code).await {
        Ok(account) => account,
        Err(e) => return map_error(e.into()),
    };
    let Some(account) = account else {
        return error_json(StatusCode::NOT_FOUND, "User not found");
    };

    match state.db.accounts().find_by_username(&form.username).await {
        Ok(Some(existing)) if existing.id != account.id => {
            return error_json(StatusCode::CONFLICT, "That username is already taken");
        }
        Ok(_) => {}
        Err(e) => return map_error(e.into()),
    }

    let patch = AccountPatch {
        username: Some(form.username.clone()),
        ..AccountPatch::for_address(&account.address)
    };
    // The unique index still backstops a race on the same username; that
    // surfaces as a 409 through the Conflict mapping.
    match state
        .db
        .accounts()
        .reconcile(&[MatchKey::Address], &patch)
        .await
    {
        Ok(updated) => {
            info!(address = %updated.address, username = %form.username, "Username claimed");
            Json(json!({
                "username": updated.username,
                "feedUrl": format!("{}status/{}", state.site.base_url, form.username),
            }))
            .into_response()
        }
        Err(e) => map_error(e.into()),
    }
}
