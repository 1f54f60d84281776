//! Axum-based HTTP API
//!
//! Request/response endpoints lock the controller directly; the command
//! channel is used where the control loop itself must act (immediate
//! refresh, shutdown). Model calls triggered from here run on captured
//! context so the controller lock is never held across a generation.

use crate::clients::Credentials;
use crate::controller::{self, ChargeController, ControllerCommand, DryRunScenario};
use crate::settings::{AiSettingsUpdate, SettingsUpdate};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Mutex<ChargeController>>,
    pub commands: mpsc::UnboundedSender<ControllerCommand>,
}

#[derive(Deserialize)]
pub struct OverrideBody {
    /// Amps to latch; `null` clears the override
    pub amps: Option<u32>,
}

#[derive(Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let c = state.controller.lock().await;
    Json(c.status())
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let c = state.controller.lock().await;
    Json(c.settings().clone())
}

async fn post_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    let mut c = state.controller.lock().await;
    Json(c.update_settings(&update))
}

async fn override_amps(
    State(state): State<AppState>,
    Json(body): Json<OverrideBody>,
) -> impl IntoResponse {
    if let Some(amps) = body.amps {
        if amps > 32 {
            return (
                StatusCode::BAD_REQUEST,
                error_body(format!("amps must be 0-32, got {}", amps)),
            )
                .into_response();
        }
    }
    let mut c = state.controller.lock().await;
    match body.amps {
        Some(amps) => c.set_manual_override(amps),
        None => c.clear_manual_override(),
    }
    Json(serde_json::json!({ "manual_override_amps": body.amps })).into_response()
}

async fn optimize_toggle(
    State(state): State<AppState>,
    Json(body): Json<ToggleBody>,
) -> impl IntoResponse {
    let mut c = state.controller.lock().await;
    c.set_ai_enabled(body.enabled);
    Json(serde_json::json!({ "ai_enabled": body.enabled }))
}

/// Ask the control loop to run a cycle now, with a forced model call
async fn optimize_refresh(State(state): State<AppState>) -> impl IntoResponse {
    match state.commands.send(ControllerCommand::RefreshNow) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "refresh scheduled" })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("control loop is not running"),
        )
            .into_response(),
    }
}

async fn get_ai_settings(State(state): State<AppState>) -> impl IntoResponse {
    let c = state.controller.lock().await;
    Json(c.ai_settings().clone())
}

async fn post_ai_settings(
    State(state): State<AppState>,
    Json(update): Json<AiSettingsUpdate>,
) -> impl IntoResponse {
    let mut c = state.controller.lock().await;
    Json(c.update_ai_settings(&update))
}

/// Run the whole model pipeline against a synthetic scenario without
/// issuing commands or touching loop state. An absent body uses the
/// scenario defaults.
async fn debug_ai_test(
    State(state): State<AppState>,
    body: Option<Json<DryRunScenario>>,
) -> impl IntoResponse {
    let scenario = body.map(|Json(s)| s).unwrap_or_default();
    let (prompt, client, ai) = {
        let c = state.controller.lock().await;
        c.scenario_context(&scenario)
    };
    Json(controller::dry_run(prompt, client, ai).await)
}

/// The exact prompt the model would receive for a scenario (no model call)
async fn debug_prompt_preview(
    State(state): State<AppState>,
    body: Option<Json<DryRunScenario>>,
) -> impl IntoResponse {
    let scenario = body.map(|Json(s)| s).unwrap_or_default();
    let c = state.controller.lock().await;
    Json(serde_json::json!({ "prompt": c.scenario_prompt(&scenario) }))
}

async fn sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(20).min(200);
    let offset = query.offset.unwrap_or(0);
    let c = state.controller.lock().await;
    Json(c.sessions_page(limit, offset))
}

async fn session_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let c = state.controller.lock().await;
    match c.session_by_id(&id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            error_body(format!("no session with id {}", id)),
        )
            .into_response(),
    }
}

async fn get_credentials(State(state): State<AppState>) -> impl IntoResponse {
    let c = state.controller.lock().await;
    Json(c.credentials_masked())
}

async fn post_credentials(
    State(state): State<AppState>,
    Json(update): Json<Credentials>,
) -> impl IntoResponse {
    let mut c = state.controller.lock().await;
    match c.update_credentials(&update) {
        Ok(()) => Json(c.credentials_masked()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response(),
    }
}

/// Probe every configured external service
async fn test_credentials(State(state): State<AppState>) -> impl IntoResponse {
    let mut c = state.controller.lock().await;
    Json(c.test_credentials().await)
}

async fn outlook(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let (cached, context) = {
        let c = state.controller.lock().await;
        (c.cached_outlook(now), c.outlook_context())
    };
    if let Some(text) = cached {
        return Json(serde_json::json!({ "outlook": text, "cached": true }));
    }
    let (prompt, client, ai) = context;
    let result = crate::advisor::run_outlook(&client, &prompt, &ai).await;
    let text = {
        let mut c = state.controller.lock().await;
        c.store_outlook(now, result)
    };
    Json(serde_json::json!({ "outlook": text, "cached": false }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/override/amps", post(override_amps))
        .route("/api/optimize/toggle", post(optimize_toggle))
        .route("/api/optimize/refresh", post(optimize_refresh))
        .route(
            "/api/admin/ai-settings",
            get(get_ai_settings).post(post_ai_settings),
        )
        .route("/api/debug/ai-test", post(debug_ai_test))
        .route("/api/debug/ai-prompt-preview", post(debug_prompt_preview))
        .route("/api/sessions", get(sessions))
        .route("/api/sessions/{id}/details", get(session_details))
        .route(
            "/api/credentials",
            get(get_credentials).post(post_credentials),
        )
        .route("/api/credentials/test", post(test_credentials))
        .route("/api/outlook", get(outlook))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    controller: Arc<Mutex<ChargeController>>,
    commands: mpsc::UnboundedSender<ControllerCommand>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let state = AppState {
        controller,
        commands,
    };
    let router = build_router(state);
    let logger = crate::logging::get_logger("web");

    let addr: SocketAddr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{}",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> (AppState, mpsc::UnboundedReceiver<ControllerCommand>) {
        let config = Config {
            state_file: tempfile::NamedTempFile::new()
                .unwrap()
                .into_temp_path()
                .keep()
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
            ..Default::default()
        };
        let (controller, _ai_rx) = ChargeController::new(config).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            AppState {
                controller: Arc::new(Mutex::new(controller)),
                commands: tx,
            },
            rx,
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_shape() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["mode"].is_string());
        assert!(body["budget"]["total_kwh"].is_number());
        assert_eq!(body["ai"]["status"], "standby");
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let (state, _rx) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/settings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"target_soc": 90}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["target_soc"], 90);

        let response = app
            .oneshot(Request::get("/api/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["target_soc"], 90);
        // Untouched fields keep their defaults
        assert_eq!(body["default_charging_amps"], 8);
    }

    #[tokio::test]
    async fn test_override_validation() {
        let (state, _rx) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/override/amps")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"amps": 40}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/override/amps")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"amps": 10}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["manual_override_amps"], 10);
    }

    #[tokio::test]
    async fn test_override_clear() {
        let (state, _rx) = test_state();
        let app = build_router(state);

        for payload in [r#"{"amps": 8}"#, r#"{"amps": null}"#] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/api/override/amps")
                        .header("content-type", "application/json")
                        .body(Body::from(payload))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["manual_override_amps"].is_null());
    }

    #[tokio::test]
    async fn test_optimize_toggle() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/optimize/toggle")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"enabled": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ai_enabled"], true);
    }

    #[tokio::test]
    async fn test_optimize_refresh_sends_command() {
        let (state, mut rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/api/optimize/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.try_recv(),
            Ok(ControllerCommand::RefreshNow)
        ));
    }

    #[tokio::test]
    async fn test_ai_settings_clamped() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/api/admin/ai-settings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"ai_temperature": 9.0, "ai_max_amps": 48}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ai_temperature"], 2.0);
        assert_eq!(body["ai_max_amps"], 32);
    }

    #[tokio::test]
    async fn test_sessions_empty_and_missing_id() {
        let (state, _rx) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, serde_json::json!([]));

        let response = app
            .oneshot(
                Request::get("/api/sessions/nope/details")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_credentials_masked_on_read() {
        let (state, _rx) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/credentials")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tessie_api_key": "secret-token-1234"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let masked = body["tessie_api_key"].as_str().unwrap();
        assert!(masked.ends_with("1234"));
        assert!(masked.starts_with('•'));
    }

    #[tokio::test]
    async fn test_prompt_preview() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/api/debug/ai-prompt-preview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let prompt = body["prompt"].as_str().unwrap();
        assert!(prompt.contains("=== CHARGING STRATEGY ==="));
    }

    #[tokio::test]
    async fn test_prompt_preview_accepts_scenario_overrides() {
        let (state, _rx) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::post("/api/debug/ai-prompt-preview")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"solar_w": 5200, "vehicle_soc": 42}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let prompt = body["prompt"].as_str().unwrap();
        assert!(prompt.contains("Solar yield: 5200W"));
        assert!(prompt.contains("currently 42%"));
        // Untouched fields keep the scenario defaults
        assert!(prompt.contains("Current time: 13:00"));
    }
}
