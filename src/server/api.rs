use crate::agent::EcgAgent;
use crate::cli::Args;
use crate::error::WorkflowError;
use crate::models::analysis::AnalysisRecord;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::get,
    Router,
    extract::{ State, Query },
    response::{ Html, IntoResponse },
    http::StatusCode,
    Json,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error };

const VIEWER_PAGE: &str = include_str!("../../static/index.html");

#[derive(Deserialize)]
pub struct AnalysesQuery {
    pub patient_id: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    model: String,
    store: Option<String>,
    storage_bucket: Option<String>,
    ws_addr: String,
    tls: bool,
    chat_scope: String,
    history_load_limit: usize,
}

#[derive(Serialize)]
struct AnalysesResponse {
    count: usize,
    analyses: Vec<AnalysisRecord>,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Clone)]
struct AppState {
    agent: Arc<EcgAgent>,
    args: Args,
}

fn router(agent: Arc<EcgAgent>, args: Args) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/analyses", get(analyses_handler))
        .route("/api/reload-prompts", get(reload_prompts_handler))
        .layer(cors)
        .with_state(AppState { agent, args })
}

pub async fn start_http_server(
    http_port: u16,
    agent: Arc<EcgAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(agent, args.clone());

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            tokio::spawn(async move {
                let result = axum_server::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;

                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });

            info!("HTTPS server started with TLS enabled");
        }
        _ => {
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                            error!("HTTP server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    }
                }
            });

            info!("HTTP server started");
        }
    }

    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(VIEWER_PAGE)
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let settings = state.agent.settings();
    Json(StatusResponse {
        model: state.agent.model(),
        store: state.agent.store_description(),
        storage_bucket: state.args.firebase_storage_bucket.clone(),
        ws_addr: state.args.server_addr.clone(),
        tls: state.args.enable_tls,
        chat_scope: settings.chat_scope.to_string(),
        history_load_limit: settings.history_load_limit,
    })
}

async fn analyses_handler(
    State(state): State<AppState>,
    Query(query): Query<AnalysesQuery>
) -> impl IntoResponse {
    let patient_id = query.patient_id.as_deref().map(str::trim).filter(|p| !p.is_empty());

    match state.agent.list_analyses(patient_id).await {
        Ok(analyses) =>
            (
                StatusCode::OK,
                Json(AnalysesResponse { count: analyses.len(), analyses }),
            ).into_response(),
        Err(WorkflowError::StoreUnavailable) =>
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(MessageResponse {
                    success: false,
                    message: WorkflowError::StoreUnavailable.to_string(),
                }),
            ).into_response(),
        Err(e) =>
            (
                StatusCode::BAD_GATEWAY,
                Json(MessageResponse { success: false, message: e.to_string() }),
            ).into_response(),
    }
}

async fn reload_prompts_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(path) = state.args.prompts_path.as_deref() else {
        return (
            StatusCode::OK,
            Json(MessageResponse {
                success: true,
                message: "Using built-in prompts".into(),
            }),
        );
    };

    match state.agent.reload_prompts_if_changed(path).await {
        Ok(true) => (StatusCode::OK, Json(MessageResponse { success: true, message: "Prompts reloaded".into() })),
        Ok(false) => (StatusCode::OK, Json(MessageResponse { success: true, message: "Prompts unchanged".into() })),
        Err(e) =>
            (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse { success: false, message: format!("Reload error: {}", e) }),
            ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::WorkflowSettings;
    use crate::config::prompt::PromptConfig;
    use crate::llm::mock::ScriptedClient;
    use crate::store::{ AnalysisStore, MemoryStore, StoredAnalysis };
    use clap::Parser;

    fn state(store: Option<Arc<MemoryStore>>) -> State<AppState> {
        let agent = EcgAgent::with_parts(
            Arc::new(ScriptedClient::new(vec![])),
            store.map(|s| s as Arc<dyn AnalysisStore>),
            Arc::new(PromptConfig::default()),
            WorkflowSettings::default()
        );
        State(AppState {
            agent: Arc::new(agent),
            args: Args::parse_from(["ecg-analyzer"]),
        })
    }

    fn stored(ts: &str, patient: &str) -> StoredAnalysis {
        StoredAnalysis {
            timestamp: ts.into(),
            image_name: "a.png".into(),
            image_base64: String::new(),
            report: "report".into(),
            patient_id: patient.into(),
            analysis_type: "ECG".into(),
        }
    }

    #[tokio::test]
    async fn analyses_without_store_is_unavailable() {
        let resp = analyses_handler(state(None), Query(AnalysesQuery { patient_id: None })).await;
        assert_eq!(resp.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn analyses_are_listed_from_store() {
        let store = Arc::new(MemoryStore::default());
        store.save_analysis(&stored("2024-01-01 00:00:00", "P1")).await.unwrap();
        store.save_analysis(&stored("2024-01-02 00:00:00", "P2")).await.unwrap();

        let resp = analyses_handler(
            state(Some(store.clone())),
            Query(AnalysesQuery { patient_id: Some(" P1 ".into()) })
        ).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        store.set_unavailable(true);
        let resp = analyses_handler(state(Some(store)), Query(AnalysesQuery { patient_id: None })).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn status_reports_configuration() {
        let Json(status) = status_handler(state(None)).await;
        assert_eq!(status.model, "scripted");
        assert!(status.store.is_none());
        assert_eq!(status.ws_addr, "127.0.0.1:4000");
        assert_eq!(status.chat_scope, "analysis");
    }

    #[tokio::test]
    async fn reload_without_prompt_file_uses_builtins() {
        let resp = reload_prompts_handler(state(None)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn viewer_page_speaks_the_socket_protocol() {
        assert!(VIEWER_PAGE.contains("load_history"));
        assert!(VIEWER_PAGE.contains("/api/status"));
    }

    #[test]
    fn viewer_page_shows_reports_side_by_side_and_echoes_accepted_chat() {
        assert!(VIEWER_PAGE.contains("id=\"past-report\""));
        assert!(VIEWER_PAGE.contains("id=\"current-report\""));
        assert!(VIEWER_PAGE.contains("e.id === currentId"));
        assert!(VIEWER_PAGE.contains("msg.action === \"chat\" && pendingQuestion !== null"));
        assert!(!VIEWER_PAGE.contains("addChat(\"user\", content)"));
    }
}
