use crate::cli::Args;
use crate::config::prompt::{ get_chat_prompt, load_prompts_or_default, PromptConfig };
use crate::llm::chat::{ new_client, ChatClient };
use crate::models::chat::ChatRequest;
use crate::stream::pipeline::{ stream_response, PipelineConfig };
use crate::stream::wire;
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use axum::{
    body::Body,
    extract::State,
    http::{ header, HeaderValue, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{ AllowOrigin, Any, CorsLayer };
use uuid::Uuid;
use log::{ info, warn, error };

pub const MESSAGE_ID_HEADER: &str = "x-message-id";

const STREAM_CHANNEL_CAPACITY: usize = 64;

type ChatLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorResponse { error: message.into() })).into_response()
}

#[derive(Clone)]
pub struct AppState {
    pub chat_client: Arc<dyn ChatClient>,
    pub prompts: Arc<PromptConfig>,
    pub pipeline: Arc<PipelineConfig>,
    limiter: Arc<ChatLimiter>,
}

impl AppState {
    pub fn new(
        chat_client: Arc<dyn ChatClient>,
        prompts: Arc<PromptConfig>,
        pipeline: PipelineConfig,
        requests_per_second: NonZeroU32
    ) -> Self {
        Self {
            chat_client,
            prompts,
            pipeline: Arc::new(pipeline),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(requests_per_second))),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let llm_config = args.llm_config()?;
        let chat_client = new_client(&llm_config)?;
        info!("Chat model: {} ({})", chat_client.get_model(), llm_config.llm_type);

        let prompts = load_prompts_or_default(&args.prompts_path)?;
        let pipeline = PipelineConfig {
            markers: args.markers()?,
            timeout: args.stream_timeout(),
        };
        let rate = NonZeroU32::new(args.rate_limit_per_second).ok_or(
            "RATE_LIMIT_PER_SECOND must be greater than zero"
        )?;
        Ok(Self::new(chat_client, prompts, pipeline, rate))
    }
}

fn cors_layer(origin: Option<&str>) -> Result<CorsLayer, Box<dyn Error + Send + Sync>> {
    let allow_origin = match origin {
        Some(origin) => AllowOrigin::exact(HeaderValue::from_str(origin)?),
        None => AllowOrigin::any(),
    };
    Ok(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([header::HeaderName::from_static(MESSAGE_ID_HEADER)])
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn start_http_server(
    addr: &str,
    state: AppState,
    args: &Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = addr.parse::<SocketAddr>()?;
    let app = router(state).layer(cors_layer(args.cors_origin.as_deref())?);

    match (args.enable_tls, args.tls_cert_path.as_ref(), args.tls_key_path.as_ref()) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("HTTPS server listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        }
        (true, _, _) => {
            return Err("ENABLE_TLS requires both TLS_CERT_PATH and TLS_KEY_PATH".into());
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e)
            })?;
            info!("HTTP server listening on http://{}", addr);
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn chat_handler(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    if state.limiter.check().is_err() {
        warn!("Chat request rejected by rate limiter");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }
    if req.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "messages must not be empty");
    }

    let context = req.context();
    let prompt = match get_chat_prompt(&state.prompts, &req.messages, &context) {
        Ok(prompt) => prompt,
        Err(e) => {
            error!("Failed to render chat prompt: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let message_id = Uuid::new_v4().to_string();
    info!(
        "Chat {}: {} messages, edits {}, active note '{}'",
        message_id,
        req.messages.len(),
        if context.allow_edits { "allowed" } else { "disabled" },
        context.active_note_title
    );

    let source = match state.chat_client.stream_completion(&prompt).await {
        Ok(source) => source,
        Err(e) => {
            error!("Chat {}: model request failed: {}", message_id, e);
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let pipeline = state.pipeline.clone();
    let task_id = message_id.clone();
    tokio::spawn(async move {
        match stream_response(source, &pipeline, &task_id, tx).await {
            Ok(summary) => {
                info!(
                    "Chat {} done in {:.3}s ({} prompt / {} completion tokens)",
                    task_id,
                    summary.elapsed.as_secs_f64(),
                    summary.usage.prompt_tokens,
                    summary.usage.completion_tokens
                );
            }
            Err(e) => warn!("Chat {} ended early: {}", task_id, e),
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, wire::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(wire::DATA_STREAM_HEADER, wire::DATA_STREAM_VERSION)
        .header(MESSAGE_ID_HEADER, message_id.as_str())
        .body(body);
    match response {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
