use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chatgate_config::Config;
use chatgate_contracts::{
    ChatDetail, ChatListResponse, ChatResponse, CreateChatRequest, MessageRole,
    SendMessageRequest, SendMessageResponse, SessionStats, StatsResponse, StatusMessage,
    UpdateChatRequest, API_VERSION, DEFAULT_CHAT_TITLE,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod auth;
mod cache;
mod error;
mod limits;
mod llm;
mod registry;
mod store;

use auth::{AuthUser, ClientInstance, JwtVerifier};
use cache::{chat_key, chats_key, ResponseCache};
use error::ApiError;
use limits::limit_per_client;
use llm::{CompletionEngine, CompletionError};
use store::StoreBackend;

pub use limits::{ClientLimiter, InFlight, UNKNOWN_PEER};
pub use registry::{
    spawn_sweeper, AdmissionGuard, Conflict, RegistryConfig, SessionRegistry, SessionSnapshot,
    SessionUpdate,
};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let service = build_service(cfg).await?;
    warn!(
        "chat session locks live in this process only; run a single instance per deployment"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(
        listener,
        service
            .router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(build_service(cfg).await?.router)
}

/// The router plus handles on its session registry and per-peer limiter.
pub struct ChatService {
    pub router: Router,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<ClientLimiter>,
}

pub async fn build_service(cfg: Config) -> Result<ChatService, String> {
    chatgate_config::validate_runtime_support(&cfg).map_err(|e| e.to_string())?;
    let limiter = ClientLimiter::new(cfg.server.max_concurrent_per_client);
    let compression = cfg.server.compression;
    let state = AppState::new(cfg)?;
    let sessions = Arc::clone(&state.sessions);
    spawn_sweeper(
        &sessions,
        Duration::from_millis(state.cfg.admission.sweep_interval_ms),
    );

    let mut router = Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/stats", get(stats))
        .route("/v1/chats", get(list_chats).post(create_chat))
        .route(
            "/v1/chats/{chat_id}",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/v1/chats/{chat_id}/messages", post(send_message))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&limiter),
            limit_per_client,
        ));
    if compression {
        router = router.layer(CompressionLayer::new());
    }
    let router = router.layer(TraceLayer::new_for_http());
    Ok(ChatService {
        router,
        sessions,
        limiter,
    })
}

#[derive(Clone)]
pub(crate) struct AppState {
    cfg: Arc<Config>,
    store: Arc<Mutex<StoreBackend>>,
    sessions: Arc<SessionRegistry>,
    llm: Arc<CompletionEngine>,
    cache: Arc<ResponseCache>,
    auth: Option<Arc<JwtVerifier>>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let store = StoreBackend::open(&cfg.store.kind, cfg.store.sqlite_path.as_deref())?;
        let auth = JwtVerifier::from_config(&cfg.auth).map(Arc::new);
        if auth.is_none() {
            warn!(
                env = %cfg.auth.jwt_secret_env,
                "no JWT secret configured; authenticated routes will fail"
            );
        }
        Ok(Self {
            sessions: SessionRegistry::new(RegistryConfig::from_admission(&cfg.admission)),
            llm: Arc::new(CompletionEngine::new(&cfg.llm)?),
            cache: Arc::new(ResponseCache::new(&cfg.cache)),
            store: Arc::new(Mutex::new(store)),
            auth,
            cfg: Arc::new(cfg),
        })
    }

    async fn process_message(
        &self,
        user_id: &str,
        chat_id: &str,
        content: Option<String>,
    ) -> Result<SendMessageResponse, ApiError> {
        let content = content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("Message content is required".to_string()))?;

        let (user_message, history) = {
            let mut store = self.store.lock().await;
            if store
                .get_chat(chat_id, user_id)
                .map_err(ApiError::Internal)?
                .is_none()
            {
                return Err(ApiError::NotFound("Chat not found".to_string()));
            }
            let user_message = store
                .insert_message(chat_id, MessageRole::User, &content)
                .map_err(ApiError::Internal)?;
            let history = store
                .recent_messages(chat_id, self.cfg.llm.context_window)
                .map_err(ApiError::Internal)?;
            (user_message, history)
        };

        let reply = self
            .llm
            .complete(chat_id, &history)
            .await
            .map_err(|e| match e {
                CompletionError::Unconfigured(msg) => ApiError::Misconfigured(msg),
                CompletionError::Upstream(msg) => ApiError::Upstream(msg),
            })?;

        let assistant_message = {
            let mut store = self.store.lock().await;
            let message = store
                .insert_message(chat_id, MessageRole::Assistant, &reply)
                .map_err(ApiError::Internal)?;
            store.touch_chat(chat_id).map_err(ApiError::Internal)?;
            message
        };
        self.cache.invalidate_chat(chat_id, user_id).await;

        Ok(SendMessageResponse {
            user_message,
            assistant_message,
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn stats(State(state): State<AppState>, user: AuthUser) -> Json<StatsResponse> {
    let sessions: Vec<SessionStats> = state
        .sessions
        .snapshots()
        .into_iter()
        .filter(|s| s.owner_user_id == user.user_id)
        .map(|s| SessionStats {
            chat_id: s.chat_id,
            processing: s.processing,
            idle_ms: u64::try_from(s.idle.as_millis()).unwrap_or(u64::MAX),
        })
        .collect();
    Json(StatsResponse {
        api_version: API_VERSION.to_string(),
        active_sessions: sessions.len(),
        processing_sessions: sessions.iter().filter(|s| s.processing).count(),
        sessions,
    })
}

async fn list_chats(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let key = chats_key(&user.user_id);
    if let Some(cached) = state.cache.get(&key).await {
        return Ok(Json(cached));
    }
    let chats = state
        .store
        .lock()
        .await
        .list_chats(&user.user_id)
        .map_err(ApiError::Internal)?;
    let body = to_value(&ChatListResponse { chats })?;
    state.cache.put(key, body.clone()).await;
    Ok(Json(body))
}

async fn create_chat(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<CreateChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatResponse>), ApiError> {
    // A missing or unparsable body just means no title.
    let title = body
        .ok()
        .and_then(|Json(b)| b.title)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string());
    let chat = state
        .store
        .lock()
        .await
        .create_chat(&user.user_id, &title)
        .map_err(ApiError::Internal)?;
    state.cache.invalidate_list(&user.user_id).await;
    info!(chat_id = %chat.id, user_id = %user.user_id, "chat created");
    Ok((
        StatusCode::CREATED,
        Json(ChatResponse {
            message: "Chat created successfully".to_string(),
            chat,
        }),
    ))
}

async fn get_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = chat_key(&chat_id, &user.user_id);
    if let Some(cached) = state.cache.get(&key).await {
        return Ok(Json(cached));
    }
    let detail = {
        let store = state.store.lock().await;
        let chat = store
            .get_chat(&chat_id, &user.user_id)
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        let messages = store.list_messages(&chat_id).map_err(ApiError::Internal)?;
        ChatDetail { chat, messages }
    };
    let body = to_value(&detail)?;
    state.cache.put(key, body.clone()).await;
    Ok(Json(body))
}

async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    ClientInstance(client): ClientInstance,
    Path(chat_id): Path<String>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let guard = state
        .sessions
        .admit(&chat_id, &client, &user.user_id)
        .map_err(|conflict| ApiError::Conflict(conflict.to_string()))?;

    let content = match body {
        Ok(Json(req)) => req.content,
        Err(rejection) => return Err(ApiError::BadRequest(rejection.body_text())),
    };
    let outcome = state
        .process_message(&user.user_id, &chat_id, content)
        .await;
    guard.release();
    outcome.map(Json)
}

async fn update_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<String>,
    body: Result<Json<UpdateChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let title = body
        .ok()
        .and_then(|Json(b)| b.title)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Title is required".to_string()))?;
    let chat = state
        .store
        .lock()
        .await
        .update_title(&chat_id, &user.user_id, &title)
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("Chat not found or not updated".to_string()))?;
    state.cache.invalidate_chat(&chat_id, &user.user_id).await;
    Ok(Json(ChatResponse {
        message: "Chat title updated successfully".to_string(),
        chat,
    }))
}

async fn delete_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<StatusMessage>, ApiError> {
    let deleted = state
        .store
        .lock()
        .await
        .delete_chat(&chat_id, &user.user_id)
        .map_err(ApiError::Internal)?;
    if !deleted {
        return Err(ApiError::NotFound("Chat not found".to_string()));
    }
    state.cache.invalidate_chat(&chat_id, &user.user_id).await;
    info!(chat_id = %chat_id, user_id = %user.user_id, "chat deleted");
    Ok(Json(StatusMessage {
        message: "Chat deleted successfully".to_string(),
    }))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}
