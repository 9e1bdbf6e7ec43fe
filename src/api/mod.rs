//! HTTP and WebSocket server for the voice gateway

pub mod health;
pub mod rate_limit;
pub mod voice;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::config::Config;
use crate::voice::{Coordinator, CoordinatorSettings, SynthesisStrategy, Synthesizer, VoiceServices};

/// Shared state for API handlers
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub capabilities: voice::VoiceCapabilities,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

impl ApiState {
    /// Build handler state from configuration and provider handles
    #[must_use]
    pub fn new(config: &Config, services: VoiceServices) -> Self {
        let capabilities = voice::VoiceCapabilities {
            stt_model: config.stt.model.clone(),
            llm_model: config.llm.model.clone(),
            tts_provider: config.tts.provider.as_str(),
            tts_voice: config.tts.voice.clone(),
            content_type: services.synthesizer.content_type(),
            synthesis: match config.pipeline.synthesis {
                SynthesisStrategy::Sequential => "sequential",
                SynthesisStrategy::Parallel { .. } => "parallel",
            },
            emotion: services.emotion.is_some(),
            barge_in: config.pipeline.activity.enabled,
        };

        let rate_limiter = (config.server.connections_per_minute > 0)
            .then(|| rate_limit::create_limiter(config.server.connections_per_minute));

        let synthesizer = Arc::clone(&services.synthesizer);
        let coordinator = Arc::new(Coordinator::new(services, CoordinatorSettings::from_config(config)));

        Self {
            coordinator,
            synthesizer,
            capabilities,
            rate_limiter,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
}

impl ApiServer {
    /// Create a server for `config` backed by `services`
    #[must_use]
    pub fn new(config: &Config, services: VoiceServices) -> Self {
        Self {
            state: Arc::new(ApiState::new(config, services)),
            host: config.server.host.clone(),
            port: config.server.port,
            allowed_origins: config.server.allowed_origins.clone(),
        }
    }

    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Build the router with CORS and request tracing
    pub fn router(&self) -> Router {
        Router::new()
            .merge(health::router())
            .nest("/api/voice", voice::router(self.state.clone()))
            .nest("/ws", websocket::router(self.state.clone()))
            .layer(cors_layer(&self.allowed_origins))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(addr = %addr, "voice gateway listening");
        if self.state.rate_limiter.is_some() {
            tracing::info!("connection rate limiting active");
        }

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Transport(format!("API server error: {e}")))?;

        Ok(())
    }
}

/// CORS for the configured origins; `*` allows any
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(parsed))
}
