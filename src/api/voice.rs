//! Voice HTTP endpoints: capabilities and one-shot synthesis

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::voice::collect_audio;

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/capabilities", get(capabilities))
        .route("/synthesize", post(synthesize))
        .with_state(state)
}

/// Configured voice services
#[derive(Debug, Clone, Serialize)]
pub struct VoiceCapabilities {
    pub stt_model: String,
    pub llm_model: String,
    pub tts_provider: &'static str,
    pub tts_voice: String,
    pub content_type: &'static str,
    pub synthesis: &'static str,
    pub emotion: bool,
    pub barge_in: bool,
}

async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    Json(state.capabilities.clone())
}

/// Synthesis request
#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

/// Synthesize text to speech in one response
async fn synthesize(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SynthesizeRequest>,
) -> Result<Response, VoiceError> {
    if request.text.trim().is_empty() {
        return Err(VoiceError::BadRequest("Empty text"));
    }

    let audio = async {
        let stream = state.synthesizer.synthesize(&request.text).await?;
        collect_audio(stream).await
    }
    .await
    .map_err(|e| {
        if e.is_rate_limited() {
            VoiceError::RateLimited(e.to_string())
        } else {
            VoiceError::SynthesisFailed(e.to_string())
        }
    })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, state.synthesizer.content_type())],
        audio,
    )
        .into_response())
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    BadRequest(&'static str),
    RateLimited(String),
    SynthesisFailed(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", msg),
            Self::SynthesisFailed(msg) => (StatusCode::BAD_GATEWAY, "synthesis_failed", msg),
        };

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
