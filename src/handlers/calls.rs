use crate::error::{AppError, AppResult};
use crate::registry::OutboundFrame;
use crate::speech::synthesis::encode_media_frames;
use crate::state::AppState;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
}

pub async fn list_calls(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let calls = state.registry().active_calls();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": calls.len(),
        "calls": calls
    })))
}

pub async fn speak(
    path: web::Path<String>,
    body: web::Json<SpeakRequest>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let call_sid = path.into_inner();
    let text = body.into_inner().text;

    if text.trim().is_empty() {
        return Err(AppError::ValidationError(
            "Text must not be empty".to_string(),
        ));
    }

    // Resolve the call before paying for synthesis.
    let handle = state
        .registry()
        .outbound_handle(&call_sid)
        .ok_or_else(|| AppError::NotFound(format!("No active call '{}'", call_sid)))?;

    let audio = state
        .synthesizer()
        .synthesize(&text)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    let frame_bytes = state.get_config().audio.frame_bytes();
    let frames = encode_media_frames(&handle.stream_sid, &audio, frame_bytes);
    let frame_count = frames.len();

    for frame in &frames {
        let message =
            serde_json::to_string(frame).map_err(|e| AppError::Internal(e.to_string()))?;
        handle.sender.send(OutboundFrame(message)).map_err(|_| {
            AppError::NotFound(format!("Call '{}' ended during synthesis", call_sid))
        })?;
    }

    info!(
        call_sid = %call_sid,
        frames = frame_count,
        bytes = audio.len(),
        "Queued synthesized audio for playback"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "queued",
        "call_sid": call_sid,
        "frames": frame_count,
        "bytes": audio.len()
    })))
}
