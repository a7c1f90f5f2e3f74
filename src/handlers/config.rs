use crate::state::AppState;

use actix_web::{web, HttpResponse, Result};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.sanitized()
    })))
}
