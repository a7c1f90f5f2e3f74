use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let call_load = get_call_load(&config, &metrics);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "call-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": metrics.active_calls,
            "active_subscribers": metrics.active_subscribers
        },
        "relay": {
            "registered_sessions": state.registry().session_count(),
            "attached_subscribers": state.registry().subscriber_count()
        },
        "speech": {
            "listen_url": config.speech.listen_url,
            "speak_url": config.speech.speak_url,
            "tts_model": config.speech.tts_model,
            "api_key_configured": !config.speech.api_key.is_empty()
        },
        "system": call_load
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": metrics.active_calls,
            "active_subscribers": metrics.active_subscribers,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "limits": {
            "max_concurrent_calls": state.get_config().limits.max_concurrent_calls
        }
    }))
}

fn get_call_load(
    config: &crate::config::AppConfig,
    metrics: &crate::state::AppMetrics,
) -> serde_json::Value {
    let call_usage = if config.limits.max_concurrent_calls > 0 {
        metrics.active_calls as f64 / config.limits.max_concurrent_calls as f64
    } else {
        0.0
    };

    let status = if call_usage > 0.9 {
        "high_load"
    } else if call_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut load_warnings: Vec<String> = Vec::new();
    if call_usage > 0.8 {
        load_warnings
            .push("High call volume - consider increasing max_concurrent_calls".to_string());
    }
    if config.speech.api_key.is_empty() {
        load_warnings.push("Speech API key is not configured".to_string());
    }

    json!({
        "status": status,
        "call_usage_percent": (call_usage * 100.0).round(),
        "max_concurrent_calls": config.limits.max_concurrent_calls,
        "current_calls": metrics.active_calls,
        "load_warnings": load_warnings
    })
}
