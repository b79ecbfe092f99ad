use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;
use tracing::warn;

/// Liveness plus a summary of the upstream wiring. Storage is probed on every
/// call; a failed probe reports `degraded` with 503.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let storage = match state.pipeline.store().ping().await {
        Ok(()) => json!({ "status": "ok", "path": config.storage.database_path }),
        Err(err) => {
            warn!(error = %err, "Storage health probe failed");
            json!({
                "status": "error",
                "path": config.storage.database_path,
                "error": err.to_string()
            })
        }
    };
    let healthy = storage["status"] == "ok";

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "companion-voice-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_sessions": metrics.active_sessions,
            "utterances_processed": metrics.utterances_processed,
            "pipeline_failures": metrics.pipeline_failures
        },
        "memory": get_memory_info(),
        "storage": storage,
        "services": services_summary(&config, state.pipeline.synthesis_enabled()),
        "system": get_system_status(&config, &metrics)
    });

    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

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
            "error_rate": error_rate(&metrics),
            "active_sessions": metrics.active_sessions,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "conversation": {
            "utterances_processed": metrics.utterances_processed,
            "fallback_replies": metrics.fallback_replies,
            "unpersisted_replies": metrics.unpersisted_replies,
            "pipeline_failures": metrics.pipeline_failures,
            "rejected_utterances": metrics.rejected_utterances
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "max_request_bytes": config.performance.max_request_bytes
        }
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

/// Models and whether a key is present. Keys and URLs with credentials never appear.
fn services_summary(config: &AppConfig, synthesis_enabled: bool) -> serde_json::Value {
    let services = &config.services;
    json!({
        "transcription": {
            "model": services.transcription.model,
            "api_key_configured": services.transcription.api_key.is_some()
        },
        "llm": {
            "model": services.llm.model,
            "api_key_configured": services.llm.api_key.is_some()
        },
        "tts": {
            "enabled": synthesis_enabled,
            "model": services.tts.model_id,
            "output_format": services.tts.output_format,
            "api_key_configured": services.tts.api_key.is_some()
        },
        "request_timeout_secs": services.request_timeout_secs
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_reports_storage_and_services() {
        let mut config = AppConfig::default();
        config.services.transcription.api_key = Some("gsk-secret".to_string());
        let (_dir, state) = test_state(config);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body = actix_test::read_body(resp).await;
        assert!(!String::from_utf8_lossy(&body).contains("gsk-secret"));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["storage"]["status"], "ok");
        assert_eq!(value["services"]["transcription"]["api_key_configured"], true);
        assert_eq!(value["services"]["tts"]["enabled"], false);
    }

    #[test]
    fn test_system_status_load_levels() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 10;
        let metrics = AppMetrics {
            active_sessions: 9,
            ..AppMetrics::default()
        };
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "moderate_load");
        assert_eq!(status["session_usage_percent"], 90.0);
        assert_eq!(status["load_warnings"].as_array().unwrap().len(), 1);
    }
}
