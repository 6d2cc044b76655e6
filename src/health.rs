use crate::config::AppConfig;
use crate::state::{AppState, RelayMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "interview-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "relay": {
            "active_connections": metrics.active_connections,
            "total_connections": metrics.total_connections,
            "upstream_errors": metrics.upstream_errors
        },
        "upstream": {
            "model": config.upstream.model_id,
            "credential_configured": !config.upstream.api_key.is_empty()
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "relay": metrics,
        "rates": {
            "connections_per_minute": if uptime_seconds > 0 {
                metrics.total_connections as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            },
            "upstream_error_rate": if metrics.upstream_sessions_opened > 0 {
                metrics.upstream_errors as f64 / metrics.upstream_sessions_opened as f64
            } else {
                0.0
            },
            "timeout_rate": if metrics.upstream_sessions_opened > 0 {
                metrics.session_timeouts as f64 / metrics.upstream_sessions_opened as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info(),
        "session": {
            "inactivity_warning_secs": config.session.inactivity_warning_secs,
            "session_timeout_secs": config.session.session_timeout_secs,
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        }
    }))
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
        "note": format!("Memory info not available (pid {})", process::id())
    })
}

fn get_system_status(config: &AppConfig, metrics: &RelayMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_connections as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_connections,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - new relay connections will be refused at the limit"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_status_thresholds() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 10;
        let mut metrics = RelayMetrics::default();

        assert_eq!(get_system_status(&config, &metrics)["status"], "normal");
        metrics.active_connections = 8;
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "moderate_load");
        assert_eq!(status["session_usage_percent"], 80.0);
        metrics.active_connections = 10;
        assert_eq!(get_system_status(&config, &metrics)["status"], "at_capacity");
    }
}
