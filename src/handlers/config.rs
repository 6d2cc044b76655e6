use crate::{config::AppConfig, error::AppError, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The provider credential is reported
/// only as present or absent.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": config.server,
        "upstream": {
            "endpoint": config.upstream.endpoint,
            "model_id": config.upstream.model_id,
            "voice_name": config.upstream.voice_name,
            "api_key_configured": !config.upstream.api_key.is_empty()
        },
        "session": config.session,
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to connections opened from now on",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
