use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration, credential masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.config.redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": serde_json::to_value(&config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::inference::engine::EngineHandle;
    use crate::relay::channel::EventChannel;
    use crate::relay::conversation::ConversationState;
    use crate::relay::orchestrator::Orchestrator;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_is_redacted() {
        let mut config = AppConfig::default();
        config.synthesis.api_key = "sk-live-secret".to_string();
        let orchestrator = Orchestrator::new(&config, EngineHandle::empty(), ConversationState::new(), EventChannel::new(4));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config, orchestrator)))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let request = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["config"]["synthesis"]["api_key"], "***");
        assert_eq!(body["config"]["server"]["port"], 7799);
    }
}
