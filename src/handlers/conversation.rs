use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `POST /reset-conversation`: forget every previous turn.
///
/// A session that is still running keeps the history it started with, and its
/// turns are not recorded when it finishes.
pub async fn reset_conversation(state: web::Data<AppState>) -> HttpResponse {
    state.orchestrator.reset_conversation();
    HttpResponse::Ok().json(json!({ "status": "processing" }))
}
