pub mod conversation;
pub mod events;
pub mod settings;
pub mod upload;

pub use conversation::*;
pub use events::*;
pub use settings::*;
pub use upload::*;

use crate::error::{AppError, AppResult};
use actix_web::{HttpRequest, HttpResponse};

/// Fallback for unknown routes, rendered as the standard JSON error body.
pub async fn not_found(req: HttpRequest) -> AppResult<HttpResponse> {
    Err(AppError::NotFound(format!("{} {}", req.method(), req.path())))
}
