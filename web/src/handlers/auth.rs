//! Token validation endpoint.

use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use rushtix_core::{Role, UserId};
use serde::{Deserialize, Serialize};

/// Request body for `POST /api/v1/auth/validate`.
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    /// The bearer token to validate
    pub token: String,
}

/// Response for a valid token.
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    /// Subject user id
    pub user_id: UserId,
    /// Email claim
    pub email: String,
    /// Role claim
    pub role: Role,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
}

/// `POST /api/v1/auth/validate`
///
/// # Errors
///
/// 401 `INVALID_TOKEN` for anything that does not verify.
pub async fn validate(
    State(state): State<AppState>,
    Json(body): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let claims = state.verifier.verify(&body.token)?;
    Ok(Json(ValidateResponse {
        user_id: claims.user_id,
        email: claims.email,
        role: claims.role,
        expires_at: claims.expires_at,
    }))
}
