use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use fellowship_shared::{ErrorKind, Rejection};

#[derive(Debug, Error)]
pub enum ServerError {
    /// A domain rejection from the gateway.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Rejected(r) => match r.kind {
                ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
                ErrorKind::Forbidden if r.is_entitlement() => StatusCode::PAYMENT_REQUIRED,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
                ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ServerError::Rejected(r) => serde_json::json!({
                "kind": r.kind,
                "reason": r.reason,
                "feature": r.feature,
            }),
            ServerError::BadRequest(_) => serde_json::json!({
                "kind": ErrorKind::InvalidArgument,
                "reason": self.to_string(),
            }),
            ServerError::Forbidden(_) => serde_json::json!({
                "kind": ErrorKind::Forbidden,
                "reason": self.to_string(),
            }),
        };

        (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fellowship_shared::Feature;

    #[test]
    fn entitlement_denial_is_payment_required() {
        let plain = ServerError::from(Rejection::forbidden("not a moderator"));
        let paywall = ServerError::from(Rejection::entitlement(Feature::MediaMessages));
        assert_eq!(plain.status(), StatusCode::FORBIDDEN);
        assert_eq!(paywall.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn kinds_map_to_statuses() {
        let cases = [
            (Rejection::unauthenticated(), StatusCode::UNAUTHORIZED),
            (Rejection::not_found("x"), StatusCode::NOT_FOUND),
            (Rejection::conflict("x"), StatusCode::CONFLICT),
            (Rejection::invalid("x"), StatusCode::BAD_REQUEST),
            (Rejection::unavailable("x"), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (rejection, status) in cases {
            assert_eq!(ServerError::from(rejection).status(), status);
        }
    }
}
