//! Bearer-token authentication for the control API.
//!
//! Every request resolves to an operator identity; desired-state mutations
//! log it for audit. Tokens are static credentials from controller
//! configuration.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::config::OperatorToken;
use crate::error::ErrorBody;

/// The operator a request was attributed to.
#[derive(Debug, Clone)]
pub struct OperatorIdentity(pub String);

/// token → operator name.
pub type OperatorTokens = Arc<HashMap<String, String>>;

pub fn operator_tokens(operators: &[OperatorToken]) -> OperatorTokens {
    Arc::new(
        operators
            .iter()
            .map(|o| (o.token.clone(), o.name.clone()))
            .collect(),
    )
}

pub async fn require_operator(
    State(tokens): State<OperatorTokens>,
    mut request: Request,
    next: Next,
) -> Response {
    let operator = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| tokens.get(token).cloned());

    match operator {
        Some(name) => {
            request.extensions_mut().insert(OperatorIdentity(name));
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("unauthorized", "missing or invalid bearer token")),
        )
            .into_response(),
    }
}
