//! Admin HTTP API.
//!
//! A thin CRUD surface over the index:
//!
//! - `GET    /api`            - list domains with their records
//! - `POST   /api`            - create a domain (201, 400 on invalid/exists)
//! - `PUT    /api/{domain}/`  - rename a domain (202, 400 on failure)
//! - `DELETE /api/{domain}/`  - delete a domain (202, 404 when absent)
//!
//! Domain syntax validation happens here; the index itself only knows about
//! canonical names.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::error::Error;
use crate::index::{DomainIndex, IndexEntry};

/// Longest accepted domain name, trailing dot excluded.
const MAX_DOMAIN_LEN: usize = 253;

/// Longest accepted label.
const MAX_LABEL_LEN: usize = 63;

#[derive(Clone)]
struct ApiState {
    index: Arc<DomainIndex>,
}

/// Request body carrying a domain name.
#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    /// The domain to create, or the new name for a rename.
    pub domain: String,
}

/// Body of `GET /api`.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Every indexed domain.
    pub list: Vec<IndexEntry>,
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric status as a string, mirroring the HTTP status.
    pub code: String,
    /// Short human-readable message.
    pub message: String,
    /// Optional detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn error_response(status: StatusCode, message: &str, description: Option<String>) -> Response {
    let body = ErrorBody {
        code: status.as_u16().to_string(),
        message: message.to_string(),
        description,
    };
    (status, Json(body)).into_response()
}

/// Validate a domain name: non-empty, bounded length, LDH labels
/// (underscore tolerated, as wildcards and service labels use it).
pub fn validate_domain(domain: &str) -> Result<(), Error> {
    if domain.is_empty() {
        return Err(Error::invalid_domain(domain, "domain is required"));
    }

    let name = domain.trim_end_matches('.');
    if name.is_empty() {
        return Err(Error::invalid_domain(domain, "only the root label"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(Error::invalid_domain(domain, "name too long"));
    }
    if !name.is_ascii() {
        return Err(Error::invalid_domain(
            domain,
            "IDN names must be A-label encoded",
        ));
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err(Error::invalid_domain(domain, "empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::invalid_domain(domain, "label too long"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::invalid_domain(
                domain,
                "label starts or ends with a hyphen",
            ));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_domain(domain, "label has invalid characters"));
        }
    }

    Ok(())
}

async fn list_entries(State(state): State<ApiState>) -> Json<ListResponse> {
    let mut list = state.index.list_entries();
    list.sort_by(|a, b| a.domain.cmp(&b.domain));
    Json(ListResponse { list })
}

async fn create_domain(
    State(state): State<ApiState>,
    Json(request): Json<DomainRequest>,
) -> Response {
    if let Err(err) = validate_domain(&request.domain) {
        warn!(domain = %request.domain, %err, "rejecting create");
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid domain",
            Some(err.to_string()),
        );
    }

    match state.index.create(&request.domain).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => {
            warn!(domain = %request.domain, %err, "could not create domain");
            error_response(StatusCode::BAD_REQUEST, "domain exists", None)
        }
    }
}

async fn rename_domain(
    State(state): State<ApiState>,
    Path(domain): Path<String>,
    Json(request): Json<DomainRequest>,
) -> Response {
    if let Err(err) = validate_domain(&request.domain) {
        warn!(domain = %request.domain, %err, "rejecting rename");
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid domain",
            Some(err.to_string()),
        );
    }

    match state.index.rename(&domain, &request.domain).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            warn!(old = %domain, new = %request.domain, %err, "could not rename domain");
            error_response(StatusCode::BAD_REQUEST, "could not rename domain", None)
        }
    }
}

async fn delete_domain(State(state): State<ApiState>, Path(domain): Path<String>) -> Response {
    match state.index.delete(&domain).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            warn!(%domain, %err, "could not delete domain");
            error_response(StatusCode::NOT_FOUND, "domain not found", None)
        }
    }
}

/// Build the admin router over the given index.
pub fn router(index: Arc<DomainIndex>) -> Router {
    Router::new()
        .route("/api", get(list_entries).post(create_domain))
        .route("/api/{domain}/", put(rename_domain).delete(delete_domain))
        .with_state(ApiState { index })
}

/// Serve the admin API until cancelled.
pub async fn serve(
    config: ApiConfig,
    index: Arc<DomainIndex>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(config.address).await?;
    info!(address = %config.address, "admin api listening");

    axum::serve(listener, router(index))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("admin api stopped");
    Ok(())
}
