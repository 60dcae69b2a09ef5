//! HTTP front-end: translates requests into coordinator commands and
//! scan results into JSON bodies.
//!
//! A scan whose status is `ERROR` is a successful scan reporting a
//! per-file problem; it maps to 200 like any other result. Only a
//! failed command maps to 500.

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::clamd::{ClamdBroker, ScanResult, ScanStatus};

type SharedBroker = Arc<dyn ClamdBroker>;

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct ScanResponse {
    status: ScanStatus,
    virus: String,
    error: String,
    filename: String,
}

impl ScanResponse {
    fn new(scan: ScanResult, filename: String) -> Self {
        Self {
            status: scan.status,
            virus: scan.virus,
            error: scan.error,
            filename,
        }
    }
}

pub fn router(broker: SharedBroker, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/api/v1/ping", get(handle_ping))
        .route("/api/v1/version", get(handle_version))
        .route("/api/v1/stats", get(handle_stats))
        .route("/api/v1/scan", post(handle_scan))
        .with_state(broker)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn handle_ping(State(broker): State<SharedBroker>) -> Response {
    match broker.ping().await {
        Ok(pong) => {
            debug!(ping = %pong, "ping success");
            message_response(pong)
        }
        Err(err) => {
            error!(error = %err, "error pinging clamd");
            internal_error()
        }
    }
}

async fn handle_version(State(broker): State<SharedBroker>) -> Response {
    match broker.version().await {
        Ok(version) => message_response(version),
        Err(err) => {
            error!(error = %err, "error querying clamd version");
            internal_error()
        }
    }
}

async fn handle_stats(State(broker): State<SharedBroker>) -> Response {
    match broker.stats().await {
        Ok(stats) => message_response(stats),
        Err(err) => {
            error!(error = %err, "error querying clamd stats");
            internal_error()
        }
    }
}

async fn handle_scan(State(broker): State<SharedBroker>, mut multipart: Multipart) -> Response {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return bad_request("missing 'file' form field"),
            Err(err) => {
                debug!(error = %err, "malformed multipart body");
                return bad_request("malformed multipart body");
            }
        }
    };

    let filename = field.file_name().unwrap_or("stream").to_string();
    let data: Bytes = match field.bytes().await {
        Ok(data) => data,
        Err(err) => {
            debug!(filename = %filename, error = %err, "unable to read upload");
            return bad_request("unable to read upload");
        }
    };

    debug!(filename = %filename, size = data.len(), "scanning file");

    match broker.instream(Box::new(Cursor::new(data))).await {
        Ok(scan) => {
            debug!(
                filename = %filename,
                status = %scan.status,
                virus = %scan.virus,
                error = %scan.error,
                "file scan complete"
            );
            (StatusCode::OK, Json(ScanResponse::new(scan, filename))).into_response()
        }
        Err(err) => {
            error!(filename = %filename, error = %err, "error scanning file");
            internal_error()
        }
    }
}

fn message_response(message: String) -> Response {
    (StatusCode::OK, Json(MessageResponse { message })).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    // opaque on purpose, details go to the log only
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
        }),
    )
        .into_response()
}
