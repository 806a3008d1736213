// Copyright (C) 2025-present The StreamAvg Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP surface of the collector.
//!
//! - `GET /getAggregation` returns the latest committed snapshot verbatim
//! - `GET /<anything else>?event_time=YYYY-mm-dd_HH-mm-ss&event_value=<n>`
//!   records a new event, when ingestion is enabled

use crate::{
    inputs::{
        recorder::{convert_event_time, EventRecorder},
        RecordError,
    },
    query::QueryService,
};
use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use opentelemetry::{
    metrics::{Counter, Meter},
    KeyValue,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

pub const AGGREGATION_PATH: &str = "/getAggregation";

const NOT_FOUND_BODY: &str = r#"{"error": "No aggregation data found"}"#;
const MISSING_PARAMETERS_BODY: &str = "Missing required parameters: event_time or event_value";

#[derive(Debug, Clone)]
pub struct IngestStats {
    pub events_saved: Counter<u64>,
    pub errors: Counter<u64>,
}

impl IngestStats {
    pub fn new(meter: Meter) -> Self {
        let events_saved = meter
            .u64_counter("streamavg.ingest.events.saved")
            .with_description("Number of events durably recorded")
            .build();
        let errors = meter
            .u64_counter("streamavg.ingest.errors")
            .with_description("Number of rejected or failed ingestion requests")
            .build();
        Self {
            events_saved,
            errors,
        }
    }
}

#[derive(Debug, strum_macros::Display)]
pub enum IngestError {
    #[strum(to_string = "{source}")]
    InvalidTime { source: RecordError },

    #[strum(to_string = "{source}")]
    InvalidField { source: RecordError },

    #[strum(to_string = "{source}")]
    WriteFailed { source: RecordError },
}

impl std::error::Error for IngestError {}

impl IngestError {
    pub const fn category(&self) -> &'static str {
        match self {
            Self::InvalidTime { .. } => "invalid_time",
            Self::InvalidField { .. } => "invalid_field",
            Self::WriteFailed { .. } => "write_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpState {
    query: QueryService,
    recorder: Option<Arc<EventRecorder>>,
    stats: IngestStats,
}

impl HttpState {
    /// `recorder` is `None` when ingestion is disabled
    pub fn new(query: QueryService, recorder: Option<Arc<EventRecorder>>, stats: IngestStats) -> Self {
        Self {
            query,
            recorder,
            stats,
        }
    }
}

pub fn router(state: HttpState, request_timeout: Duration) -> Router {
    let ingest_enabled = state.recorder.is_some();
    let router = Router::new().route(AGGREGATION_PATH, get(get_aggregation));
    let router = if ingest_enabled {
        router.fallback(ingest)
    } else {
        router
    };
    router
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, in-flight requests are allowed to finish
pub async fn serve(
    address: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<String> {
    let listener = TcpListener::bind(address).await?;
    info!("[http] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok("HTTP server terminated successfully".to_string())
}

async fn get_aggregation(State(state): State<HttpState>) -> Response {
    match state.query.get_latest().await {
        Ok(Some(content)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            content,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            NOT_FOUND_BODY,
        )
            .into_response(),
        Err(err) => {
            error!("[http] Failed to read the latest snapshot: {err}");
            let message = serde_json::Value::String(err.to_string());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "application/json")],
                format!(r#"{{"error": {message}}}"#),
            )
                .into_response()
        }
    }
}

/// First non-empty value of a query parameter
fn first_value<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.as_str())
}

async fn ingest(
    State(state): State<HttpState>,
    method: Method,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(recorder) = state.recorder.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (Some(event_time), Some(event_value)) = (
        first_value(&params, "event_time"),
        first_value(&params, "event_value"),
    ) else {
        debug!("[http] Rejecting event with missing parameters");
        state
            .stats
            .errors
            .add(1, &[KeyValue::new("error.type", "missing_parameters")]);
        return (
            StatusCode::BAD_REQUEST,
            [
                (header::CONTENT_TYPE, "text/plain"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            MISSING_PARAMETERS_BODY,
        )
            .into_response();
    };

    match record_event(recorder, event_time, event_value).await {
        Ok(path) => {
            state.stats.events_saved.add(1, &[]);
            debug!("[http] Event saved: {event_time}, {event_value} in {:?}", path);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/plain"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                format!("Event saved to {}", path.display()),
            )
                .into_response()
        }
        Err(err) => {
            warn!("[http] Error processing event: {err}");
            state
                .stats
                .errors
                .add(1, &[KeyValue::new("error.type", err.category())]);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                format!("Error processing request: {err}"),
            )
                .into_response()
        }
    }
}

async fn record_event(
    recorder: &EventRecorder,
    event_time: &str,
    event_value: &str,
) -> Result<std::path::PathBuf, IngestError> {
    let event_time =
        convert_event_time(event_time).map_err(|source| IngestError::InvalidTime { source })?;
    recorder
        .record(&event_time, event_value)
        .await
        .map_err(|source| match source {
            RecordError::IoError { .. } => IngestError::WriteFailed { source },
            _ => IngestError::InvalidField { source },
        })
}
