//! Archive streaming handlers.
//!
//! The engine streams through blocking readers and writers. Request bodies
//! are bridged into a blocking reader, and responses are fed chunk by chunk
//! through a bounded channel, so neither side buffers a whole archive.

use std::io::{self, Write};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use baggageclaim::stream::Encoding;
use baggageclaim_common::ClaimError;
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};

use super::{ApiError, AppState, blocking};

const CHUNK_SIZE: usize = 64 * 1024;
const CHUNKS_IN_FLIGHT: usize = 4;

#[derive(Debug, Default, Deserialize)]
pub struct StreamInParams {
    #[serde(default)]
    path: String,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamOutParams {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct P2pOutParams {
    #[serde(default)]
    path: String,
    #[serde(default, rename = "streamInURL")]
    stream_in_url: String,
    #[serde(default)]
    encoding: String,
}

fn encoding_from(headers: &HeaderMap, name: header::HeaderName) -> Result<Encoding, ApiError> {
    let value = headers
        .get(&name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    value.parse::<Encoding>().map_err(|err| {
        tracing::info!(header = name.as_str(), value, "Unsupported stream encoding");
        ApiError::from(err)
    })
}

pub async fn stream_in(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(params): Query<StreamInParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let encoding = encoding_from(&headers, header::CONTENT_ENCODING)?;
    tracing::debug!(handle, path = %params.path, %encoding, limit = params.limit, "Streaming in");

    let body = body.into_data_stream().map_err(io::Error::other);
    let mut reader = SyncIoBridge::new(StreamReader::new(body));

    let repo = Arc::clone(&state.repo);
    blocking(move || {
        repo.stream_in(&handle, &params.path, encoding, params.limit, &mut reader)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn stream_out(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(params): Query<StreamOutParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let encoding = encoding_from(&headers, header::ACCEPT_ENCODING)?;
    tracing::debug!(handle, path = %params.path, %encoding, "Streaming out");

    let (tx, mut rx) = mpsc::channel(CHUNKS_IN_FLIGHT);
    let repo = Arc::clone(&state.repo);
    let archiving = tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx);
        let result = repo
            .stream_out(&handle, &params.path, encoding, &mut writer)
            .and_then(|()| writer.flush().map_err(ClaimError::from));
        if let Err(err) = &result {
            writer.abort(err);
        }
        result
    });

    // Errors before the first chunk still get a proper status.
    let Some(first) = rx.recv().await else {
        return match archiving.await {
            Ok(Ok(())) => Ok(StatusCode::OK.into_response()),
            Ok(Err(err)) => Err(err.into()),
            Err(err) => {
                tracing::error!(error = %err, "Stream out task failed");
                Err(ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to stream out from volume",
                ))
            }
        };
    };

    let chunks = stream::once(async move { first }).chain(ReceiverStream::new(rx));
    Ok((StatusCode::OK, Body::from_stream(chunks)).into_response())
}

pub async fn stream_p2p_out(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(params): Query<P2pOutParams>,
) -> Result<StatusCode, ApiError> {
    for (name, value) in [
        ("path", &params.path),
        ("streamInURL", &params.stream_in_url),
        ("encoding", &params.encoding),
    ] {
        if value.is_empty() {
            tracing::info!(handle, param = name, "Missing parameter");
            return Err(ApiError::bad_request(format!("missing parameter: {name}")));
        }
    }
    let encoding: Encoding = params.encoding.parse()?;

    tracing::debug!(handle, url = %params.stream_in_url, %encoding, "Streaming to peer");
    let repo = Arc::clone(&state.repo);
    blocking(move || repo.stream_p2p_out(&handle, &params.path, encoding, &params.stream_in_url))
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Blocking writer that forwards fixed-size chunks to a response body.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: BytesMut,
    sent: bool,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            sent: false,
        }
    }

    fn send(&mut self) -> io::Result<()> {
        let chunk = self.buf.split().freeze();
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))?;
        self.sent = true;
        Ok(())
    }

    /// Fail the response body if part of it has already gone out.
    fn abort(self, err: &ClaimError) {
        if self.sent {
            // The receiver may already be gone.
            let _ = self.tx.blocking_send(Err(io::Error::other(err.to_string())));
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.send()
    }
}
