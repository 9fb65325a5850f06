//! Volume lifecycle and metadata handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use baggageclaim::{Promise, Properties, Strategy, Volume};
use baggageclaim_common::{ClaimError, Handle};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, blocking, status_for};

#[derive(Debug, Deserialize)]
struct VolumeRequest {
    #[serde(default)]
    handle: String,
    #[serde(default)]
    strategy: serde_json::Value,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    privileged: bool,
}

#[derive(Debug, Serialize)]
struct VolumeFutureResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct PropertyRequest {
    value: String,
}

#[derive(Debug, Deserialize)]
struct PrivilegedRequest {
    value: bool,
}

#[derive(Debug)]
struct PreparedCreate {
    handle: String,
    strategy: Strategy,
    properties: Properties,
    privileged: bool,
}

fn prepare_create(body: &[u8]) -> Result<PreparedCreate, ApiError> {
    let request: VolumeRequest = serde_json::from_slice(body).map_err(|err| {
        tracing::error!(error = %err, "Failed to decode create request");
        ApiError::bad_request(format!("failed to create volume: {err}"))
    })?;

    let handle = if request.handle.is_empty() {
        Handle::generate().into_inner()
    } else {
        request.handle
    };

    let strategy = Strategy::from_json(request.strategy).map_err(|err| {
        tracing::error!(handle, error = %err, "Could not produce strategy");
        ApiError::from(err)
    })?;

    Ok(PreparedCreate {
        handle,
        strategy,
        properties: request.properties,
        privileged: request.privileged,
    })
}

pub async fn create_volume(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let create = prepare_create(&body)?;
    tracing::debug!(handle = %create.handle, privileged = create.privileged, "Creating volume");

    let repo = Arc::clone(&state.repo);
    let volume = blocking(move || {
        repo.create_volume(
            &create.handle,
            &create.strategy,
            create.properties,
            create.privileged,
        )
    })
    .await?;

    Ok((StatusCode::CREATED, Json(volume)))
}

pub async fn create_volume_async(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let create = prepare_create(&body)?;

    let promise = Arc::new(Promise::new());
    state
        .promises
        .add_promise(&create.handle, Arc::clone(&promise))
        .map_err(|err| {
            tracing::error!(handle = %create.handle, error = %err, "Failed to add promise");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

    let handle = create.handle.clone();
    let repo = Arc::clone(&state.repo);
    tokio::task::spawn_blocking(move || {
        repo.create_volume_for_promise(
            &promise,
            &create.handle,
            &create.strategy,
            create.properties,
            create.privileged,
        );
    });

    Ok((StatusCode::CREATED, Json(VolumeFutureResponse { handle })))
}

pub async fn check_volume_async(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Response, ApiError> {
    let Some(promise) = state.promises.get_promise(&handle) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    if promise.is_pending() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    match promise.value() {
        Ok(Ok(volume)) => Ok(Json(volume).into_response()),
        Ok(Err(err)) => Err(ApiError::new(status_for(&err), err.to_string())),
        Err(err) => {
            tracing::error!(handle, error = %err, "Failed to get value from promise");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

pub async fn cancel_volume_async(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, ApiError> {
    let Some(promise) = state.promises.get_promise(&handle) else {
        return Ok(StatusCode::NOT_FOUND);
    };

    if promise.is_pending() {
        promise.reject(ClaimError::PromiseCanceled).map_err(|err| {
            tracing::error!(handle, error = %err, "Failed to reject promise");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
    }

    state.promises.remove_promise(&handle);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_volumes(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Volume>>, ApiError> {
    let query = query_to_properties(pairs)?;

    let repo = Arc::clone(&state.repo);
    let (volumes, _corrupted) = blocking(move || repo.list_volumes(&query)).await?;

    Ok(Json(volumes))
}

/// Each query key may appear once.
fn query_to_properties(pairs: Vec<(String, String)>) -> Result<Properties, ApiError> {
    let mut properties = Properties::new();
    for (name, value) in pairs {
        if properties.get(&name).is_some() {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("multiple values given for property {name:?}"),
            ));
        }
        properties = properties.update_property(name, value);
    }
    Ok(properties)
}

pub async fn get_volume(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Json<Volume>, ApiError> {
    let repo = Arc::clone(&state.repo);
    let lookup = handle.clone();
    match blocking(move || repo.get_volume(&lookup)).await? {
        Some(volume) => Ok(Json(volume)),
        None => {
            tracing::info!(handle, "Volume not found");
            Err(ClaimError::not_found(handle).into())
        }
    }
}

pub async fn destroy_volume(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, ApiError> {
    let repo = Arc::clone(&state.repo);
    blocking(move || repo.destroy_volume(&handle)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn destroy_volumes(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let handles: Vec<String> = serde_json::from_slice(&body).map_err(|err| {
        tracing::error!(error = %err, "Failed to decode volumes to destroy");
        ApiError::bad_request(format!("failed to destroy volumes: {err}"))
    })?;

    let results = join_all(handles.into_iter().map(|handle| {
        let repo = Arc::clone(&state.repo);
        async move {
            let result = blocking({
                let handle = handle.clone();
                move || repo.destroy_volume(&handle)
            })
            .await;
            (handle, result)
        }
    }))
    .await;

    let mut failed = false;
    for (handle, result) in results {
        match result {
            Ok(()) => {}
            Err(err) if err.status == StatusCode::NOT_FOUND => {
                tracing::info!(handle, "Volume does not exist");
            }
            Err(err) => {
                tracing::error!(handle, error = %err.message, "Failed to destroy volume");
                failed = true;
            }
        }
    }

    if failed {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to destroy volumes",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_property(
    State(state): State<AppState>,
    Path((handle, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: PropertyRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("failed to set property on volume: {err}")))?;

    let repo = Arc::clone(&state.repo);
    blocking(move || repo.set_property(&handle, &name, &request.value)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_privileged(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Json<bool>, ApiError> {
    let repo = Arc::clone(&state.repo);
    let privileged = blocking(move || repo.get_privileged(&handle)).await?;
    Ok(Json(privileged))
}

pub async fn set_privileged(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: PrivilegedRequest = serde_json::from_slice(&body).map_err(|err| {
        ApiError::bad_request(format!("failed to change privileged status of volume: {err}"))
    })?;

    tracing::debug!(handle, privileged = request.value, "Setting privileged");
    let repo = Arc::clone(&state.repo);
    blocking(move || repo.set_privileged(&handle, request.value)).await?;
    Ok(StatusCode::NO_CONTENT)
}
