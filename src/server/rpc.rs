//! `POST /rpc`: dispatch of `[method, arg1, arg2, ...]` calls.
//!
//! On success the response body is the method result as a bare JSON value;
//! on failure it is `{"error": {"code", "message", "details?"}}` with the
//! HTTP status derived from the code. Message rows travel as positional
//! arrays to keep large reads compact.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{auth, AppState};
use crate::message::{format_time, Message};
use crate::pubsub::WriteEvent;
use crate::store::{
    GetCategoryMessagesOpts, GetStreamMessagesOpts, ListStreamsOpts, WriteMessageOpts,
    MAX_BATCH_SIZE,
};
use crate::{stream_name, Error, Result};

pub async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle(&state, &headers, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Renders an error as the wire envelope with its mapped status code. Also
/// used by the SSE and import endpoints for pre-stream failures.
pub(crate) fn error_response(err: &Error) -> Response {
    let mut envelope = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(details) = err.details() {
        envelope["details"] = details;
    }

    (status_for(err), Json(json!({ "error": envelope }))).into_response()
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        Error::MethodNotFound(_) | Error::StreamNotFound(_) | Error::NamespaceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::AuthRequired | Error::InvalidToken => StatusCode::UNAUTHORIZED,
        Error::Unauthorized => StatusCode::FORBIDDEN,
        Error::VersionConflict { .. } | Error::NamespaceExists(_) | Error::PositionExists(_) => {
            StatusCode::CONFLICT
        }
        Error::Backend(_) | Error::Io(_) | Error::Decode { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Value> {
    let call: Vec<Value> = serde_json::from_slice(body).map_err(|err| {
        Error::invalid_request(format!("request body must be a JSON array: {err}"))
    })?;
    let (method, args) = call
        .split_first()
        .ok_or_else(|| Error::invalid_request("request array is empty"))?;
    let method = method
        .as_str()
        .ok_or_else(|| Error::invalid_request("method name must be a string"))?;

    match method {
        "sys.version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
        "sys.health" => sys_health(state).await,
        "stream.write" => stream_write(state, headers, args).await,
        "stream.get" => stream_get(state, headers, args).await,
        "stream.last" => stream_last(state, headers, args).await,
        "stream.version" => stream_version(state, headers, args).await,
        "category.get" => category_get(state, headers, args).await,
        "ns.create" => ns_create(state, args).await,
        "ns.delete" => ns_delete(state, headers, args).await,
        "ns.list" => ns_list(state).await,
        "ns.info" => ns_info(state, headers, args).await,
        "ns.streams" => ns_streams(state, headers, args).await,
        "ns.categories" => ns_categories(state, headers).await,
        other => Err(Error::MethodNotFound(other.to_string())),
    }
}

// --- argument coercion -------------------------------------------------

fn required_str<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        Error::invalid_request(format!("argument {index} ({name}) must be a string"))
    })
}

fn required_obj<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Map<String, Value>> {
    args.get(index).and_then(Value::as_object).ok_or_else(|| {
        Error::invalid_request(format!("argument {index} ({name}) must be an object"))
    })
}

fn optional_obj<'a>(
    args: &'a [Value],
    index: usize,
    name: &str,
) -> Result<Option<&'a Map<String, Value>>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::invalid_request(format!(
            "argument {index} ({name}) must be an object"
        ))),
    }
}

fn field_str<'a>(obj: Option<&'a Map<String, Value>>, key: &str) -> Result<Option<&'a str>> {
    match obj.and_then(|obj| obj.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(Error::invalid_request(format!("{key} must be a string"))),
    }
}

fn field_i64(obj: Option<&Map<String, Value>>, key: &str) -> Result<Option<i64>> {
    match obj.and_then(|obj| obj.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            Error::invalid_request(format!("{key} must be a 64-bit integer"))
        }),
    }
}

fn field_object(obj: Option<&Map<String, Value>>, key: &str) -> Result<Option<Value>> {
    match obj.and_then(|obj| obj.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(_) => Err(Error::invalid_request(format!("{key} must be an object"))),
    }
}

fn batch_size_field(obj: Option<&Map<String, Value>>) -> Result<Option<i64>> {
    let batch_size = field_i64(obj, "batchSize")?;
    if let Some(n) = batch_size {
        if n != -1 && !(1..=MAX_BATCH_SIZE).contains(&n) {
            return Err(Error::InvalidRequest {
                message: format!("batchSize must be -1 or between 1 and {MAX_BATCH_SIZE}"),
                details: Some(json!({ "batchSize": n })),
            });
        }
    }
    Ok(batch_size)
}

// --- result rows -------------------------------------------------------

fn stream_row(message: &Message) -> Value {
    json!([
        message.id,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        format_time(&message.time),
    ])
}

fn category_row(message: &Message) -> Value {
    json!([
        message.id,
        message.stream_name,
        message.msg_type,
        message.position,
        message.global_position,
        message.data,
        message.metadata,
        format_time(&message.time),
    ])
}

// --- methods -----------------------------------------------------------

async fn sys_health(state: &AppState) -> Result<Value> {
    Ok(json!({
        "status": "ok",
        "backend": state.store.backend(),
        "connections": state.store.open_handles().await,
    }))
}

async fn stream_write(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let stream = required_str(args, 0, "stream")?;
    let message = required_obj(args, 1, "message")?;
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::invalid_request("message.type must be a non-empty string"))?;
    let data = field_object(Some(message), "data")?;
    let metadata = field_object(Some(message), "metadata")?;

    let opts_obj = optional_obj(args, 2, "opts")?;
    let id = field_str(opts_obj, "id")?
        .map(|raw| {
            raw.parse::<Uuid>()
                .map_err(|_| Error::invalid_request("opts.id must be a UUID"))
        })
        .transpose()?;
    let expected_version = field_i64(opts_obj, "expectedVersion")?;

    let opts = WriteMessageOpts {
        id,
        metadata,
        expected_version,
    };
    let written = state
        .store
        .write_message(&namespace, stream, msg_type, data.as_ref(), &opts)
        .await?;

    state.pubsub.publish(&WriteEvent {
        namespace,
        stream: stream.to_string(),
        category: stream_name::category(stream).to_string(),
        position: written.position,
        global_position: written.global_position,
    });

    Ok(json!({
        "position": written.position,
        "globalPosition": written.global_position,
    }))
}

async fn stream_get(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let stream = required_str(args, 0, "stream")?;
    let opts_obj = optional_obj(args, 1, "opts")?;

    let opts = GetStreamMessagesOpts {
        position: field_i64(opts_obj, "position")?,
        global_position: field_i64(opts_obj, "globalPosition")?,
        batch_size: batch_size_field(opts_obj)?,
    };
    let messages = state
        .store
        .get_stream_messages(&namespace, stream, &opts)
        .await?;

    Ok(Value::Array(messages.iter().map(stream_row).collect()))
}

async fn stream_last(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let stream = required_str(args, 0, "stream")?;
    let opts_obj = optional_obj(args, 1, "opts")?;
    let msg_type = field_str(opts_obj, "type")?;

    let message = state
        .store
        .get_last_stream_message(&namespace, stream, msg_type)
        .await?;

    Ok(stream_row(&message))
}

async fn stream_version(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let stream = required_str(args, 0, "stream")?;

    let version = state.store.get_stream_version(&namespace, stream).await?;
    if version < 0 {
        Ok(Value::Null)
    } else {
        Ok(json!(version))
    }
}

async fn category_get(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let category = required_str(args, 0, "category")?;
    let opts_obj = optional_obj(args, 1, "opts")?;

    // `position` and `globalPosition` are synonyms here; a category read is
    // always ordered and filtered by global position.
    let position = match field_i64(opts_obj, "globalPosition")? {
        Some(global_position) => Some(global_position),
        None => field_i64(opts_obj, "position")?,
    };

    let consumer_group = match opts_obj.and_then(|obj| obj.get("consumerGroup")) {
        None | Some(Value::Null) => None,
        Some(Value::Object(group)) => {
            let member = group.get("member").and_then(Value::as_i64).ok_or_else(|| {
                Error::invalid_request("consumerGroup.member must be a 64-bit integer")
            })?;
            let size = group.get("size").and_then(Value::as_i64).ok_or_else(|| {
                Error::invalid_request("consumerGroup.size must be a 64-bit integer")
            })?;
            if size <= 0 || member < 0 || member >= size {
                return Err(Error::InvalidRequest {
                    message: "consumerGroup requires 0 <= member < size".to_string(),
                    details: Some(json!({ "member": member, "size": size })),
                });
            }
            Some((member, size))
        }
        Some(_) => {
            return Err(Error::invalid_request("consumerGroup must be an object"));
        }
    };

    let opts = GetCategoryMessagesOpts {
        position,
        batch_size: batch_size_field(opts_obj)?,
        correlation: field_str(opts_obj, "correlation")?.map(str::to_string),
        consumer_group_member: consumer_group.map(|(member, _)| member),
        consumer_group_size: consumer_group.map(|(_, size)| size),
    };
    let messages = state
        .store
        .get_category_messages(&namespace, category, &opts)
        .await?;

    Ok(Value::Array(messages.iter().map(category_row).collect()))
}

async fn ns_create(state: &AppState, args: &[Value]) -> Result<Value> {
    let id = required_str(args, 0, "id")?;
    let opts_obj = optional_obj(args, 1, "opts")?;
    let description = field_str(opts_obj, "description")?.unwrap_or("");
    let metadata = field_object(opts_obj, "metadata")?;

    let token = match field_str(opts_obj, "token")? {
        Some(token) => {
            if auth::token_namespace(token).ok() != Some(id) {
                return Err(Error::invalid_request(
                    "opts.token must start with the namespace id followed by a dot",
                ));
            }
            token.to_string()
        }
        None => auth::mint_token(id),
    };

    let record = state
        .store
        .create_namespace(id, &auth::token_hash(&token), description, metadata)
        .await?;

    Ok(json!({
        "namespace": record.id,
        "token": token,
        "createdAt": format_time(&record.created_at),
    }))
}

async fn ns_delete(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let id = required_str(args, 0, "id")?;
    require_namespace_access(state, headers, id).await?;

    let deleted = state.store.delete_namespace(id).await?;

    Ok(json!({
        "namespace": id,
        "deletedAt": format_time(&Utc::now()),
        "messagesDeleted": deleted,
    }))
}

async fn ns_list(state: &AppState) -> Result<Value> {
    let records = state.store.list_namespaces().await?;
    let mut namespaces = Vec::with_capacity(records.len());
    for record in records {
        let message_count = state.store.message_count(&record.id).await?;
        namespaces.push(json!({
            "namespace": record.id,
            "description": record.description,
            "createdAt": format_time(&record.created_at),
            "messageCount": message_count,
        }));
    }

    Ok(Value::Array(namespaces))
}

async fn ns_info(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let id = required_str(args, 0, "id")?;
    require_namespace_access(state, headers, id).await?;

    let record = state.store.get_namespace(id).await?;
    let stats = state.store.namespace_stats(id).await?;

    Ok(json!({
        "namespace": record.id,
        "description": record.description,
        "createdAt": format_time(&record.created_at),
        "messageCount": stats.message_count,
        "streamCount": stats.stream_count,
        "lastActivity": stats.last_activity.as_ref().map(format_time),
    }))
}

async fn ns_streams(state: &AppState, headers: &HeaderMap, args: &[Value]) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let opts_obj = optional_obj(args, 0, "opts")?;

    let limit = field_i64(opts_obj, "limit")?;
    if let Some(limit) = limit {
        if !(1..=1000).contains(&limit) {
            return Err(Error::InvalidRequest {
                message: "limit must be between 1 and 1000".to_string(),
                details: Some(json!({ "limit": limit })),
            });
        }
    }

    let opts = ListStreamsOpts {
        prefix: field_str(opts_obj, "prefix")?.map(str::to_string),
        cursor: field_str(opts_obj, "cursor")?.map(str::to_string),
        limit,
    };
    let streams = state.store.list_streams(&namespace, &opts).await?;

    Ok(Value::Array(
        streams
            .iter()
            .map(|info| {
                json!({
                    "stream": info.stream_name,
                    "version": info.version,
                    "lastActivity": format_time(&info.last_activity),
                })
            })
            .collect(),
    ))
}

async fn ns_categories(state: &AppState, headers: &HeaderMap) -> Result<Value> {
    let namespace = auth::authenticate(state, headers, None).await?;
    let categories = state.store.list_categories(&namespace).await?;

    Ok(Value::Array(
        categories
            .iter()
            .map(|info| {
                json!({
                    "category": info.category,
                    "streamCount": info.stream_count,
                    "messageCount": info.message_count,
                })
            })
            .collect(),
    ))
}

/// Namespace-admin methods (`ns.delete`, `ns.info`) require the token of
/// the very namespace they name. Test mode waives the check.
async fn require_namespace_access(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> Result<()> {
    if state.test_mode {
        return Ok(());
    }

    let namespace = auth::authenticate(state, headers, None).await?;
    if namespace != id {
        return Err(Error::Unauthorized);
    }
    Ok(())
}
