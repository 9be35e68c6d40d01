//! `POST /import`: streaming NDJSON bulk import.
//!
//! Each line is a fully-specified message `{id, stream, type, pos, gpos,
//! data, meta, time}`. Records accumulate into batches of 1000 that are
//! written atomically; the response is an SSE stream of `progress` events,
//! a terminal `done`, or an `error` carrying the failing line number.

use std::convert::Infallible;
use std::time::Instant;

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::rpc::error_response;
use super::{auth, AppState};
use crate::message::Message;
use crate::Result;

const IMPORT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct ImportRecord {
    id: Uuid,
    stream: String,
    #[serde(rename = "type")]
    msg_type: String,
    pos: i64,
    gpos: i64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    meta: Option<Value>,
    time: DateTime<Utc>,
}

impl From<ImportRecord> for Message {
    fn from(record: ImportRecord) -> Self {
        Message {
            id: record.id,
            stream_name: record.stream,
            msg_type: record.msg_type,
            position: record.pos,
            global_position: record.gpos,
            data: record.data,
            metadata: record.meta,
            time: record.time,
        }
    }
}

pub async fn import(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, Response>
{
    let namespace = auth::authenticate(&state, &headers, None)
        .await
        .map_err(|err| error_response(&err))?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run_import(state, namespace, body.into_data_stream(), tx));

    Ok(Sse::new(ReceiverStream::new(rx).map(Ok)))
}

async fn run_import(
    state: AppState,
    namespace: String,
    mut body: BodyDataStream,
    tx: mpsc::Sender<Event>,
) {
    let started = Instant::now();
    let mut pending: Vec<u8> = Vec::new();
    let mut batch: Vec<Message> = Vec::new();
    let mut imported: u64 = 0;
    let mut line: u64 = 0;
    let mut last_gpos: i64 = 0;

    loop {
        let (bytes, eof) = match body.next().await {
            Some(Ok(bytes)) => (bytes, false),
            Some(Err(err)) => {
                emit_error(&tx, line, &format!("request body error: {err}")).await;
                return;
            }
            None => (Bytes::new(), true),
        };
        pending.extend_from_slice(&bytes);

        loop {
            let Some(newline) = pending.iter().position(|b| *b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = pending.drain(..=newline).collect();
            line += 1;
            if let Err(message) = push_record(&raw[..newline], &mut batch) {
                emit_error(&tx, line, &message).await;
                return;
            }

            if batch.len() >= IMPORT_BATCH_SIZE {
                match flush(&state, &namespace, &mut batch, &mut imported, &mut last_gpos).await {
                    Ok(()) => {
                        if !emit(
                            &tx,
                            "progress",
                            json!({ "imported": imported, "gpos": last_gpos }),
                        )
                        .await
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        emit_error(&tx, line, &err.to_string()).await;
                        return;
                    }
                }
            }
        }

        if eof {
            // Final record without a trailing newline.
            if !pending.is_empty() {
                line += 1;
                let raw = std::mem::take(&mut pending);
                if let Err(message) = push_record(&raw, &mut batch) {
                    emit_error(&tx, line, &message).await;
                    return;
                }
            }
            if let Err(err) =
                flush(&state, &namespace, &mut batch, &mut imported, &mut last_gpos).await
            {
                emit_error(&tx, line, &err.to_string()).await;
                return;
            }

            debug!(namespace, imported, "import finished");
            emit(
                &tx,
                "done",
                json!({
                    "done": true,
                    "imported": imported,
                    "elapsed": started.elapsed().as_millis() as u64,
                }),
            )
            .await;
            return;
        }
    }
}

fn push_record(raw: &[u8], batch: &mut Vec<Message>) -> std::result::Result<(), String> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| "record is not valid UTF-8".to_string())?
        .trim();
    if text.is_empty() {
        return Ok(());
    }

    let record: ImportRecord =
        serde_json::from_str(text).map_err(|err| format!("invalid record: {err}"))?;
    batch.push(record.into());
    Ok(())
}

async fn flush(
    state: &AppState,
    namespace: &str,
    batch: &mut Vec<Message>,
    imported: &mut u64,
    last_gpos: &mut i64,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    state.store.import_batch(namespace, batch).await?;
    *imported += batch.len() as u64;
    if let Some(last) = batch.last() {
        *last_gpos = last.global_position;
    }
    batch.clear();
    Ok(())
}

async fn emit(tx: &mpsc::Sender<Event>, name: &str, payload: Value) -> bool {
    tx.send(Event::default().event(name).data(payload.to_string()))
        .await
        .is_ok()
}

async fn emit_error(tx: &mpsc::Sender<Event>, line: u64, message: &str) {
    warn!(line, message, "import aborted");
    emit(tx, "error", json!({ "error": message, "line": line })).await;
}
