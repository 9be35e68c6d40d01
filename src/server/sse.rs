//! `GET /subscribe`: catch-up plus live tail over Server-Sent Events.
//!
//! A connection subscribes to exactly one of a stream, a category, or the
//! whole namespace. The handler first pages through the log from the
//! requested position, emitting a `poke` per message, then tails the
//! in-process bus. The live subscription is registered before catch-up
//! starts and filtered by the catch-up cursor, so a message landing in
//! between is delivered once (twice at worst; never lost). Clients already
//! track positions, so duplicate pokes are harmless.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::rpc::error_response;
use super::{auth, AppState};
use crate::pubsub::{WriteEvent, SUBSCRIBER_CAPACITY};
use crate::store::{GetCategoryMessagesOpts, GetStreamMessagesOpts};
use crate::{hash, Error, Result};

const CATCH_UP_PAGE: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    stream: Option<String>,
    category: Option<String>,
    #[serde(default)]
    all: bool,
    position: Option<i64>,
    consumer: Option<i64>,
    size: Option<i64>,
    token: Option<String>,
}

#[derive(Clone, Debug)]
enum Scope {
    Stream(String),
    Category {
        name: String,
        consumer: Option<(i64, i64)>,
    },
    All,
}

impl Scope {
    fn from_params(params: &SubscribeParams) -> Result<Scope> {
        let selected = usize::from(params.stream.is_some())
            + usize::from(params.category.is_some())
            + usize::from(params.all);
        if selected != 1 {
            return Err(Error::invalid_request(
                "exactly one of stream, category or all=true is required",
            ));
        }

        let consumer = match (params.consumer, params.size) {
            (None, None) => None,
            (Some(member), Some(size)) => {
                if size <= 0 || member < 0 || member >= size {
                    return Err(Error::invalid_request(
                        "consumer and size require 0 <= consumer < size",
                    ));
                }
                Some((member, size))
            }
            _ => {
                return Err(Error::invalid_request(
                    "consumer and size must be given together",
                ));
            }
        };

        if let Some(category) = &params.category {
            return Ok(Scope::Category {
                name: category.clone(),
                consumer,
            });
        }
        if consumer.is_some() {
            return Err(Error::invalid_request(
                "consumer groups apply to category subscriptions only",
            ));
        }
        match &params.stream {
            Some(stream) => Ok(Scope::Stream(stream.clone())),
            None => Ok(Scope::All),
        }
    }

    /// The position a subscriber's cursor tracks: stream position for
    /// stream scopes, global position otherwise.
    fn event_position(&self, event: &WriteEvent) -> i64 {
        match self {
            Scope::Stream(_) => event.position,
            _ => event.global_position,
        }
    }

    fn wants(&self, event: &WriteEvent) -> bool {
        match self {
            Scope::Category {
                consumer: Some((member, size)),
                ..
            } => hash::is_assigned(&event.stream, *member, *size),
            _ => true,
        }
    }
}

/// The SSE event body: a minimal notification without the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct Poke {
    stream: String,
    position: i64,
    global_position: i64,
}

impl Poke {
    fn to_event(&self) -> Event {
        Event::default()
            .event("poke")
            .data(serde_json::to_string(self).unwrap_or_default())
    }
}

pub async fn subscribe(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
    headers: HeaderMap,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, Response>
{
    let namespace = auth::authenticate(&state, &headers, params.token.as_deref())
        .await
        .map_err(|err| error_response(&err))?;
    let scope = Scope::from_params(&params).map_err(|err| error_response(&err))?;
    let from = params.position.unwrap_or(0);

    let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
    tokio::spawn(run_subscription(state, namespace, scope, from, tx));

    let stream = ReceiverStream::new(rx).map(|poke: Poke| Ok(poke.to_event()));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn run_subscription(
    state: AppState,
    namespace: String,
    scope: Scope,
    from: i64,
    tx: mpsc::Sender<Poke>,
) {
    let mut sub = match &scope {
        Scope::Stream(stream) => state.pubsub.subscribe_stream(&namespace, stream),
        Scope::Category { name, .. } => state.pubsub.subscribe_category(&namespace, name),
        Scope::All => state.pubsub.subscribe_namespace(&namespace),
    };

    let mut cursor = from;
    match catch_up(&state, &namespace, &scope, &mut cursor, &tx).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            warn!(%err, namespace, "subscription catch-up failed");
            return;
        }
    }

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let position = scope.event_position(&event);
                if position < cursor {
                    continue;
                }
                cursor = position + 1;
                if !scope.wants(&event) {
                    continue;
                }
                let poke = Poke {
                    stream: event.stream,
                    position: event.position,
                    global_position: event.global_position,
                };
                if tx.send(poke).await.is_err() {
                    break;
                }
            }
            () = tx.closed() => break,
        }
    }
    debug!(namespace, "subscription closed");
}

/// Pages through the log from the cursor, emitting a poke per message.
/// Returns `Ok(false)` when the client went away mid-replay.
async fn catch_up(
    state: &AppState,
    namespace: &str,
    scope: &Scope,
    cursor: &mut i64,
    tx: &mpsc::Sender<Poke>,
) -> Result<bool> {
    loop {
        let page = match scope {
            Scope::Stream(stream) => {
                state
                    .store
                    .get_stream_messages(
                        namespace,
                        stream,
                        &GetStreamMessagesOpts {
                            position: Some(*cursor),
                            global_position: None,
                            batch_size: Some(CATCH_UP_PAGE),
                        },
                    )
                    .await?
            }
            Scope::Category { name, consumer } => {
                state
                    .store
                    .get_category_messages(
                        namespace,
                        name,
                        &GetCategoryMessagesOpts {
                            position: Some(*cursor),
                            batch_size: Some(CATCH_UP_PAGE),
                            correlation: None,
                            consumer_group_member: consumer.map(|(member, _)| member),
                            consumer_group_size: consumer.map(|(_, size)| size),
                        },
                    )
                    .await?
            }
            Scope::All => {
                state
                    .store
                    .get_category_messages(
                        namespace,
                        "",
                        &GetCategoryMessagesOpts {
                            position: Some(*cursor),
                            batch_size: Some(CATCH_UP_PAGE),
                            ..Default::default()
                        },
                    )
                    .await?
            }
        };

        let fetched = page.len() as i64;
        for message in page {
            *cursor = match scope {
                Scope::Stream(_) => message.position,
                _ => message.global_position,
            } + 1;
            let poke = Poke {
                stream: message.stream_name,
                position: message.position,
                global_position: message.global_position,
            };
            if tx.send(poke).await.is_err() {
                return Ok(false);
            }
        }

        if fetched < CATCH_UP_PAGE {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::sqlite::SqliteStore;
    use crate::store::{Storage, WriteMessageOpts};

    impl SubscribeParams {
        fn stream(stream: &str, position: Option<i64>) -> Self {
            SubscribeParams {
                stream: Some(stream.to_string()),
                category: None,
                all: false,
                position,
                consumer: None,
                size: None,
                token: None,
            }
        }
    }

    #[test]
    fn scopes_are_mutually_exclusive() {
        let ok = SubscribeParams::stream("account-1", None);
        assert!(matches!(
            Scope::from_params(&ok).unwrap(),
            Scope::Stream(_)
        ));

        let none = SubscribeParams {
            stream: None,
            category: None,
            all: false,
            position: None,
            consumer: None,
            size: None,
            token: None,
        };
        assert!(Scope::from_params(&none).is_err());

        let both = SubscribeParams {
            stream: Some("account-1".into()),
            category: Some("account".into()),
            all: false,
            position: None,
            consumer: None,
            size: None,
            token: None,
        };
        assert!(Scope::from_params(&both).is_err());
    }

    #[test]
    fn consumer_pairs_must_be_complete_and_in_range() {
        let mut p = SubscribeParams {
            stream: None,
            category: Some("account".into()),
            all: false,
            position: None,
            consumer: Some(0),
            size: None,
            token: None,
        };
        assert!(Scope::from_params(&p).is_err());

        p.size = Some(2);
        assert!(matches!(
            Scope::from_params(&p).unwrap(),
            Scope::Category {
                consumer: Some((0, 2)),
                ..
            }
        ));

        p.consumer = Some(2);
        assert!(Scope::from_params(&p).is_err());

        // Consumer groups make no sense for stream scopes.
        let stream_scoped = SubscribeParams {
            stream: Some("account-1".into()),
            category: None,
            all: false,
            position: None,
            consumer: Some(0),
            size: Some(2),
            token: None,
        };
        assert!(Scope::from_params(&stream_scoped).is_err());
    }

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).await.unwrap();
        let state = AppState::new(Arc::new(store), true, None);
        auth::ensure_default(&state).await.unwrap();
        (state, dir)
    }

    #[tokio::test]
    async fn catch_up_then_live_tail_without_loss() {
        let (state, _dir) = test_state().await;

        for n in 0..3 {
            state
                .store
                .write_message(
                    "default",
                    "account-1",
                    "Deposited",
                    Some(&json!({ "n": n })),
                    &WriteMessageOpts::default(),
                )
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let task = tokio::spawn(run_subscription(
            state.clone(),
            "default".to_string(),
            Scope::Stream("account-1".to_string()),
            0,
            tx,
        ));

        // Catch-up phase: the three existing messages.
        for position in 0..3 {
            let poke = rx.recv().await.unwrap();
            assert_eq!(poke.stream, "account-1");
            assert_eq!(poke.position, position);
        }

        // Live phase: a fresh write published to the bus.
        let written = state
            .store
            .write_message(
                "default",
                "account-1",
                "Deposited",
                None,
                &WriteMessageOpts::default(),
            )
            .await
            .unwrap();
        state.pubsub.publish(&crate::pubsub::WriteEvent {
            namespace: "default".to_string(),
            stream: "account-1".to_string(),
            category: "account".to_string(),
            position: written.position,
            global_position: written.global_position,
        });

        let poke = rx.recv().await.unwrap();
        assert_eq!(poke.position, 3);

        // Dropping the receiver ends the task and unsubscribes.
        drop(rx);
        task.await.unwrap();
        assert_eq!(state.pubsub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn replayed_events_are_filtered_by_the_cursor() {
        let (state, _dir) = test_state().await;

        let written = state
            .store
            .write_message(
                "default",
                "account-1",
                "Opened",
                None,
                &WriteMessageOpts::default(),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let task = tokio::spawn(run_subscription(
            state.clone(),
            "default".to_string(),
            Scope::Stream("account-1".to_string()),
            0,
            tx,
        ));

        // The catch-up copy arrives.
        assert_eq!(rx.recv().await.unwrap().position, 0);

        // A late publish of the same write must not be delivered again.
        state.pubsub.publish(&crate::pubsub::WriteEvent {
            namespace: "default".to_string(),
            stream: "account-1".to_string(),
            category: "account".to_string(),
            position: written.position,
            global_position: written.global_position,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        drop(rx);
        task.await.unwrap();
    }
}
