//! The per-session SSE stream: snapshot, replay from the event log, then
//! live events with periodic heartbeats. A subscriber that lags the live
//! channel resynchronizes from the log, so ordering and completeness only
//! depend on persisted state.

use crate::api::error::ApiError;
use log::warn;
use menulens_db::types::{EventRow, EventType};
use menulens_pipeline::Application;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::stream::{Event, EventStream};
use rocket::{Shutdown, State, get};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

/// The standard SSE resume header. The query parameter wins when both are
/// present.
pub struct LastEventIdHeader(Option<i64>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for LastEventIdHeader {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let value = request
            .headers()
            .get_one("Last-Event-ID")
            .and_then(|raw| raw.parse().ok());
        Outcome::Success(LastEventIdHeader(value))
    }
}

fn to_sse(event: &EventRow) -> Event {
    Event::json(event)
        .id(event.event_id.to_string())
        .event(event.event_type.to_string())
}

enum StreamAction {
    Live(Arc<EventRow>),
    Resync { closed: bool },
    Heartbeat,
    Stop,
}

#[get("/sessions/<session_id>/stream?<last_event_id>")]
pub async fn stream_session(
    session_id: &str,
    last_event_id: Option<i64>,
    header: LastEventIdHeader,
    app: &State<Application>,
    mut end: Shutdown,
) -> Result<EventStream![], ApiError> {
    let store = app.store().clone();
    let bus = app.bus().clone();
    let heartbeat_period =
        Duration::from_secs(app.config().heartbeat_interval_seconds.max(1));
    let session_id = session_id.to_string();
    let resume_from = last_event_id.or(header.0).unwrap_or(0);

    // Unknown sessions get a 404 before the response switches to a stream.
    let snapshot = store.get_session(&session_id).await?;

    Ok(EventStream! {
        // Subscribe before reading the log so nothing published between
        // replay and the live loop is lost; duplicates are filtered by id.
        let mut live = bus.subscribe(&session_id);
        let mut last_seen = resume_from;

        yield Event::json(&snapshot).event("snapshot");

        let mut terminal_sent = false;
        match store.events_after(&session_id, last_seen).await {
            Ok(events) => {
                for event in events {
                    last_seen = event.event_id;
                    if event.event_type == EventType::SessionCompleted {
                        terminal_sent = true;
                    }
                    yield to_sse(&event);
                }
            }
            Err(err) => {
                warn!("Couldn't replay events for {session_id}: {err}");
                terminal_sent = true;
            }
        }

        if !terminal_sent {
            let mut heartbeat = tokio::time::interval_at(
                tokio::time::Instant::now() + heartbeat_period,
                heartbeat_period,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let action = tokio::select! {
                    received = live.recv() => match received {
                        Ok(event) => StreamAction::Live(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Stream for {session_id} lagged by {skipped} events");
                            StreamAction::Resync { closed: false }
                        }
                        Err(RecvError::Closed) => StreamAction::Resync { closed: true },
                    },
                    _ = heartbeat.tick() => StreamAction::Heartbeat,
                    _ = &mut end => StreamAction::Stop,
                };

                match action {
                    StreamAction::Live(event) => {
                        if event.event_id <= last_seen {
                            continue;
                        }
                        last_seen = event.event_id;
                        let terminal = event.event_type == EventType::SessionCompleted;
                        yield to_sse(&event);
                        if terminal {
                            break;
                        }
                    }
                    StreamAction::Resync { closed } => {
                        let events = match store.events_after(&session_id, last_seen).await {
                            Ok(events) => events,
                            Err(err) => {
                                warn!("Couldn't resync stream for {session_id}: {err}");
                                break;
                            }
                        };
                        let mut terminal = false;
                        for event in events {
                            last_seen = event.event_id;
                            if event.event_type == EventType::SessionCompleted {
                                terminal = true;
                            }
                            yield to_sse(&event);
                        }
                        // A closed channel means the session was retired;
                        // whatever the log had is all there will ever be.
                        if terminal || closed {
                            break;
                        }
                    }
                    StreamAction::Heartbeat => {
                        yield Event::empty().event("heartbeat");
                    }
                    StreamAction::Stop => break,
                }
            }
        }
    })
}
