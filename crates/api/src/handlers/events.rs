//! Server-sent event streams of run progress.
//!
//! Each SSE message carries the event kind (`run:started`, `node:failed`,
//! ...) as its `event:` field and the JSON-encoded [`RunEvent`] as data.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use db::models::RunStatus;
use engine::{RunDetails, RunEvent, RunEventKind, Topic};
use futures::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// GET /runs/{id}/events
///
/// Streams the run's events and closes after `run:completed` or
/// `run:failed`.  A run that has already finished yields a single event
/// describing how it ended.
pub async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Sse<EventStream>> {
    // Subscribe before looking the run up so nothing falls in between.
    let subscription = state.controller.events().subscribe(Topic::Run(run_id));
    let details = state.controller.get_run(run_id).await?;

    let events = match final_event(&details) {
        Some(event) => stream::iter([event]).boxed(),
        None => until_finished(subscription.into_stream()),
    };
    tracing::debug!(%run_id, "event stream opened");
    Ok(sse(events))
}

/// GET /events
pub async fn all_events(State(state): State<AppState>) -> Sse<EventStream> {
    let events = state.controller.events().subscribe(Topic::All).into_stream();
    sse(events.boxed())
}

fn sse(events: BoxStream<'static, RunEvent>) -> Sse<EventStream> {
    Sse::new(events.map(|event| Ok(to_message(&event))).boxed()).keep_alive(KeepAlive::default())
}

fn to_message(event: &RunEvent) -> Event {
    let message = Event::default().event(event.kind.as_str());
    match message.json_data(event) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(run_id = %event.run_id, error = %err, "unserialisable event");
            Event::default().event(event.kind.as_str()).comment("unserialisable event")
        }
    }
}

fn is_final(kind: RunEventKind) -> bool {
    matches!(kind, RunEventKind::RunCompleted | RunEventKind::RunFailed)
}

/// Pass events through up to and including the first final one.
fn until_finished(
    events: impl futures::Stream<Item = RunEvent> + Send + 'static,
) -> BoxStream<'static, RunEvent> {
    stream::unfold((events.boxed(), false), |(mut events, finished)| async move {
        if finished {
            return None;
        }
        let event = events.next().await?;
        let finished = is_final(event.kind);
        Some((event, (events, finished)))
    })
    .boxed()
}

fn final_event(details: &RunDetails) -> Option<RunEvent> {
    let run = &details.run;
    let event = match run.status {
        RunStatus::Completed => RunEvent::new(RunEventKind::RunCompleted, run.id),
        RunStatus::Failed => {
            let event = RunEvent::new(RunEventKind::RunFailed, run.id);
            match run
                .output
                .as_ref()
                .and_then(|o| o.get("error"))
                .and_then(|e| e.as_str())
            {
                Some(error) => event.error(error),
                None => event,
            }
        }
        RunStatus::Pending | RunStatus::Running => return None,
    };
    let event = event.pipeline(run.pipeline_id);
    Some(match &run.output {
        Some(output) => event.output(output.clone()),
        None => event,
    })
}
