//! Event consumers: structured log and tracker status sync.

use std::sync::Arc;

use orchestration::{
    AlertSeverity, EventBusExt, EventFilter, PipelineEvent, SharedEventBroadcaster, TicketSource,
    TrackerStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Re-emit one event as a tracing record.
pub fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::TicketUpdate {
            ticket_id,
            tracker_id,
            stage,
            status,
            attempt,
            message,
            ..
        } => info!(
            ticket = %ticket_id,
            tracker = %tracker_id,
            stage = %stage,
            status = %status,
            attempt,
            "{message}"
        ),
        PipelineEvent::AgentStatus {
            component,
            status,
            detail,
            ..
        } => info!(
            component = %component,
            status = %status,
            detail = detail.as_deref().unwrap_or(""),
            "Agent status"
        ),
        PipelineEvent::SystemAlert {
            severity,
            ticket_id,
            message,
            ..
        } => {
            let ticket = ticket_id.as_deref().unwrap_or("-");
            match severity {
                AlertSeverity::Info => info!(ticket, "{message}"),
                AlertSeverity::Warning => warn!(ticket, "{message}"),
                AlertSeverity::Critical => error!(ticket, "{message}"),
            }
        }
    }
}

/// Tracker update for an event, if it reports a terminal ticket.
pub fn terminal_update(event: &PipelineEvent) -> Option<(String, TrackerStatus, String)> {
    match event {
        PipelineEvent::TicketUpdate {
            tracker_id,
            status,
            message,
            checkpoints,
            ..
        } if matches!(
            status,
            TrackerStatus::Completed | TrackerStatus::Failed | TrackerStatus::Escalated
        ) =>
        {
            let completed = checkpoints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" → ");
            let comment = if completed.is_empty() {
                format!("Remediation {status}: {message}")
            } else {
                format!("Remediation {status}: {message} (completed: {completed})")
            };
            Some((tracker_id.clone(), *status, comment))
        }
        _ => None,
    }
}

/// Log every broadcast event until `shutdown` fires.
pub fn spawn_event_log(events: &SharedEventBroadcaster, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut subscriber = events.subscribe_filtered(EventFilter::new());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = subscriber.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(e) => {
                        debug!(error = %e, "Event log sink stopping");
                        break;
                    }
                },
            }
        }
    })
}

/// Push terminal ticket updates to the tracker until `shutdown` fires.
/// Tracker errors are logged and do not stop the sink.
pub fn spawn_tracker_sync(
    events: &SharedEventBroadcaster,
    source: Arc<dyn TicketSource>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut subscriber = events.subscribe_filtered(EventFilter::new().types(vec!["ticket_update"]));
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = subscriber.recv() => match received {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "Tracker sync stopping");
                        break;
                    }
                },
            };
            let Some((tracker_id, status, comment)) = terminal_update(&event) else {
                continue;
            };
            if let Err(e) = source.update_ticket_status(&tracker_id, status, &comment).await {
                warn!(tracker = %tracker_id, %status, error = %e, "Tracker status update failed");
            }
        }
        if subscriber.missed() > 0 {
            warn!(missed = subscriber.missed(), "Tracker sync missed events");
        }
    })
}
