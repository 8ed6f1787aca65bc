//! Intake loop: poll the ticket source and submit new tickets.

use std::sync::Arc;
use std::time::Duration;

use orchestration::{SharedDispatcher, SubmitOutcome, TicketCursor, TicketFilter, TicketSource};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts from one intake pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub fetched: usize,
    pub accepted: usize,
    pub skipped: usize,
    pub rearmed: usize,
    pub reset: usize,
}

/// Polls a ticket source and hands tickets to the dispatcher.
///
/// The cursor follows `(revised_at, id)`, so a ticket the tracker revises
/// after it was taken (a reopen, say) is offered again and the dispatcher's
/// reprocess policy decides what happens to it.
pub struct IntakeLoop {
    source: Arc<dyn TicketSource>,
    dispatcher: SharedDispatcher,
    interval: Duration,
    batch_limit: Option<usize>,
    /// Last ticket taken, in cursor order.
    cursor: Option<TicketCursor>,
}

impl IntakeLoop {
    pub fn new(source: Arc<dyn TicketSource>, dispatcher: SharedDispatcher, interval: Duration) -> Self {
        Self {
            source,
            dispatcher,
            interval,
            batch_limit: None,
            cursor: None,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    fn filter(&self) -> TicketFilter {
        let mut filter = TicketFilter::new();
        if let Some(cursor) = &self.cursor {
            filter = filter.after(cursor.clone());
        }
        if let Some(limit) = self.batch_limit {
            filter = filter.with_limit(limit);
        }
        filter
    }

    /// Fetch once and submit everything returned.
    pub async fn poll_once(&mut self) -> anyhow::Result<IntakeReport> {
        let tickets = self.source.fetch_new_tickets(&self.filter()).await?;
        let mut report = IntakeReport {
            fetched: tickets.len(),
            ..Default::default()
        };

        for ticket in tickets {
            let position = TicketCursor::of(&ticket);
            match self.dispatcher.submit(ticket).await {
                SubmitOutcome::Accepted => report.accepted += 1,
                SubmitOutcome::Skipped => report.skipped += 1,
                SubmitOutcome::Rearmed => report.rearmed += 1,
                SubmitOutcome::Reset => report.reset += 1,
            }
            if self.cursor.as_ref().map_or(true, |c| position > *c) {
                self.cursor = Some(position);
            }
        }
        Ok(report)
    }

    /// Poll on the configured interval until `shutdown` fires. Fetch
    /// errors are logged and retried on the next tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Intake loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.fetched > 0 => {
                            info!(
                                fetched = report.fetched,
                                accepted = report.accepted,
                                skipped = report.skipped,
                                rearmed = report.rearmed,
                                reset = report.reset,
                                "Intake pass"
                            );
                        }
                        Ok(_) => debug!("Intake pass found no new tickets"),
                        Err(e) => warn!(error = %e, "Intake pass failed"),
                    }
                }
            }
        }
        info!("Intake loop stopped");
    }
}
