//! Ticket source interface, implemented by the intake boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ticket::{ReportedPriority, Ticket, TicketId, TrackerStatus};

/// Position in intake order: `(revised_at, id)`, ascending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketCursor {
    pub revised_at: DateTime<Utc>,
    pub ticket_id: TicketId,
}

impl TicketCursor {
    pub fn of(ticket: &Ticket) -> Self {
        Self {
            revised_at: ticket.revised_at(),
            ticket_id: ticket.id.clone(),
        }
    }
}

/// Which tickets to pull on an intake pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFilter {
    /// Only tickets strictly after this cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<TicketCursor>,
    /// Only these priorities; empty means all.
    #[serde(default)]
    pub priorities: Vec<ReportedPriority>,
    /// Upper bound on tickets returned per pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TicketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, cursor: TicketCursor) -> Self {
        self.after = Some(cursor);
        self
    }

    /// Tickets revised at or after `at`.
    pub fn revised_since(self, at: DateTime<Utc>) -> Self {
        self.after(TicketCursor {
            revised_at: at,
            ticket_id: TicketId::new(),
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Apply the filter to tickets a source could not filter server-side.
    /// The result is in cursor order and holds the oldest matches, so a
    /// caller that advances its cursor to the last one never skips a ticket.
    pub fn apply(&self, tickets: Vec<Ticket>) -> Vec<Ticket> {
        let mut matching: Vec<(TicketCursor, Ticket)> = tickets
            .into_iter()
            .map(|t| (TicketCursor::of(&t), t))
            .filter(|(cursor, t)| {
                self.after.as_ref().map_or(true, |after| cursor > after)
                    && (self.priorities.is_empty() || self.priorities.contains(&t.priority))
            })
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = self.limit {
            matching.truncate(limit);
        }
        matching.into_iter().map(|(_, t)| t).collect()
    }
}

/// External ticket tracker.
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Tickets that should enter the pipeline, in [`TicketCursor`] order.
    async fn fetch_new_tickets(&self, filter: &TicketFilter) -> anyhow::Result<Vec<Ticket>>;

    /// Report progress back to the tracker.
    async fn update_ticket_status(
        &self,
        tracker_id: &str,
        status: TrackerStatus,
        comment: &str,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_apply() {
        let now = Utc::now();
        let old = Ticket::new("PROJ-1", "old", "", ReportedPriority::Low)
            .with_created_at(now - chrono::Duration::hours(2));
        let fresh_low = Ticket::new("PROJ-2", "fresh", "", ReportedPriority::Low);
        let fresh_high = Ticket::new("PROJ-3", "fresh", "", ReportedPriority::High);
        let all = vec![old, fresh_low, fresh_high];

        let since = TicketFilter::new().revised_since(now - chrono::Duration::hours(1));
        assert_eq!(since.apply(all.clone()).len(), 2);

        let high_only = TicketFilter {
            priorities: vec![ReportedPriority::High],
            ..Default::default()
        };
        let picked = high_only.apply(all.clone());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].tracker_id, "PROJ-3");

        assert_eq!(TicketFilter::new().with_limit(1).apply(all).len(), 1);
    }

    #[test]
    fn test_limit_keeps_oldest_in_cursor_order() {
        let now = Utc::now();
        let tickets = vec![
            Ticket::new("PROJ-3", "new", "", ReportedPriority::High).with_id("c"),
            Ticket::new("PROJ-1", "old", "", ReportedPriority::Low)
                .with_id("a")
                .with_created_at(now - chrono::Duration::hours(2)),
            Ticket::new("PROJ-2", "older edit", "", ReportedPriority::Low)
                .with_id("b")
                .with_created_at(now - chrono::Duration::hours(3))
                .with_updated_at(now - chrono::Duration::hours(1)),
        ];

        let first = TicketFilter::new().with_limit(1).apply(tickets.clone());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "a");

        let rest = TicketFilter::new()
            .after(TicketCursor::of(&first[0]))
            .apply(tickets);
        let ids: Vec<&str> = rest.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_equal_timestamps_are_not_skipped() {
        let at = Utc::now();
        let tickets = vec![
            Ticket::new("PROJ-2", "second", "", ReportedPriority::Low)
                .with_id("t-2")
                .with_created_at(at),
            Ticket::new("PROJ-1", "first", "", ReportedPriority::Low)
                .with_id("t-1")
                .with_created_at(at),
        ];

        let first = TicketFilter::new().with_limit(1).apply(tickets.clone());
        assert_eq!(first[0].id, "t-1");
        let next = TicketFilter::new()
            .after(TicketCursor::of(&first[0]))
            .apply(tickets);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "t-2");
    }
}
