//! In-memory context store and ready-set query.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::time::Instant;

use super::context::PipelineContext;
use super::stage::Stage;
use crate::ticket::TicketId;

/// Operator command deferred until the in-flight attempt completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Retry,
    Escalate,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

#[derive(Debug)]
pub struct ContextSlot {
    pub context: PipelineContext,
    pub pending: VecDeque<Command>,
}

/// Score descending, then ticket creation time ascending, then ticket id.
pub fn priority_order(a: &PipelineContext, b: &PipelineContext) -> Ordering {
    b.priority_score()
        .total_cmp(&a.priority_score())
        .then_with(|| a.ticket().created_at.cmp(&b.ticket().created_at))
        .then_with(|| a.ticket_id().cmp(b.ticket_id()))
}

/// All known contexts, keyed by ticket id.
#[derive(Debug, Default)]
pub struct ContextStore {
    slots: RwLock<HashMap<TicketId, ContextSlot>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a context, dropping any queued commands.
    pub async fn insert(&self, context: PipelineContext) {
        let id = context.ticket_id().to_string();
        self.slots.write().await.insert(
            id,
            ContextSlot {
                context,
                pending: VecDeque::new(),
            },
        );
    }

    pub async fn contains(&self, ticket_id: &str) -> bool {
        self.slots.read().await.contains_key(ticket_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Snapshot of one context.
    pub async fn get(&self, ticket_id: &str) -> Option<PipelineContext> {
        self.slots
            .read()
            .await
            .get(ticket_id)
            .map(|slot| slot.context.clone())
    }

    /// Snapshots of every context, in priority order.
    pub async fn list(&self) -> Vec<PipelineContext> {
        let mut contexts: Vec<PipelineContext> = self
            .slots
            .read()
            .await
            .values()
            .map(|slot| slot.context.clone())
            .collect();
        contexts.sort_by(priority_order);
        contexts
    }

    /// Eligible (ticket, next stage) pairs in priority order.
    pub async fn ready(&self, now: Instant) -> Vec<(TicketId, Stage)> {
        let slots = self.slots.read().await;
        let mut ready: Vec<&PipelineContext> = slots
            .values()
            .map(|slot| &slot.context)
            .filter(|ctx| ctx.is_ready(now))
            .collect();
        ready.sort_by(|a, b| priority_order(a, b));
        ready
            .into_iter()
            .map(|ctx| (ctx.ticket_id().to_string(), ctx.current_stage()))
            .collect()
    }

    /// Earliest future resume time among waiting contexts.
    pub async fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        self.slots
            .read()
            .await
            .values()
            .map(|slot| &slot.context)
            .filter(|ctx| !ctx.is_terminal() && !ctx.is_frozen() && ctx.in_flight().is_none())
            .filter_map(|ctx| ctx.resume_deadline())
            .filter(|at| *at > now)
            .min()
    }

    /// Run `f` on a slot under the write lock.
    pub async fn update<R>(
        &self,
        ticket_id: &str,
        f: impl FnOnce(&mut ContextSlot) -> R,
    ) -> Option<R> {
        self.slots.write().await.get_mut(ticket_id).map(f)
    }

    /// Exclusive access to every slot, for check-then-insert sequences.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, HashMap<TicketId, ContextSlot>> {
        self.slots.write().await
    }

    /// Drop terminal contexts that reached their terminal state more than
    /// `max_age` ago. Returns the number removed.
    pub async fn prune_terminal(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            !(slot.context.is_terminal()
                && slot.context.terminal_at().is_some_and(|at| at < cutoff))
        });
        before - slots.len()
    }
}
