//! Agent registry: per-stage enablement and rolling health metrics
//!
//! One entry per executable stage. Each entry sits behind its own lock and
//! is updated on every stage completion. A disabled stage keeps its
//! contexts queued; the dispatcher just skips them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::events::{PipelineEvent, SharedEventBroadcaster};
use crate::pipeline::stage::Stage;

/// Snapshot of a registry entry
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistryEntry {
    pub stage: Stage,
    pub enabled: bool,
    /// Success rate over the rolling window (1.0 with no samples)
    pub success_rate: f64,
    /// Average duration over the rolling window, in milliseconds
    pub avg_duration_ms: u64,
    /// Executions currently in flight
    pub active: u32,
    /// Outcomes in the rolling window
    pub samples: usize,
}

#[derive(Debug)]
struct EntryState {
    enabled: bool,
    active: u32,
    /// (success, duration_ms), oldest first
    window: VecDeque<(bool, u64)>,
}

impl EntryState {
    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|(success, _)| *success).count();
        ok as f64 / self.window.len() as f64
    }

    fn avg_duration_ms(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let total: u64 = self.window.iter().map(|(_, ms)| ms).sum();
        total / self.window.len() as u64
    }
}

/// Registry of all executable stages
#[derive(Debug)]
pub struct AgentRegistry {
    entries: HashMap<Stage, Mutex<EntryState>>,
    window: usize,
    events: Option<SharedEventBroadcaster>,
}

/// Shared reference to AgentRegistry
pub type SharedAgentRegistry = Arc<AgentRegistry>;

impl AgentRegistry {
    /// Create a registry with every pipeline stage enabled
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        let entries = Stage::pipeline()
            .iter()
            .map(|&stage| {
                (
                    stage,
                    Mutex::new(EntryState {
                        enabled: true,
                        active: 0,
                        window: VecDeque::with_capacity(window),
                    }),
                )
            })
            .collect();
        Self {
            entries,
            window,
            events: None,
        }
    }

    /// Publish `agent_status` events on toggles
    pub fn with_events(mut self, events: SharedEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn shared(self) -> SharedAgentRegistry {
        Arc::new(self)
    }

    fn lock(&self, stage: Stage) -> EngineResult<MutexGuard<'_, EntryState>> {
        self.entries
            .get(&stage)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or(EngineError::UnknownStage(stage))
    }

    /// Whether dispatch is allowed for `stage`. Unknown stages are disabled.
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.lock(stage).map(|e| e.enabled).unwrap_or(false)
    }

    /// Set the enabled flag. Returns the new value.
    pub fn set_enabled(&self, stage: Stage, enabled: bool) -> EngineResult<bool> {
        {
            let mut entry = self.lock(stage)?;
            entry.enabled = enabled;
        }
        self.announce(stage, enabled);
        Ok(enabled)
    }

    /// Flip the enabled flag. Returns the new value.
    pub fn toggle(&self, stage: Stage) -> EngineResult<bool> {
        let enabled = {
            let mut entry = self.lock(stage)?;
            entry.enabled = !entry.enabled;
            entry.enabled
        };
        self.announce(stage, enabled);
        Ok(enabled)
    }

    /// An execution of `stage` started
    pub fn begin(&self, stage: Stage) {
        if let Ok(mut entry) = self.lock(stage) {
            entry.active += 1;
        }
    }

    /// An execution of `stage` completed with a verdict on the stage
    pub fn finish(&self, stage: Stage, success: bool, duration: Duration) {
        if let Ok(mut entry) = self.lock(stage) {
            entry.active = entry.active.saturating_sub(1);
            if entry.window.len() == self.window {
                entry.window.pop_front();
            }
            let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            entry.window.push_back((success, ms));
        }
    }

    /// An execution of `stage` ended without a verdict (breaker rejected it)
    pub fn abandon(&self, stage: Stage) {
        if let Ok(mut entry) = self.lock(stage) {
            entry.active = entry.active.saturating_sub(1);
        }
    }

    /// Snapshot of one entry
    pub fn entry(&self, stage: Stage) -> Option<AgentRegistryEntry> {
        let entry = self.lock(stage).ok()?;
        Some(AgentRegistryEntry {
            stage,
            enabled: entry.enabled,
            success_rate: entry.success_rate(),
            avg_duration_ms: entry.avg_duration_ms(),
            active: entry.active,
            samples: entry.window.len(),
        })
    }

    /// Snapshots in pipeline order
    pub fn snapshots(&self) -> Vec<AgentRegistryEntry> {
        Stage::pipeline()
            .iter()
            .filter_map(|&stage| self.entry(stage))
            .collect()
    }

    fn announce(&self, stage: Stage, enabled: bool) {
        let status = if enabled { "enabled" } else { "disabled" };
        info!(stage = %stage, status, "Stage toggled");
        if let Some(events) = &self.events {
            events.publish(PipelineEvent::agent_status(
                format!("stage:{stage}"),
                status,
                None,
            ));
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(50)
    }
}
