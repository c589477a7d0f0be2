//! Rolling per-node execution durations, used for time-remaining estimates

use flowcore::{NodeId, WorkflowId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

const DEFAULT_WINDOW: usize = 20;

#[derive(Debug, Default)]
struct Samples {
    recent: VecDeque<u64>,
    total: u64,
}

impl Samples {
    fn push(&mut self, duration_ms: u64, window: usize) {
        self.recent.push_back(duration_ms);
        self.total += duration_ms;
        while self.recent.len() > window {
            if let Some(old) = self.recent.pop_front() {
                self.total -= old;
            }
        }
    }

    fn average(&self) -> Option<f64> {
        if self.recent.is_empty() {
            None
        } else {
            Some(self.total as f64 / self.recent.len() as f64)
        }
    }
}

/// Durations of recent successful runs, keyed by workflow and node
pub struct DurationHistory {
    window: usize,
    samples: RwLock<HashMap<(WorkflowId, NodeId), Samples>>,
}

impl DurationHistory {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, workflow_id: WorkflowId, node_id: &str, duration_ms: u64) {
        let mut samples = self.samples.write().await;
        samples
            .entry((workflow_id, node_id.to_string()))
            .or_default()
            .push(duration_ms, self.window);
    }

    pub async fn average_ms(&self, workflow_id: WorkflowId, node_id: &str) -> Option<f64> {
        let samples = self.samples.read().await;
        samples
            .get(&(workflow_id, node_id.to_string()))
            .and_then(Samples::average)
    }

    /// Expected time for `remaining` nodes.
    ///
    /// Nodes without history are costed at the mean of the nodes that have
    /// one; with no history at all there is no estimate.
    pub async fn estimate_remaining_ms<'a>(
        &self,
        workflow_id: WorkflowId,
        remaining: impl IntoIterator<Item = &'a NodeId>,
    ) -> Option<u64> {
        let samples = self.samples.read().await;
        let mut known = Vec::new();
        let mut unknown = 0usize;
        for node in remaining {
            match samples
                .get(&(workflow_id, node.clone()))
                .and_then(Samples::average)
            {
                Some(avg) => known.push(avg),
                None => unknown += 1,
            }
        }

        if known.is_empty() && unknown == 0 {
            return Some(0);
        }

        let fallback = if known.is_empty() {
            let workflow_averages: Vec<f64> = samples
                .iter()
                .filter(|((wf, _), _)| *wf == workflow_id)
                .filter_map(|(_, s)| s.average())
                .collect();
            if workflow_averages.is_empty() {
                return None;
            }
            workflow_averages.iter().sum::<f64>() / workflow_averages.len() as f64
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        let total = known.iter().sum::<f64>() + fallback * unknown as f64;
        Some(total.round() as u64)
    }
}

impl Default for DurationHistory {
    fn default() -> Self {
        Self::new()
    }
}
