//! Non-fatal failure bookkeeping.
//!
//! Recoverable per-item failures are recorded here and never abort the batch
//! they occurred in. The most recent failure is what matters, so reporting
//! the same (source, URL) pair again replaces the previous message.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use mediasync_common::Problem;

#[derive(Default)]
pub struct ProblemTracker {
    problems: RwLock<HashMap<(String, String), Problem>>,
}

impl ProblemTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Never raises or aborts the caller.
    pub fn report(&self, namespace: &str, url: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(namespace, url, message = %message, "Problem reported");
        let problem = Problem {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            url: url.to_string(),
            message,
            reported_at: Utc::now(),
        };
        self.problems
            .write()
            .unwrap()
            .insert((namespace.to_string(), url.to_string()), problem);
    }

    pub fn list_by_source(&self, namespace: &str) -> Vec<Problem> {
        let mut list: Vec<Problem> = self
            .problems
            .read()
            .unwrap()
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.reported_at.cmp(&b.reported_at));
        list
    }

    pub fn clear_by_source(&self, namespace: &str) -> usize {
        let mut problems = self.problems.write().unwrap();
        let before = problems.len();
        problems.retain(|(ns, _), _| ns != namespace);
        before - problems.len()
    }

    pub fn count(&self) -> usize {
        self.problems.read().unwrap().len()
    }
}
