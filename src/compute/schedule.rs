//! Evaluation options: how the engine schedules the dirty part of a graph.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Schedule {
    /// Depth-first, one node at a time on the calling thread.
    #[default]
    Sequential,
    /// Independent upstream branches run as concurrent `rayon` tasks.
    ///
    /// With `threads: None` the global rayon pool is used; otherwise a
    /// dedicated pool of that many workers is built for the evaluation.
    Parallel {
        #[serde(default)]
        threads: Option<usize>,
    },
}

impl Schedule {
    pub fn parallel() -> Self {
        Schedule::Parallel { threads: None }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Schedule::Parallel { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvalOptions {
    #[serde(default)]
    pub schedule: Schedule,
}

impl EvalOptions {
    pub fn sequential() -> Self {
        Self { schedule: Schedule::Sequential }
    }

    pub fn parallel() -> Self {
        Self { schedule: Schedule::parallel() }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Parses options from JSON, e.g. `{"schedule": {"mode": "parallel", "threads": 4}}`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
