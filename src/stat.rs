use anyhow::Context;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

use crate::strategy::Algorithm;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub algorithm: Option<Algorithm>,
    pub agents: usize,
    pub ticks: usize,
    pub search_expansions: usize,
    pub plans_found: usize,
    pub replans: usize,
    pub moves: usize,
    pub waits: usize,
    pub edge_conflicts: usize,
    pub vertex_conflicts: usize,
    pub crashes: usize,
    pub unresolved_ticks: usize,
    pub tasks_assigned: usize,
    pub tasks_completed: usize,
    pub tasks_stolen: usize,
    pub steal_rollbacks: usize,
    pub overdue_tasks: usize,
    pub time_ms: u128,
}

impl Stats {
    pub fn print(&self) {
        info!(
            "{} agents, {} ticks in {} ms: {} moves, {} waits, {} expansions, {} plans ({} replans)",
            self.agents,
            self.ticks,
            self.time_ms,
            self.moves,
            self.waits,
            self.search_expansions,
            self.plans_found,
            self.replans
        );
        info!(
            "Conflicts: {} edge, {} vertex, {} crashes, {} unresolved ticks",
            self.edge_conflicts, self.vertex_conflicts, self.crashes, self.unresolved_ticks
        );
        info!(
            "Tasks: {} assigned, {} completed ({} overdue), {} stolen, {} steal rollbacks",
            self.tasks_assigned,
            self.tasks_completed,
            self.overdue_tasks,
            self.tasks_stolen,
            self.steal_rollbacks
        );
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("cannot write stats to {}", path.display()))?;
        info!("Stats written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize_with_algorithm_name() {
        let stats = Stats {
            algorithm: Some(Algorithm::TokenPassing),
            ticks: 12,
            moves: 30,
            ..Default::default()
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["algorithm"], "token_passing");
        assert_eq!(value["ticks"], 12);
        assert_eq!(value["moves"], 30);
        assert_eq!(value["tasks_stolen"], 0);
    }
}
