//! Lineage Tracking
//!
//! Track spawned children and prune the dead ones. The parent records
//! children in SQLite; pruning tears down their sandboxes but keeps a
//! bounded tail of recent corpses for the audit trail.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::warn;

use crate::state::Database;
use crate::types::{ChildRecord, ChildStatus, ConwayCapability};

use super::spawn::cleanup;

/// Summary information about the runtime's lineage.
pub struct LineageInfo {
    pub children: Vec<ChildRecord>,
    pub alive: usize,
    pub dead: usize,
    pub total: usize,
}

/// Get the full lineage (this runtime's children).
pub fn get_lineage(db: &Database) -> Result<LineageInfo> {
    let children = db.all_children()?;
    let alive = children
        .iter()
        .filter(|c| matches!(c.status, ChildStatus::Spawning | ChildStatus::Healthy))
        .count();
    let dead = children
        .iter()
        .filter(|c| c.status == ChildStatus::Dead)
        .count();
    let total = children.len();

    Ok(LineageInfo {
        children,
        alive,
        dead,
        total,
    })
}

/// Get a one-block lineage summary for the prompt context.
pub fn get_lineage_summary(db: &Database) -> String {
    let lineage = match get_lineage(db) {
        Ok(l) => l,
        Err(_) => return "No lineage information".to_string(),
    };

    if lineage.total == 0 {
        return "No children (first generation)".to_string();
    }

    let mut parts = vec![format!(
        "Children: {} total ({} alive, {} dead)",
        lineage.total, lineage.alive, lineage.dead
    )];
    for child in &lineage.children {
        parts.push(format!(
            "  - {} [{}] sandbox:{}",
            child.name,
            child.status.as_str(),
            child.sandbox_id
        ));
    }
    parts.join("\n")
}

/// Clean up dead children, keeping only the most recent `keep_last`.
///
/// Dead children are listed oldest-first (timestamp ties break by id
/// ascending) and every one beyond the kept tail gets a cleanup attempt
/// in that order. Returns the number actually removed.
pub async fn prune_dead_children(
    conway: &dyn ConwayCapability,
    db: &Arc<Mutex<Database>>,
    keep_last: usize,
) -> Result<usize> {
    let dead = {
        let guard = db.lock().unwrap();
        guard.children_by_status(ChildStatus::Dead)?
    };

    if dead.len() <= keep_last {
        return Ok(0);
    }

    let excess = dead.len() - keep_last;
    let mut removed = 0usize;
    for child in dead.iter().take(excess) {
        match cleanup(conway, db, &child.id).await {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(child = %child.id, error = %e, "failed to prune dead child");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateSandboxOptions, ExecResult, SandboxInfo};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingConway {
        delete_calls: StdMutex<Vec<String>>,
        fail_deletes_for: Vec<String>,
    }

    impl RecordingConway {
        fn new() -> Self {
            Self {
                delete_calls: StdMutex::new(Vec::new()),
                fail_deletes_for: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ConwayCapability for RecordingConway {
        async fn create_sandbox(&self, _options: CreateSandboxOptions) -> Result<SandboxInfo> {
            bail!("not used")
        }

        async fn exec(
            &self,
            _sandbox_id: &str,
            _command: &str,
            _timeout_ms: Option<u64>,
        ) -> Result<ExecResult> {
            bail!("not used")
        }

        async fn write_file(&self, _sandbox_id: &str, _path: &str, _content: &str) -> Result<()> {
            bail!("not used")
        }

        async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
            self.delete_calls
                .lock()
                .unwrap()
                .push(sandbox_id.to_string());
            if self.fail_deletes_for.iter().any(|s| s == sandbox_id) {
                bail!("API unavailable");
            }
            Ok(())
        }

        async fn get_credits_balance(&self) -> Result<f64> {
            Ok(0.0)
        }

        async fn transfer_credits(&self, _to_address: &str, _amount_cents: u64) -> Result<()> {
            Ok(())
        }
    }

    fn seed_dead_children(db: &Arc<Mutex<Database>>, count: usize) {
        let mut guard = db.lock().unwrap();
        for i in 0..count {
            let child = ChildRecord {
                id: format!("dead-{i}"),
                name: format!("kid-{i}"),
                address: "0xAbCdEf0123456789abcdef0123456789ABCDEF01".to_string(),
                sandbox_id: format!("sb-{i}"),
                genesis_prompt: "g".to_string(),
                status: ChildStatus::Dead,
                created_at: format!("2026-01-0{}T00:00:00Z", i + 1),
            };
            guard.insert_child(&child, "died", "dead").unwrap();
        }
    }

    #[tokio::test]
    async fn test_prune_removes_oldest_beyond_keep_last() {
        let conway = RecordingConway::new();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        seed_dead_children(&db, 7);

        let removed = prune_dead_children(&conway, &db, 5).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(*conway.delete_calls.lock().unwrap(), vec!["sb-0", "sb-1"]);

        let guard = db.lock().unwrap();
        assert_eq!(
            guard.get_child("dead-0").unwrap().unwrap().status,
            ChildStatus::CleanedUp
        );
        assert_eq!(
            guard.get_child("dead-1").unwrap().unwrap().status,
            ChildStatus::CleanedUp
        );
        assert_eq!(
            guard.get_child("dead-2").unwrap().unwrap().status,
            ChildStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_prune_noop_within_keep_last() {
        let conway = RecordingConway::new();
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        seed_dead_children(&db, 3);

        let removed = prune_dead_children(&conway, &db, 5).await.unwrap();
        assert_eq!(removed, 0);
        assert!(conway.delete_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_counts_only_successful_cleanups() {
        let mut conway = RecordingConway::new();
        conway.fail_deletes_for = vec!["sb-0".to_string()];
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        seed_dead_children(&db, 7);

        let removed = prune_dead_children(&conway, &db, 5).await.unwrap();
        assert_eq!(removed, 1);

        let guard = db.lock().unwrap();
        assert_eq!(
            guard.get_child("dead-0").unwrap().unwrap().status,
            ChildStatus::Dead
        );
    }

    #[test]
    fn test_lineage_summary_counts() {
        let db = Database::open_in_memory().unwrap();
        let summary = get_lineage_summary(&db);
        assert!(summary.contains("first generation"));
    }
}
