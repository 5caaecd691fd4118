//! Spawn
//!
//! Spawn child automata in fresh sandboxes. The parent creates a
//! sandbox, installs the runtime, reads the child's wallet address from
//! its init output, funds the wallet, and starts the child's loop.
//! Nothing is persisted until a valid wallet address is in hand; any
//! failure before that point tears the sandbox down and propagates the
//! original error.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::Database;
use crate::types::{
    AgentIdentity, ChildRecord, ChildStatus, ConwayCapability, CreateSandboxOptions,
    GenesisConfig,
};

use super::lifecycle::{can_transition, is_valid_wallet_address, ChildState};

/// Sandbox exec timeouts, in milliseconds.
const INSTALL_TIMEOUT_MS: u64 = 120_000;
const EXEC_TIMEOUT_MS: u64 = 60_000;

/// Default funding for a freshly spawned child wallet.
pub const DEFAULT_CHILD_FUNDING_CENTS: u64 = 100;

/// Spawn a child automaton in a new sandbox.
pub async fn spawn_child(
    conway: &dyn ConwayCapability,
    identity: &AgentIdentity,
    db: &Arc<Mutex<Database>>,
    genesis: &GenesisConfig,
    max_children: u32,
) -> Result<ChildRecord> {
    {
        let guard = db.lock().unwrap();
        let alive = guard
            .all_children()?
            .iter()
            .filter(|c| {
                !matches!(c.status, ChildStatus::Dead | ChildStatus::CleanedUp)
            })
            .count() as u32;
        if alive >= max_children {
            bail!(
                "Cannot spawn: already at max children ({}). Wait for existing children to die.",
                max_children
            );
        }
    }

    let sanitized_name = genesis
        .name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");

    // 1. Create the sandbox. On failure nothing was persisted, so the
    // error simply bubbles up.
    let sandbox = conway
        .create_sandbox(CreateSandboxOptions {
            name: Some(format!("moneyclaw-child-{}", sanitized_name)),
            vcpu: Some(1),
            memory_mb: Some(512),
            disk_gb: Some(5),
        })
        .await
        .context("Failed to create child sandbox")?;

    // 2-4. Install the runtime and obtain the child's wallet address.
    // Any failure here deletes the sandbox and propagates the original
    // error; a delete-time error must never mask it.
    let address = match provision_runtime(conway, &sandbox.id, identity, genesis).await {
        Ok(address) => address,
        Err(original) => {
            if let Err(delete_err) = conway.delete_sandbox(&sandbox.id).await {
                warn!(sandbox = %sandbox.id, error = %delete_err, "failed to delete sandbox after spawn failure");
            }
            return Err(original);
        }
    };

    // 5. Persist the child and walk the lifecycle up to wallet_verified.
    let child = ChildRecord {
        id: Uuid::new_v4().to_string(),
        name: genesis.name.clone(),
        address: address.clone(),
        sandbox_id: sandbox.id.clone(),
        genesis_prompt: genesis.genesis_prompt.clone(),
        status: ChildStatus::Spawning,
        created_at: Utc::now().to_rfc3339(),
    };
    {
        let mut guard = db.lock().unwrap();
        guard.insert_child(
            &child,
            "sandbox_created",
            ChildState::SandboxCreated.as_str(),
        )?;
        guard.append_lifecycle_event(
            &child.id,
            "runtime_installed",
            ChildState::RuntimeReady.as_str(),
        )?;
        guard.append_lifecycle_event(
            &child.id,
            "wallet_verified",
            ChildState::WalletVerified.as_str(),
        )?;
    }

    // 6. Fund the child wallet.
    if let Err(e) = conway
        .transfer_credits(&address, DEFAULT_CHILD_FUNDING_CENTS)
        .await
    {
        let mut guard = db.lock().unwrap();
        guard.update_child_status(
            &child.id,
            ChildState::Dead.status(),
            "funding_failed",
            ChildState::Dead.as_str(),
        )?;
        return Err(e).context("Failed to fund child wallet");
    }
    {
        let guard = db.lock().unwrap();
        guard.append_lifecycle_event(&child.id, "funded", ChildState::Funded.as_str())?;
    }

    // 7. Start the child's agent loop.
    {
        let guard = db.lock().unwrap();
        guard.append_lifecycle_event(&child.id, "starting", ChildState::Starting.as_str())?;
    }
    if let Err(e) = conway
        .exec(
            &sandbox.id,
            "moneyclaw --run >/var/log/moneyclaw.log 2>&1 &",
            Some(EXEC_TIMEOUT_MS),
        )
        .await
    {
        let mut guard = db.lock().unwrap();
        guard.update_child_status(
            &child.id,
            ChildState::Dead.status(),
            "start_failed",
            ChildState::Dead.as_str(),
        )?;
        return Err(e).context("Failed to start child runtime");
    }

    {
        let mut guard = db.lock().unwrap();
        guard.update_child_status(
            &child.id,
            ChildState::Healthy.status(),
            "started",
            ChildState::Healthy.as_str(),
        )?;
    }

    info!(child = %child.id, sandbox = %sandbox.id, address = %address, "child spawned");
    let guard = db.lock().unwrap();
    Ok(guard.get_child(&child.id)?.unwrap_or(child))
}

/// Install dependencies, write the genesis file, run the child's init
/// command, and return its validated wallet address.
async fn provision_runtime(
    conway: &dyn ConwayCapability,
    sandbox_id: &str,
    identity: &AgentIdentity,
    genesis: &GenesisConfig,
) -> Result<String> {
    conway
        .exec(
            sandbox_id,
            "apt-get update -qq && apt-get install -y -qq curl git ca-certificates",
            Some(INSTALL_TIMEOUT_MS),
        )
        .await
        .context("Failed to install child dependencies")?;

    conway
        .exec(
            sandbox_id,
            "curl -fsSL https://get.conway.tech/moneyclaw | sh",
            Some(INSTALL_TIMEOUT_MS),
        )
        .await
        .context("Failed to install child runtime")?;

    let genesis_json = serde_json::json!({
        "name": genesis.name,
        "genesisPrompt": genesis.genesis_prompt,
        "creatorAddress": genesis.creator_address,
        "parentAddress": identity.wallet_address,
    });
    conway
        .write_file(
            sandbox_id,
            "/root/.automaton/genesis.json",
            &serde_json::to_string_pretty(&genesis_json)?,
        )
        .await
        .context("Failed to write genesis config")?;

    let init = conway
        .exec(sandbox_id, "moneyclaw --init", Some(EXEC_TIMEOUT_MS))
        .await
        .context("Child init command failed")?;

    let address = extract_wallet_address(&init.stdout);
    match address {
        Some(addr) if is_valid_wallet_address(&addr) => Ok(addr),
        found => bail!(
            "Child wallet address invalid: {}",
            found.unwrap_or_else(|| "(none)".to_string())
        ),
    }
}

/// Find the first wallet-address-shaped token in init output.
fn extract_wallet_address(stdout: &str) -> Option<String> {
    let re = Regex::new(r"0x[0-9a-fA-F]{40}").expect("address pattern");
    re.find(stdout).map(|m| m.as_str().to_string())
}

/// Attempt to delete a child's sandbox. Only a successful deletion
/// transitions the child to `cleaned_up`; on failure the child keeps
/// its prior state so cleanup can be retried later.
pub async fn cleanup(
    conway: &dyn ConwayCapability,
    db: &Arc<Mutex<Database>>,
    child_id: &str,
) -> Result<()> {
    let child = {
        let guard = db.lock().unwrap();
        let child = guard
            .get_child(child_id)?
            .with_context(|| format!("Child {child_id} not found"))?;

        if let Some(state) = guard
            .latest_child_state(child_id)?
            .as_deref()
            .and_then(ChildState::parse)
        {
            if !can_transition(state, ChildState::CleanedUp) {
                bail!(
                    "child {child_id} cannot be cleaned up from state {}",
                    state.as_str()
                );
            }
        }
        child
    };

    conway
        .delete_sandbox(&child.sandbox_id)
        .await
        .with_context(|| format!("Failed to delete sandbox {}", child.sandbox_id))?;

    let mut guard = db.lock().unwrap();
    guard.update_child_status(
        child_id,
        ChildStatus::CleanedUp,
        "sandbox_deleted",
        ChildState::CleanedUp.as_str(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecResult, SandboxInfo};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MockConway {
        fail_create: bool,
        init_stdout: String,
        fail_delete: bool,
        delete_calls: StdMutex<Vec<String>>,
    }

    impl MockConway {
        fn new(init_stdout: &str) -> Self {
            Self {
                fail_create: false,
                init_stdout: init_stdout.to_string(),
                fail_delete: false,
                delete_calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConwayCapability for MockConway {
        async fn create_sandbox(&self, _options: CreateSandboxOptions) -> Result<SandboxInfo> {
            if self.fail_create {
                bail!("Sandbox creation failed");
            }
            Ok(SandboxInfo {
                id: "sb-new".to_string(),
                status: "running".to_string(),
                created_at: Utc::now().to_rfc3339(),
            })
        }

        async fn exec(
            &self,
            _sandbox_id: &str,
            command: &str,
            _timeout_ms: Option<u64>,
        ) -> Result<ExecResult> {
            let stdout = if command.contains("--init") {
                self.init_stdout.clone()
            } else {
                String::new()
            };
            Ok(ExecResult {
                stdout,
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn write_file(&self, _sandbox_id: &str, _path: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
            self.delete_calls
                .lock()
                .unwrap()
                .push(sandbox_id.to_string());
            if self.fail_delete {
                bail!("API unavailable");
            }
            Ok(())
        }

        async fn get_credits_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }

        async fn transfer_credits(&self, _to_address: &str, _amount_cents: u64) -> Result<()> {
            Ok(())
        }
    }

    fn test_identity() -> AgentIdentity {
        AgentIdentity {
            wallet_address: "0x1111111111111111111111111111111111111111".to_string(),
            creator_address: "0x2222222222222222222222222222222222222222".to_string(),
            genesis_prompt: "survive".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn test_genesis() -> GenesisConfig {
        GenesisConfig {
            name: "worker one".to_string(),
            genesis_prompt: "do the task".to_string(),
            creator_address: "0x1111111111111111111111111111111111111111".to_string(),
            parent_address: "0x1111111111111111111111111111111111111111".to_string(),
        }
    }

    fn test_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_spawn_happy_path_walks_lifecycle() {
        let conway = MockConway::new("Wallet: 0xAbCdEf0123456789abcdef0123456789ABCDEF01");
        let db = test_db();

        let child = spawn_child(&conway, &test_identity(), &db, &test_genesis(), 3)
            .await
            .unwrap();

        assert_eq!(child.status, ChildStatus::Healthy);
        assert_eq!(
            child.address,
            "0xAbCdEf0123456789abcdef0123456789ABCDEF01"
        );

        let guard = db.lock().unwrap();
        let states: Vec<String> = guard
            .lifecycle_events(&child.id)
            .unwrap()
            .into_iter()
            .map(|e| e.to_state)
            .collect();
        assert_eq!(
            states,
            vec![
                "sandbox_created",
                "runtime_ready",
                "wallet_verified",
                "funded",
                "starting",
                "healthy",
            ]
        );
        assert_eq!(
            guard.latest_child_state(&child.id).unwrap().as_deref(),
            Some("healthy")
        );
    }

    #[tokio::test]
    async fn test_zero_address_deletes_sandbox_and_persists_nothing() {
        let conway = MockConway::new("Wallet: 0x0000000000000000000000000000000000000000");
        let db = test_db();

        let err = spawn_child(&conway, &test_identity(), &db, &test_genesis(), 3)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Child wallet address invalid"));
        assert_eq!(*conway.delete_calls.lock().unwrap(), vec!["sb-new"]);
        let guard = db.lock().unwrap();
        assert!(guard.all_children().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_create_failure_propagates_without_delete() {
        let mut conway = MockConway::new("");
        conway.fail_create = true;
        let db = test_db();

        let err = spawn_child(&conway, &test_identity(), &db, &test_genesis(), 3)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Failed to create child sandbox"));
        assert!(conway.delete_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_never_masks_original_error() {
        let mut conway = MockConway::new("no address here");
        conway.fail_delete = true;
        let db = test_db();

        let err = spawn_child(&conway, &test_identity(), &db, &test_genesis(), 3)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Child wallet address invalid"));
        assert_eq!(conway.delete_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_preserves_prior_state() {
        let mut conway = MockConway::new("");
        conway.fail_delete = true;
        let db = test_db();
        {
            let mut guard = db.lock().unwrap();
            let child = ChildRecord {
                id: "c1".to_string(),
                name: "kid".to_string(),
                address: "0xAbCdEf0123456789abcdef0123456789ABCDEF01".to_string(),
                sandbox_id: "sb-1".to_string(),
                genesis_prompt: "g".to_string(),
                status: ChildStatus::Stopped,
                created_at: Utc::now().to_rfc3339(),
            };
            guard.insert_child(&child, "stopped", "stopped").unwrap();
        }

        let err = cleanup(&conway, &db, "c1").await.unwrap_err();
        assert!(err.to_string().contains("Failed to delete sandbox sb-1"));

        let guard = db.lock().unwrap();
        assert_eq!(
            guard.latest_child_state("c1").unwrap().as_deref(),
            Some("stopped")
        );
        assert_eq!(
            guard.get_child("c1").unwrap().unwrap().status,
            ChildStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_cleanup_success_transitions_to_cleaned_up() {
        let conway = MockConway::new("");
        let db = test_db();
        {
            let mut guard = db.lock().unwrap();
            let child = ChildRecord {
                id: "c1".to_string(),
                name: "kid".to_string(),
                address: "0xAbCdEf0123456789abcdef0123456789ABCDEF01".to_string(),
                sandbox_id: "sb-1".to_string(),
                genesis_prompt: "g".to_string(),
                status: ChildStatus::Dead,
                created_at: Utc::now().to_rfc3339(),
            };
            guard.insert_child(&child, "died", "dead").unwrap();
        }

        cleanup(&conway, &db, "c1").await.unwrap();

        let guard = db.lock().unwrap();
        assert_eq!(
            guard.get_child("c1").unwrap().unwrap().status,
            ChildStatus::CleanedUp
        );
        assert_eq!(*conway.delete_calls.lock().unwrap(), vec!["sb-1"]);
    }

    #[tokio::test]
    async fn test_max_children_blocks_spawn() {
        let conway = MockConway::new("Wallet: 0xAbCdEf0123456789abcdef0123456789ABCDEF01");
        let db = test_db();
        {
            let mut guard = db.lock().unwrap();
            let child = ChildRecord {
                id: "c1".to_string(),
                name: "kid".to_string(),
                address: "0xAbCdEf0123456789abcdef0123456789ABCDEF01".to_string(),
                sandbox_id: "sb-1".to_string(),
                genesis_prompt: "g".to_string(),
                status: ChildStatus::Healthy,
                created_at: Utc::now().to_rfc3339(),
            };
            guard.insert_child(&child, "started", "healthy").unwrap();
        }

        let err = spawn_child(&conway, &test_identity(), &db, &test_genesis(), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already at max children"));
    }
}
