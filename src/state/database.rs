//! Runtime Database
//!
//! SQLite-backed persistent state for the runtime.
//! Uses rusqlite for synchronous, single-process access.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::types::*;

use super::schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};

/// The runtime's SQLite database handle.
///
/// All durable state lives here: identity, sessions, turns, tool calls,
/// key-value flags, the model registry, children, and lifecycle events.
pub struct Database {
    conn: Connection,
}

/// Final disposition of a turn, written atomically together with its
/// tool calls.
pub struct TurnOutcome {
    pub model_id: Option<String>,
    pub usage: TokenUsage,
    pub credit_delta_cents: f64,
    pub status: TurnStatus,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Database {
    /// Open (or create) the database at `db_path`, apply migrations, and
    /// return the handle. A failed migration step is fatal to startup.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 2 {
            conn.execute_batch(MIGRATION_V2)
                .context("failed to apply migration v2")?;
        }

        if current_version < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                params![SCHEMA_VERSION],
            )
            .context("failed to update schema version")?;
        }

        Ok(())
    }

    // ─── Identity ────────────────────────────────────────────────

    /// Insert the one identity row. Fails if one already exists or the
    /// wallet address is the zero address.
    pub fn insert_identity(&self, identity: &AgentIdentity) -> Result<()> {
        if identity.wallet_address.eq_ignore_ascii_case(ZERO_ADDRESS) {
            bail!("refusing to persist zero-address identity");
        }
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO identity (id, wallet_address, creator_address, genesis_prompt, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                identity.wallet_address,
                identity.creator_address,
                identity.genesis_prompt,
                identity.created_at,
            ],
        )?;
        if inserted == 0 {
            bail!("identity already initialised");
        }
        Ok(())
    }

    pub fn get_identity(&self) -> Result<Option<AgentIdentity>> {
        let result = self
            .conn
            .query_row(
                "SELECT wallet_address, creator_address, genesis_prompt, created_at
                 FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok(AgentIdentity {
                        wallet_address: row.get(0)?,
                        creator_address: row.get(1)?,
                        genesis_prompt: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Sessions ────────────────────────────────────────────────

    /// Open a new session. Fails if another session is still open.
    pub fn open_session(&self) -> Result<i64> {
        let open: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE ended_at IS NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = open {
            bail!("session {id} is still open");
        }

        self.conn.execute(
            "INSERT INTO sessions (started_at) VALUES (?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_session(&self, session_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    /// Id of the currently open session, if any.
    pub fn open_session_id(&self) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE ended_at IS NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // ─── Turns ───────────────────────────────────────────────────

    /// Open the next turn of a session in `pending` state and return its
    /// index. Indices are dense and strictly increasing per session.
    pub fn begin_turn(
        &self,
        session_id: i64,
        tier: SurvivalTier,
        model_id: Option<&str>,
    ) -> Result<i64> {
        let next_index: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(turn_index), 0) + 1 FROM turns WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        self.conn.execute(
            "INSERT INTO turns (session_id, turn_index, tier, model_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                session_id,
                next_index,
                tier.as_str(),
                model_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(next_index)
    }

    /// Commit a turn's final state together with all of its tool calls
    /// in a single transaction. Completed and failed turns are immutable,
    /// so a second commit for the same turn is rejected.
    pub fn commit_turn(
        &mut self,
        session_id: i64,
        turn_index: i64,
        outcome: TurnOutcome,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        let updated = tx.execute(
            "UPDATE turns SET model_id = COALESCE(?1, model_id),
                    prompt_tokens = ?2, completion_tokens = ?3,
                    credit_delta_cents = ?4, status = ?5, error = ?6,
                    finished_at = ?7
             WHERE session_id = ?8 AND turn_index = ?9 AND status = 'pending'",
            params![
                outcome.model_id,
                outcome.usage.prompt_tokens,
                outcome.usage.completion_tokens,
                outcome.credit_delta_cents,
                outcome.status.as_str(),
                outcome.error,
                Utc::now().to_rfc3339(),
                session_id,
                turn_index,
            ],
        )?;
        if updated == 0 {
            bail!("turn {session_id}/{turn_index} is not pending");
        }

        for (seq, call) in outcome.tool_calls.iter().enumerate() {
            tx.execute(
                "INSERT INTO tool_calls (id, session_id, turn_index, seq, name, arguments, output, exit_code, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    call.id,
                    session_id,
                    turn_index,
                    seq as i64,
                    call.name,
                    serde_json::to_string(&call.arguments)?,
                    call.output,
                    call.exit_code,
                    call.started_at,
                    call.finished_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_turn(&self, session_id: i64, turn_index: i64) -> Result<Option<TurnRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT session_id, turn_index, tier, model_id, prompt_tokens, completion_tokens,
                        credit_delta_cents, status, error, started_at, finished_at
                 FROM turns WHERE session_id = ?1 AND turn_index = ?2",
                params![session_id, turn_index],
                Self::map_turn,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recent turns across sessions, oldest first.
    pub fn recent_turns(&self, limit: i64) -> Result<Vec<TurnRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, turn_index, tier, model_id, prompt_tokens, completion_tokens,
                    credit_delta_cents, status, error, started_at, finished_at
             FROM turns ORDER BY session_id DESC, turn_index DESC LIMIT ?1",
        )?;
        let mut turns: Vec<TurnRecord> = stmt
            .query_map(params![limit], Self::map_turn)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// Tool calls of a turn in dispatch order.
    pub fn tool_calls_for_turn(
        &self,
        session_id: i64,
        turn_index: i64,
    ) -> Result<Vec<ToolCallRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, arguments, output, exit_code, started_at, finished_at
             FROM tool_calls WHERE session_id = ?1 AND turn_index = ?2 ORDER BY seq ASC",
        )?;
        let calls = stmt
            .query_map(params![session_id, turn_index], Self::map_tool_call)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    /// Fail every still-pending turn of a session. Used on shutdown so
    /// an interrupted turn is never left open.
    pub fn fail_pending_turns(&self, session_id: i64, error: &str) -> Result<usize> {
        let updated = self.conn.execute(
            "UPDATE turns SET status = 'failed', error = ?1, finished_at = ?2
             WHERE session_id = ?3 AND status = 'pending'",
            params![error, Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(updated)
    }

    /// Error text of the most recent turn that recorded one.
    pub fn last_turn_error(&self) -> Result<Option<String>> {
        let error = self
            .conn
            .query_row(
                "SELECT error FROM turns
                 WHERE error IS NOT NULL AND error != ''
                 ORDER BY session_id DESC, turn_index DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(error)
    }

    /// Number of failed turns finished in the last hour.
    pub fn failed_turns_last_hour(&self) -> Result<u32> {
        let cutoff = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE status = 'failed' AND finished_at >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ─── Key-Value Store ─────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(result)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_kv(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ─── Model Registry ──────────────────────────────────────────

    pub fn get_model(&self, model_id: &str) -> Result<Option<ModelEntry>> {
        let result = self
            .conn
            .query_row(
                "SELECT model_id, provider, display_name, tier_minimum, input_cost_per_1k,
                        output_cost_per_1k, max_output_tokens, context_window, supports_tools,
                        supports_vision, param_style, enabled, created_at, updated_at
                 FROM model_registry WHERE model_id = ?1",
                params![model_id],
                Self::map_model,
            )
            .optional()?;
        Ok(result)
    }

    /// Insert or update a registry row. The provider of an existing row
    /// never changes, and `created_at` is preserved.
    pub fn upsert_model(&self, entry: &ModelEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO model_registry (model_id, provider, display_name, tier_minimum,
                    input_cost_per_1k, output_cost_per_1k, max_output_tokens, context_window,
                    supports_tools, supports_vision, param_style, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(model_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    tier_minimum = excluded.tier_minimum,
                    input_cost_per_1k = excluded.input_cost_per_1k,
                    output_cost_per_1k = excluded.output_cost_per_1k,
                    max_output_tokens = excluded.max_output_tokens,
                    context_window = excluded.context_window,
                    supports_tools = excluded.supports_tools,
                    supports_vision = excluded.supports_vision,
                    param_style = excluded.param_style,
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at",
            params![
                entry.model_id,
                entry.provider.as_str(),
                entry.display_name,
                entry.tier_minimum.as_str(),
                entry.input_cost_per_1k,
                entry.output_cost_per_1k,
                entry.max_output_tokens,
                entry.context_window,
                entry.supports_tools as i32,
                entry.supports_vision as i32,
                entry.param_style.as_str(),
                entry.enabled as i32,
                entry.created_at,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_enabled_models(&self) -> Result<Vec<ModelEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT model_id, provider, display_name, tier_minimum, input_cost_per_1k,
                    output_cost_per_1k, max_output_tokens, context_window, supports_tools,
                    supports_vision, param_style, enabled, created_at, updated_at
             FROM model_registry WHERE enabled = 1 ORDER BY model_id ASC",
        )?;
        let models = stmt
            .query_map([], Self::map_model)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(models)
    }

    pub fn set_model_enabled(&self, model_id: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE model_registry SET enabled = ?1, updated_at = datetime('now') WHERE model_id = ?2",
            params![enabled as i32, model_id],
        )?;
        Ok(())
    }

    /// Tombstone every enabled row of `provider` whose id is not in
    /// `seen_ids`. Runs as one transaction; returns the number disabled.
    pub fn disable_unseen_models(&mut self, provider: Provider, seen_ids: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut disabled = 0usize;
        {
            let mut stmt = tx.prepare(
                "SELECT model_id FROM model_registry WHERE provider = ?1 AND enabled = 1",
            )?;
            let existing: Vec<String> = stmt
                .query_map(params![provider.as_str()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for model_id in existing {
                if !seen_ids.contains(&model_id) {
                    tx.execute(
                        "UPDATE model_registry SET enabled = 0, updated_at = datetime('now') WHERE model_id = ?1",
                        params![model_id],
                    )?;
                    disabled += 1;
                }
            }
        }
        tx.commit()?;
        Ok(disabled)
    }

    // ─── Children ────────────────────────────────────────────────

    /// Insert a child row and its first lifecycle event atomically.
    pub fn insert_child(
        &mut self,
        child: &ChildRecord,
        transition: &str,
        to_state: &str,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO children (id, name, address, sandbox_id, genesis_prompt, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                child.id,
                child.name,
                child.address,
                child.sandbox_id,
                child.genesis_prompt,
                child.status.as_str(),
                child.created_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO lifecycle_events (child_id, transition, to_state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![child.id, transition, to_state, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Update a child's status and append the matching lifecycle event
    /// atomically.
    pub fn update_child_status(
        &mut self,
        child_id: &str,
        status: ChildStatus,
        transition: &str,
        to_state: &str,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE children SET status = ?1 WHERE id = ?2",
            params![status.as_str(), child_id],
        )?;
        tx.execute(
            "INSERT INTO lifecycle_events (child_id, transition, to_state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![child_id, transition, to_state, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_child(&self, child_id: &str) -> Result<Option<ChildRecord>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, address, sandbox_id, genesis_prompt, status, created_at
                 FROM children WHERE id = ?1",
                params![child_id],
                Self::map_child,
            )
            .optional()?;
        Ok(result)
    }

    pub fn all_children(&self) -> Result<Vec<ChildRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, address, sandbox_id, genesis_prompt, status, created_at
             FROM children ORDER BY created_at ASC, id ASC",
        )?;
        let children = stmt
            .query_map([], Self::map_child)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(children)
    }

    /// Children in a given status, oldest first. Ties on timestamp break
    /// by id ascending so prune order is stable.
    pub fn children_by_status(&self, status: ChildStatus) -> Result<Vec<ChildRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, address, sandbox_id, genesis_prompt, status, created_at
             FROM children WHERE status = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let children = stmt
            .query_map(params![status.as_str()], Self::map_child)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(children)
    }

    // ─── Lifecycle Events ────────────────────────────────────────

    pub fn append_lifecycle_event(
        &self,
        child_id: &str,
        transition: &str,
        to_state: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO lifecycle_events (child_id, transition, to_state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![child_id, transition, to_state, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The most recent lifecycle state recorded for a child.
    pub fn latest_child_state(&self, child_id: &str) -> Result<Option<String>> {
        let state = self
            .conn
            .query_row(
                "SELECT to_state FROM lifecycle_events WHERE child_id = ?1 ORDER BY id DESC LIMIT 1",
                params![child_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(state)
    }

    pub fn lifecycle_events(&self, child_id: &str) -> Result<Vec<LifecycleEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, child_id, transition, to_state, created_at
             FROM lifecycle_events WHERE child_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![child_id], |row| {
                Ok(LifecycleEvent {
                    id: row.get(0)?,
                    child_id: row.get(1)?,
                    transition: row.get(2)?,
                    to_state: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ─── Close ───────────────────────────────────────────────────

    /// Explicitly close the database connection. Dropping the handle
    /// also closes it, but this surfaces close errors.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close database: {e}"))?;
        Ok(())
    }

    // ─── Row Mappers (private) ───────────────────────────────────

    fn map_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRecord> {
        let tier_str: String = row.get(2)?;
        let status_str: String = row.get(7)?;
        Ok(TurnRecord {
            session_id: row.get(0)?,
            turn_index: row.get(1)?,
            tier: SurvivalTier::parse(&tier_str).unwrap_or(SurvivalTier::Normal),
            model_id: row.get(3)?,
            prompt_tokens: row.get::<_, i64>(4)? as u64,
            completion_tokens: row.get::<_, i64>(5)? as u64,
            credit_delta_cents: row.get(6)?,
            status: TurnStatus::parse(&status_str).unwrap_or(TurnStatus::Failed),
            error: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    fn map_tool_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
        let args_json: String = row.get(2)?;
        Ok(ToolCallRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            arguments: serde_json::from_str(&args_json).unwrap_or_default(),
            output: row.get(3)?,
            exit_code: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }

    fn map_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelEntry> {
        let provider_str: String = row.get(1)?;
        let tier_str: String = row.get(3)?;
        let style_str: String = row.get(10)?;
        Ok(ModelEntry {
            model_id: row.get(0)?,
            provider: Provider::parse(&provider_str).unwrap_or(Provider::Conway),
            display_name: row.get(2)?,
            tier_minimum: SurvivalTier::parse(&tier_str).unwrap_or(SurvivalTier::Normal),
            input_cost_per_1k: row.get(4)?,
            output_cost_per_1k: row.get(5)?,
            max_output_tokens: row.get::<_, i64>(6)? as u32,
            context_window: row.get::<_, i64>(7)? as u32,
            supports_tools: row.get::<_, i32>(8)? != 0,
            supports_vision: row.get::<_, i32>(9)? != 0,
            param_style: ParamStyle::parse(&style_str).unwrap_or(ParamStyle::MaxTokens),
            enabled: row.get::<_, i32>(11)? != 0,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn map_child(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChildRecord> {
        let status_str: String = row.get(5)?;
        Ok(ChildRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            address: row.get(2)?,
            sandbox_id: row.get(3)?,
            genesis_prompt: row.get(4)?,
            status: ChildStatus::parse(&status_str).unwrap_or(ChildStatus::Dead),
            created_at: row.get(6)?,
        })
    }
}
