//! SQLite persistence layer.
//!
//! Holds the read-only admin entities (organizations, providers,
//! repositories), the durable review records (review_runs, review_comments),
//! and the runtime journal (invocations, invocation_steps,
//! orchestration_state) that makes crash-replay possible.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`. Migrations are forward-only.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use reviewd_core::ProviderKind;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Review run lifecycle. `Completed`, `Failed` and `Skipped` are terminal:
/// once a run reaches one of them its status is never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Draft,
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Draft => "draft",
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(RunStatus::Draft),
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(anyhow!("Unknown run status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: String,
    pub org_id: String,
    pub kind: ProviderKind,
    pub name: String,
    pub base_url: String,
    pub token_encrypted: Vec<u8>,
    pub webhook_secret: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct RepoRow {
    pub id: String,
    pub provider_id: String,
    pub remote_id: String,
    pub name: String,
    pub full_path: String,
    pub review_enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct RepoUpsertInput {
    pub remote_id: String,
    pub name: String,
    pub full_path: String,
}

#[derive(Debug, Clone)]
pub struct ReviewRunRow {
    pub id: String,
    pub repo_id: String,
    pub mr_number: i64,
    pub status: RunStatus,
    pub summary: Option<String>,
    pub diff_hash: Option<String>,
    pub invocation_id: Option<String>,
    /// Provider id of the posted summary note; set at most once.
    pub summary_comment_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ReviewCommentRow {
    pub id: String,
    pub review_run_id: String,
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub body: String,
    pub provider_comment_id: Option<String>,
    pub created_at: String,
}

impl ReviewCommentRow {
    pub fn posted(&self) -> bool {
        self.provider_comment_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CommentInput {
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct InvocationRow {
    pub id: String,
    pub key: String,
    pub payload: String,
    pub status: String,
    pub error: Option<String>,
}

/// SQLite database shared by the ingress, admin handlers and the runtime.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Callers on async paths should wrap operations in
/// `tokio::task::spawn_blocking` (see [`call`]).
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

/// Run a blocking database operation from async code.
pub async fn call<T, F>(db: &Arc<SqliteDb>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteDb) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .context("spawn_blocking panicked")?
}

impl SqliteDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        Ok(())
    }

    /// Migration v0 -> v1: Initial schema plus the seeded default org.
    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES organizations(id),
                type TEXT NOT NULL CHECK(type IN ('gitlab_self_hosted', 'gitlab_cloud')),
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                token_encrypted BLOB NOT NULL,
                webhook_secret TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL REFERENCES providers(id),
                remote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                full_path TEXT NOT NULL,
                review_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (provider_id, remote_id)
            );

            CREATE TABLE IF NOT EXISTS review_runs (
                id TEXT PRIMARY KEY,
                repo_id TEXT NOT NULL REFERENCES repositories(id),
                mr_number INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'draft', 'pending', 'running', 'completed', 'failed', 'skipped'
                )),
                summary TEXT,
                diff_hash TEXT,
                invocation_id TEXT,
                summary_comment_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_review_runs_repo_mr
            ON review_runs(repo_id, mr_number);

            CREATE TABLE IF NOT EXISTS review_comments (
                id TEXT PRIMARY KEY,
                review_run_id TEXT NOT NULL REFERENCES review_runs(id),
                file_path TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                body TEXT NOT NULL,
                provider_comment_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_review_comments_run
            ON review_comments(review_run_id);

            -- Runtime journal: one row per orchestration invocation, one row
            -- per journaled step. Replays read steps back in index order.
            CREATE TABLE IF NOT EXISTS invocations (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'pending', 'running', 'completed', 'failed', 'cancelled'
                )),
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_invocations_key
            ON invocations(key);

            CREATE TABLE IF NOT EXISTS invocation_steps (
                invocation_id TEXT NOT NULL REFERENCES invocations(id),
                step_index INTEGER NOT NULL,
                name TEXT NOT NULL,
                output TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (invocation_id, step_index)
            );

            CREATE TABLE IF NOT EXISTS orchestration_state (
                key TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (key, name)
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        conn.execute(
            "INSERT OR IGNORE INTO organizations (id, name) VALUES (?1, 'default')",
            rusqlite::params![Uuid::new_v4().to_string()],
        )
        .context("Failed to seed default organization")?;

        Ok(())
    }

    // =========================================================================
    // Organizations and providers
    // =========================================================================

    pub fn default_org_id(&self) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id FROM organizations WHERE name = 'default' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .context("default org not found")
    }

    /// Insert a provider and upsert its repositories in a single transaction,
    /// so a failed repo sync never leaves a half-registered provider behind.
    pub fn insert_provider_with_repos(
        &self,
        org_id: &str,
        kind: ProviderKind,
        name: &str,
        base_url: &str,
        token_encrypted: &[u8],
        webhook_secret: &str,
        repos: &[RepoUpsertInput],
    ) -> Result<String> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let provider_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO providers (id, org_id, type, name, base_url, token_encrypted, webhook_secret) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                provider_id,
                org_id,
                kind.as_str(),
                name,
                base_url,
                token_encrypted,
                webhook_secret,
            ],
        )
        .context("Failed to insert provider")?;

        for repo in repos {
            tx.execute(
                "INSERT INTO repositories (id, provider_id, remote_id, name, full_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (provider_id, remote_id) DO UPDATE \
                 SET name = excluded.name, full_path = excluded.full_path",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    provider_id,
                    repo.remote_id,
                    repo.name,
                    repo.full_path,
                ],
            )
            .context("Failed to upsert repository")?;
        }

        tx.commit().context("Failed to commit provider insert")?;
        Ok(provider_id)
    }

    /// Fetch a provider by ID (includes the encrypted token and webhook
    /// secret). Soft-deleted providers are invisible.
    pub fn get_provider(&self, id: &str) -> Result<Option<ProviderRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, org_id, type, name, base_url, token_encrypted, webhook_secret, created_at \
             FROM providers WHERE id = ?1 AND deleted_at IS NULL",
            rusqlite::params![id],
            row_to_provider,
        )
        .optional()
        .context("Failed to get provider")
    }

    /// List all active providers in creation order.
    pub fn list_providers(&self) -> Result<Vec<ProviderRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, org_id, type, name, base_url, token_encrypted, webhook_secret, created_at \
                 FROM providers WHERE deleted_at IS NULL ORDER BY created_at, rowid",
            )
            .context("Failed to prepare list_providers")?;

        let rows = stmt
            .query_map([], row_to_provider)
            .context("Failed to query providers")?;

        let mut providers = Vec::new();
        for row in rows {
            providers.push(row.context("Failed to read provider row")?);
        }
        Ok(providers)
    }

    /// Soft-delete a provider. Returns false if it did not exist.
    pub fn soft_delete_provider(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE providers SET deleted_at = datetime('now') \
                 WHERE id = ?1 AND deleted_at IS NULL",
                rusqlite::params![id],
            )
            .context("Failed to delete provider")?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    pub fn get_repo(&self, id: &str) -> Result<Option<RepoRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, provider_id, remote_id, name, full_path, review_enabled, created_at \
             FROM repositories WHERE id = ?1",
            rusqlite::params![id],
            row_to_repo,
        )
        .optional()
        .context("Failed to get repository")
    }

    pub fn get_repo_by_remote_id(
        &self,
        provider_id: &str,
        remote_id: &str,
    ) -> Result<Option<RepoRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, provider_id, remote_id, name, full_path, review_enabled, created_at \
             FROM repositories WHERE provider_id = ?1 AND remote_id = ?2",
            rusqlite::params![provider_id, remote_id],
            row_to_repo,
        )
        .optional()
        .context("Failed to get repository by remote id")
    }

    pub fn list_repos_by_provider(&self, provider_id: &str) -> Result<Vec<RepoRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, provider_id, remote_id, name, full_path, review_enabled, created_at \
                 FROM repositories WHERE provider_id = ?1 ORDER BY full_path",
            )
            .context("Failed to prepare list_repos_by_provider")?;

        let rows = stmt
            .query_map(rusqlite::params![provider_id], row_to_repo)
            .context("Failed to query repositories")?;

        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("Failed to read repository row")?);
        }
        Ok(repos)
    }

    /// Set review_enabled on a repository. Returns the updated row, or None
    /// if the repository does not exist.
    pub fn set_review_enabled(&self, id: &str, enabled: bool) -> Result<Option<RepoRow>> {
        {
            let conn = self.conn.lock().expect("mutex poisoned");
            let rows = conn
                .execute(
                    "UPDATE repositories SET review_enabled = ?1 WHERE id = ?2",
                    rusqlite::params![enabled, id],
                )
                .context("Failed to update review_enabled")?;
            if rows == 0 {
                return Ok(None);
            }
        }
        self.get_repo(id)
    }

    /// Fetch a repository joined with its (non-deleted) provider.
    pub fn get_repo_with_provider(&self, repo_id: &str) -> Result<Option<(RepoRow, ProviderRow)>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT r.id, r.provider_id, r.remote_id, r.name, r.full_path, r.review_enabled, r.created_at, \
                    p.id, p.org_id, p.type, p.name, p.base_url, p.token_encrypted, p.webhook_secret, p.created_at \
             FROM repositories r \
             JOIN providers p ON p.id = r.provider_id AND p.deleted_at IS NULL \
             WHERE r.id = ?1",
            rusqlite::params![repo_id],
            |row| {
                let repo = RepoRow {
                    id: row.get(0)?,
                    provider_id: row.get(1)?,
                    remote_id: row.get(2)?,
                    name: row.get(3)?,
                    full_path: row.get(4)?,
                    review_enabled: row.get(5)?,
                    created_at: row.get(6)?,
                };
                Ok((repo, RawProvider {
                    id: row.get(7)?,
                    org_id: row.get(8)?,
                    kind: row.get(9)?,
                    name: row.get(10)?,
                    base_url: row.get(11)?,
                    token_encrypted: row.get(12)?,
                    webhook_secret: row.get(13)?,
                    created_at: row.get(14)?,
                }))
            },
        )
        .optional()
        .context("Failed to get repository with provider")?
        .map(|(repo, raw)| Ok((repo, raw.into_row()?)))
        .transpose()
    }

    // =========================================================================
    // Review runs
    // =========================================================================

    /// Insert a new review run in the given (non-terminal) initial status and
    /// return its ID.
    pub fn create_review_run(
        &self,
        repo_id: &str,
        mr_number: i64,
        status: RunStatus,
    ) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO review_runs (id, repo_id, mr_number, status) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, repo_id, mr_number, status.as_str()],
        )
        .context("Failed to create review run")?;
        Ok(id)
    }

    pub fn get_review_run(&self, id: &str) -> Result<Option<ReviewRunRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, repo_id, mr_number, status, summary, diff_hash, invocation_id, \
                    summary_comment_id, created_at, updated_at \
             FROM review_runs WHERE id = ?1",
            rusqlite::params![id],
            row_to_run,
        )
        .optional()
        .context("Failed to get review run")?
        .map(|raw| raw.into_row())
        .transpose()
    }

    /// Update a run's status. Terminal rows are immutable: the update is
    /// silently refused (returns false) if the row already reached
    /// completed/failed/skipped.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE review_runs SET status = ?1, updated_at = datetime('now') \
                 WHERE id = ?2 AND status NOT IN ('completed', 'failed', 'skipped')",
                rusqlite::params![status.as_str(), run_id],
            )
            .context("Failed to update run status")?;
        Ok(rows > 0)
    }

    pub fn update_run_diff_hash(&self, run_id: &str, diff_hash: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE review_runs SET diff_hash = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![diff_hash, run_id],
        )
        .context("Failed to update run diff hash")?;
        Ok(())
    }

    pub fn update_run_summary(&self, run_id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE review_runs SET summary = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![summary, run_id],
        )
        .context("Failed to update run summary")?;
        Ok(())
    }

    pub fn set_run_invocation(&self, run_id: &str, invocation_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE review_runs SET invocation_id = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![invocation_id, run_id],
        )
        .context("Failed to update run invocation id")?;
        Ok(())
    }

    /// Record the provider id of the posted summary note. The guard keeps the
    /// id write-once so retries cannot post a second summary.
    pub fn set_run_summary_comment(&self, run_id: &str, comment_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE review_runs SET summary_comment_id = ?1, updated_at = datetime('now') \
                 WHERE id = ?2 AND summary_comment_id IS NULL",
                rusqlite::params![comment_id, run_id],
            )
            .context("Failed to update run summary comment id")?;
        Ok(rows > 0)
    }

    /// The invocation id of the most recent pending/running run for this
    /// (repo, MR), if any.
    pub fn active_invocation_id(&self, repo_id: &str, mr_number: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let found: Option<Option<String>> = conn
            .query_row(
                "SELECT invocation_id FROM review_runs \
                 WHERE repo_id = ?1 AND mr_number = ?2 AND status IN ('pending', 'running') \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                rusqlite::params![repo_id, mr_number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query active invocation")?;
        Ok(found.flatten())
    }

    /// Transition the most recent draft run for this (repo, MR) to pending.
    /// Returns the transitioned run id, or None if no draft row exists.
    pub fn transition_draft_to_pending(
        &self,
        repo_id: &str,
        mr_number: i64,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let run_id: Option<String> = tx
            .query_row(
                "SELECT id FROM review_runs \
                 WHERE repo_id = ?1 AND mr_number = ?2 AND status = 'draft' \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                rusqlite::params![repo_id, mr_number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to find draft run")?;

        if let Some(ref id) = run_id {
            tx.execute(
                "UPDATE review_runs SET status = 'pending', updated_at = datetime('now') \
                 WHERE id = ?1",
                rusqlite::params![id],
            )
            .context("Failed to transition draft run")?;
        }

        tx.commit().context("Failed to commit draft transition")?;
        Ok(run_id)
    }

    /// The most recent run for this (repo, MR), regardless of status.
    pub fn latest_run(&self, repo_id: &str, mr_number: i64) -> Result<Option<ReviewRunRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, repo_id, mr_number, status, summary, diff_hash, invocation_id, \
                    summary_comment_id, created_at, updated_at \
             FROM review_runs WHERE repo_id = ?1 AND mr_number = ?2 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            rusqlite::params![repo_id, mr_number],
            row_to_run,
        )
        .optional()
        .context("Failed to get latest review run")?
        .map(|raw| raw.into_row())
        .transpose()
    }

    /// The diff_hash of the most recent completed run for this (repo, MR),
    /// used for dedup.
    pub fn latest_completed_diff_hash(
        &self,
        repo_id: &str,
        mr_number: i64,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT diff_hash FROM review_runs \
             WHERE repo_id = ?1 AND mr_number = ?2 AND status = 'completed' \
               AND diff_hash IS NOT NULL \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            rusqlite::params![repo_id, mr_number],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query latest diff hash")
    }

    // =========================================================================
    // Review comments
    // =========================================================================

    /// Bulk-insert reviewer comments with `provider_comment_id = NULL`.
    pub fn insert_review_comments(&self, run_id: &str, comments: &[CommentInput]) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        for c in comments {
            tx.execute(
                "INSERT INTO review_comments (id, review_run_id, file_path, line_start, line_end, body) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    run_id,
                    c.file_path,
                    c.line_start,
                    c.line_end,
                    c.body,
                ],
            )
            .context("Failed to insert review comment")?;
        }

        tx.commit().context("Failed to commit comment insert")?;
        Ok(())
    }

    /// Comments for a run with no provider id yet, in insertion order.
    pub fn unposted_comments(&self, run_id: &str) -> Result<Vec<ReviewCommentRow>> {
        self.comments_where(
            run_id,
            "review_run_id = ?1 AND provider_comment_id IS NULL",
        )
    }

    /// All comments for a run, in insertion order.
    pub fn comments_for_run(&self, run_id: &str) -> Result<Vec<ReviewCommentRow>> {
        self.comments_where(run_id, "review_run_id = ?1")
    }

    fn comments_where(&self, run_id: &str, filter: &str) -> Result<Vec<ReviewCommentRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let sql = format!(
            "SELECT id, review_run_id, file_path, line_start, line_end, body, \
                    provider_comment_id, created_at \
             FROM review_comments WHERE {} ORDER BY created_at, rowid",
            filter
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare comment query")?;

        let rows = stmt
            .query_map(rusqlite::params![run_id], |row| {
                Ok(ReviewCommentRow {
                    id: row.get(0)?,
                    review_run_id: row.get(1)?,
                    file_path: row.get(2)?,
                    line_start: row.get(3)?,
                    line_end: row.get(4)?,
                    body: row.get(5)?,
                    provider_comment_id: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query review comments")?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row.context("Failed to read comment row")?);
        }
        Ok(comments)
    }

    /// Record the provider id for a comment. Write-once: returns false when
    /// the comment was already marked posted, so retries skip it.
    pub fn mark_comment_posted(&self, comment_id: &str, provider_comment_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE review_comments SET provider_comment_id = ?1 \
                 WHERE id = ?2 AND provider_comment_id IS NULL",
                rusqlite::params![provider_comment_id, comment_id],
            )
            .context("Failed to mark comment posted")?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Runtime journal
    // =========================================================================

    pub fn create_invocation(&self, id: &str, key: &str, payload: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO invocations (id, key, payload, status) VALUES (?1, ?2, ?3, 'pending')",
            rusqlite::params![id, key, payload],
        )
        .context("Failed to create invocation")?;
        Ok(())
    }

    pub fn set_invocation_status(
        &self,
        id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE invocations SET status = ?1, error = ?2, updated_at = datetime('now') \
             WHERE id = ?3",
            rusqlite::params![status, error, id],
        )
        .context("Failed to update invocation status")?;
        Ok(())
    }

    pub fn get_invocation(&self, id: &str) -> Result<Option<InvocationRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, key, payload, status, error FROM invocations WHERE id = ?1",
            rusqlite::params![id],
            row_to_invocation,
        )
        .optional()
        .context("Failed to get invocation")
    }

    /// Invocations that were in flight when the process last stopped; the
    /// runtime re-spawns these at startup and replays their journals.
    pub fn unfinished_invocations(&self) -> Result<Vec<InvocationRow>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, key, payload, status, error FROM invocations \
                 WHERE status IN ('pending', 'running') ORDER BY created_at, rowid",
            )
            .context("Failed to prepare unfinished_invocations")?;

        let rows = stmt
            .query_map([], row_to_invocation)
            .context("Failed to query invocations")?;

        let mut invocations = Vec::new();
        for row in rows {
            invocations.push(row.context("Failed to read invocation row")?);
        }
        Ok(invocations)
    }

    pub fn get_step(&self, invocation_id: &str, step_index: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT output FROM invocation_steps WHERE invocation_id = ?1 AND step_index = ?2",
            rusqlite::params![invocation_id, step_index],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get journal step")
    }

    pub fn record_step(
        &self,
        invocation_id: &str,
        step_index: i64,
        name: &str,
        output: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO invocation_steps (invocation_id, step_index, name, output) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (invocation_id, step_index) DO NOTHING",
            rusqlite::params![invocation_id, step_index, name, output],
        )
        .context("Failed to record journal step")?;
        Ok(())
    }

    pub fn state_get(&self, key: &str, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT value FROM orchestration_state WHERE key = ?1 AND name = ?2",
            rusqlite::params![key, name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get orchestration state")
    }

    pub fn state_set(&self, key: &str, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO orchestration_state (key, name, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT (key, name) DO UPDATE \
             SET value = excluded.value, updated_at = datetime('now')",
            rusqlite::params![key, name, value],
        )
        .context("Failed to set orchestration state")?;
        Ok(())
    }
}

// Intermediate structs so string columns parse into enums in one place.

struct RawProvider {
    id: String,
    org_id: String,
    kind: String,
    name: String,
    base_url: String,
    token_encrypted: Vec<u8>,
    webhook_secret: Option<String>,
    created_at: String,
}

impl RawProvider {
    fn into_row(self) -> Result<ProviderRow> {
        let kind = ProviderKind::parse(&self.kind)
            .ok_or_else(|| anyhow!("Unknown provider type: {}", self.kind))?;
        Ok(ProviderRow {
            id: self.id,
            org_id: self.org_id,
            kind,
            name: self.name,
            base_url: self.base_url,
            token_encrypted: self.token_encrypted,
            webhook_secret: self.webhook_secret,
            created_at: self.created_at,
        })
    }
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRow> {
    let kind_str: String = row.get(2)?;
    let kind = ProviderKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown provider type: {}", kind_str).into(),
        )
    })?;
    Ok(ProviderRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        kind,
        name: row.get(3)?,
        base_url: row.get(4)?,
        token_encrypted: row.get(5)?,
        webhook_secret: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoRow> {
    Ok(RepoRow {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        full_path: row.get(4)?,
        review_enabled: row.get(5)?,
        created_at: row.get(6)?,
    })
}

struct RawRun {
    id: String,
    repo_id: String,
    mr_number: i64,
    status: String,
    summary: Option<String>,
    diff_hash: Option<String>,
    invocation_id: Option<String>,
    summary_comment_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRun {
    fn into_row(self) -> Result<ReviewRunRow> {
        Ok(ReviewRunRow {
            status: RunStatus::parse(&self.status)?,
            id: self.id,
            repo_id: self.repo_id,
            mr_number: self.mr_number,
            summary: self.summary,
            diff_hash: self.diff_hash,
            invocation_id: self.invocation_id,
            summary_comment_id: self.summary_comment_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        mr_number: row.get(2)?,
        status: row.get(3)?,
        summary: row.get(4)?,
        diff_hash: row.get(5)?,
        invocation_id: row.get(6)?,
        summary_comment_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_invocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvocationRow> {
    Ok(InvocationRow {
        id: row.get(0)?,
        key: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        error: row.get(4)?,
    })
}
