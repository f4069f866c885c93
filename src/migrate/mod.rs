//! Versioned, per-module schema migrations.
//!
//! Each module keeps one row in `authstore.module_version` holding the date
//! of its latest applied migration. Pending files (dates after that version)
//! are concatenated in order, followed by the version upsert, and run as one
//! transaction: the module either moves to the new version with all of its
//! schema changes or stays where it was.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use sqlx::{Executor, PgConnection, PgPool, Postgres, Transaction};
use time::Date;
use tracing::{debug, info};

mod source;

pub use source::Migrations;

/// Key for `pg_advisory_xact_lock`; concurrent runners queue on it.
const MIGRATION_LOCK_KEY: i64 = 0x6175_7468_7374_6f72;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown module `{0}`")]
    UnknownModule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Module {
    Base,
    Auth,
    Cache,
}

impl Module {
    pub const ALL: [Module; 3] = [Module::Base, Module::Auth, Module::Cache];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Auth => "auth",
            Self::Cache => "cache",
        }
    }

    pub fn dependencies(self) -> &'static [Module] {
        match self {
            Self::Base => &[],
            Self::Auth | Self::Cache => &[Module::Base],
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Self::Base),
            "auth" => Ok(Self::Auth),
            "cache" => Ok(Self::Cache),
            other => Err(MigrationError::UnknownModule(other.to_string())),
        }
    }
}

/// Adds dependencies and orders dependencies first, without duplicates.
pub fn resolve(modules: &[Module]) -> Vec<Module> {
    fn visit(module: Module, out: &mut Vec<Module>) {
        if out.contains(&module) {
            return;
        }
        for dep in module.dependencies() {
            visit(*dep, out);
        }
        out.push(module);
    }
    let mut out = Vec::new();
    for module in modules {
        visit(*module, &mut out);
    }
    out
}

/// Work a module still needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    pub module: Module,
    pub current: Option<Date>,
    pub versions: Vec<Date>,
    /// Full statement batch, version upsert included.
    pub sql: String,
}

impl PendingMigration {
    pub fn target(&self) -> Option<Date> {
        self.versions.last().copied()
    }
}

/// Builds the batch for files newer than `current`, or `None` if up to date.
pub(crate) fn pending(
    module: Module,
    files: Option<&BTreeMap<Date, String>>,
    current: Option<Date>,
) -> Option<PendingMigration> {
    let files = files?;
    let selected: Vec<(&Date, &String)> = files
        .iter()
        .filter(|(date, _)| current.map_or(true, |cur| **date > cur))
        .collect();
    let (target, _) = selected.last()?;

    let mut sql = String::new();
    for (date, body) in &selected {
        sql.push_str(&format!("-- {module}/{date}.sql\n"));
        sql.push_str(body.trim_end());
        if !body.trim_end().ends_with(';') {
            sql.push(';');
        }
        sql.push_str("\n\n");
    }
    sql.push_str(&format!(
        "INSERT INTO authstore.module_version (module, version) VALUES ('{module}', DATE '{target}')\n\
         ON CONFLICT (module) DO UPDATE SET version = EXCLUDED.version;\n"
    ));

    Some(PendingMigration {
        module,
        current,
        versions: selected.iter().map(|(d, _)| **d).collect(),
        sql,
    })
}

/// Applies migrations for a set of modules.
pub struct Migrator {
    migrations: Migrations,
    modules: Vec<Module>,
}

impl Migrator {
    /// All modules, embedded migrations.
    pub fn new() -> Self {
        Self::with_migrations(Migrations::embedded())
    }

    pub fn with_migrations(migrations: Migrations) -> Self {
        Self {
            migrations,
            modules: Module::ALL.to_vec(),
        }
    }

    /// Restricts the run to `modules` and their dependencies.
    pub fn modules(mut self, modules: &[Module]) -> Self {
        self.modules = resolve(modules);
        self
    }

    pub fn selected_modules(&self) -> &[Module] {
        &self.modules
    }

    /// Pending batches per module, without writing anything.
    ///
    /// A module whose dependency is itself pending is reported against an
    /// empty schema, matching what `apply` will see.
    pub async fn plan(&self, pool: &PgPool) -> Result<Vec<PendingMigration>, MigrationError> {
        let mut conn = pool.acquire().await?;
        let mut plans = Vec::new();
        for module in resolve(&self.modules) {
            let current = current_version(&mut conn, module).await?;
            if let Some(p) = pending(module, self.migrations.for_module(module), current) {
                plans.push(p);
            }
        }
        Ok(plans)
    }

    /// Runs each pending module batch in its own transaction, dependencies
    /// first. Returns the modules that moved and their new versions.
    pub async fn apply(&self, pool: &PgPool) -> Result<Vec<(Module, Date)>, MigrationError> {
        let mut applied = Vec::new();
        for module in resolve(&self.modules) {
            let mut tx = pool.begin().await?;
            lock(&mut tx).await?;

            let current = current_version(&mut tx, module).await?;
            let Some(plan) = pending(module, self.migrations.for_module(module), current) else {
                tx.rollback().await?;
                debug!(%module, ?current, "module up to date");
                continue;
            };

            (&mut *tx).execute(plan.sql.as_str()).await?;
            tx.commit().await?;

            if let Some(target) = plan.target() {
                info!(%module, from = ?current, to = %target, files = plan.versions.len(), "module migrated");
                applied.push((module, target));
            }
        }
        Ok(applied)
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

async fn lock(tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// `None` until the module has a version row. A missing version table means
/// the base module has never run.
async fn current_version(
    conn: &mut PgConnection,
    module: Module,
) -> Result<Option<Date>, sqlx::Error> {
    let (has_table,): (bool,) =
        sqlx::query_as("SELECT to_regclass('authstore.module_version') IS NOT NULL")
            .fetch_one(&mut *conn)
            .await?;
    if !has_table {
        return Ok(None);
    }
    let version: Option<(Date,)> =
        sqlx::query_as("SELECT version FROM authstore.module_version WHERE module = $1")
            .bind(module.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(version.map(|(v,)| v))
}
