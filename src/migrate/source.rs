use std::collections::BTreeMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use time::macros::format_description;
use time::Date;
use tracing::debug;

use super::{MigrationError, Module};

const EMBEDDED: &[(Module, &str, &str)] = &[
    (
        Module::Base,
        "2024-06-01.sql",
        include_str!("../../migrations/base/2024-06-01.sql"),
    ),
    (
        Module::Auth,
        "2024-06-01.sql",
        include_str!("../../migrations/auth/2024-06-01.sql"),
    ),
    (
        Module::Auth,
        "2024-09-01.sql",
        include_str!("../../migrations/auth/2024-09-01.sql"),
    ),
    (
        Module::Auth,
        "2024-10-01.sql",
        include_str!("../../migrations/auth/2024-10-01.sql"),
    ),
    (
        Module::Cache,
        "2024-06-01.sql",
        include_str!("../../migrations/cache/2024-06-01.sql"),
    ),
];

/// Parses `YYYY-MM-DD.sql` into its date; anything else is `None`.
pub(crate) fn parse_file_name(name: &str) -> Option<Date> {
    lazy_static! {
        static ref FILE_RE: Regex = Regex::new(r"^(\d{4}-\d{2}-\d{2})\.sql$").unwrap();
    }
    let caps = FILE_RE.captures(name)?;
    Date::parse(&caps[1], format_description!("[year]-[month]-[day]")).ok()
}

/// Migration SQL per module, keyed and ordered by date.
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    files: BTreeMap<Module, BTreeMap<Date, String>>,
}

impl Migrations {
    /// Migrations compiled into the crate from `migrations/`.
    pub fn embedded() -> Self {
        let mut migrations = Self::default();
        for (module, name, sql) in EMBEDDED {
            match parse_file_name(name) {
                Some(date) => migrations.insert(*module, date, (*sql).to_string()),
                None => debug!(name, "skipping embedded file with invalid name"),
            }
        }
        migrations
    }

    /// Loads `<dir>/<module>/YYYY-MM-DD.sql`. A missing module directory
    /// means the module has no migrations.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let mut migrations = Self::default();
        for module in Module::ALL {
            let module_dir = dir.join(module.as_str());
            if !module_dir.is_dir() {
                debug!(path = %module_dir.display(), "no migrations directory");
                continue;
            }
            let entries = std::fs::read_dir(&module_dir).map_err(|source| MigrationError::Io {
                path: module_dir.clone(),
                source,
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|source| MigrationError::Io {
                        path: module_dir.clone(),
                        source,
                    })?
                    .path();
                let Some(date) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_file_name)
                else {
                    debug!(path = %path.display(), "ignoring non-migration file");
                    continue;
                };
                let sql = std::fs::read_to_string(&path)
                    .map_err(|source| MigrationError::Io { path: path.clone(), source })?;
                migrations.insert(module, date, sql);
            }
        }
        Ok(migrations)
    }

    pub fn insert(&mut self, module: Module, version: Date, sql: String) {
        self.files.entry(module).or_default().insert(version, sql);
    }

    pub fn for_module(&self, module: Module) -> Option<&BTreeMap<Date, String>> {
        self.files.get(&module)
    }

    pub fn latest(&self, module: Module) -> Option<Date> {
        self.for_module(module)
            .and_then(|files| files.keys().next_back().copied())
    }
}
