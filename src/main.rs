use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use authstore::config::StoreConfig;
use authstore::migrate::{Migrations, Migrator, Module};

#[derive(Parser)]
#[command(name = "authstore", version, about = "Identity store administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate {
        /// Falls back to DATABASE_URL.
        #[arg(long)]
        database_url: Option<String>,

        /// Modules to migrate (base, auth, cache). Defaults to all.
        #[arg(long = "module", value_parser = parse_module)]
        modules: Vec<Module>,

        /// Load migrations from this directory instead of the embedded set.
        #[arg(long)]
        migrations_dir: Option<PathBuf>,

        /// Print pending SQL without applying it.
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_module(s: &str) -> Result<Module, String> {
    s.parse().map_err(|e: authstore::migrate::MigrationError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "authstore=info,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match Cli::parse().command {
        Command::Migrate {
            database_url,
            modules,
            migrations_dir,
            dry_run,
        } => migrate(database_url, modules, migrations_dir, dry_run).await,
    }
}

async fn migrate(
    database_url: Option<String>,
    modules: Vec<Module>,
    migrations_dir: Option<PathBuf>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let config = match database_url {
        Some(url) => StoreConfig::new(url),
        None => StoreConfig::from_env().context("read store config")?,
    };

    let migrations = match &migrations_dir {
        Some(dir) => Migrations::from_dir(dir)
            .with_context(|| format!("load migrations from {}", dir.display()))?,
        None => Migrations::embedded(),
    };
    let mut migrator = Migrator::with_migrations(migrations);
    if !modules.is_empty() {
        migrator = migrator.modules(&modules);
    }

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .context("connect to database")?;

    if dry_run {
        let plans = migrator.plan(&pool).await.context("plan migrations")?;
        if plans.is_empty() {
            println!("up to date");
        }
        for plan in plans {
            let current = plan
                .current
                .map_or_else(|| "unversioned".to_string(), |d| d.to_string());
            println!("-- module {} ({current} -> {:?})", plan.module, plan.versions);
            println!("{}", plan.sql);
        }
    } else {
        let applied = migrator.apply(&pool).await.context("apply migrations")?;
        for module in migrator.selected_modules() {
            match applied.iter().find(|(m, _)| m == module) {
                Some((_, version)) => println!("{module}: migrated to {version}"),
                None => println!("{module}: up to date"),
            }
        }
    }

    pool.close().await;
    Ok(())
}
