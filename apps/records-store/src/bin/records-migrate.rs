use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use records_store::config::Config;
use records_store::db::RecordsDb;
use records_store::records::compare::ComparisonOutcome;
use records_store::records::{MigrationPhase, RecordsService, store};
use records_store::telemetry;
use serde_json::json;

#[derive(Parser)]
#[command(name = "records-migrate")]
#[command(about = "Operator commands for the records legacy-to-mirror migration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the records schema and tables if they do not exist.
    ApplySchema,
    /// Print the configured phase, its routing plan and both representations' revisions.
    Status,
    /// Compare the legacy blob with the mirror once and print the report.
    Verify,
    /// Populate the mirror from the legacy blob in one guarded write.
    Backfill,
    /// Check whether an operator phase change is allowed.
    CheckTransition(CheckTransitionArgs),
}

#[derive(Args)]
struct CheckTransitionArgs {
    #[arg(long)]
    from: MigrationPhase,
    #[arg(long)]
    to: MigrationPhase,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("load records config")?;
    telemetry::init(config.log_format);

    match cli.command {
        Commands::ApplySchema => apply_schema(&config).await,
        Commands::Status => status(&config).await,
        Commands::Verify => verify(&config).await,
        Commands::Backfill => backfill(&config).await,
        Commands::CheckTransition(args) => check_transition(&args),
    }
}

async fn connect(config: &Config) -> Result<Arc<RecordsDb>> {
    let Some(url) = config.db_url.as_deref() else {
        bail!("DB_URL or DATABASE_URL must be set");
    };
    Ok(Arc::new(RecordsDb::connect(url).await?))
}

async fn postgres_service(config: &Config) -> Result<(RecordsService, Arc<dyn store::RecordsStore>)> {
    let db = connect(config).await?;
    let store = store::postgres(db, config.state_id.clone());
    Ok((RecordsService::from_config(store.clone(), config), store))
}

async fn apply_schema(config: &Config) -> Result<()> {
    let db = connect(config).await?;
    db.apply_schema().await?;
    println!("records schema applied");
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let (service, store) = postgres_service(config).await?;
    let plan = service.plan();
    let legacy = store.read_legacy().await.context("read legacy state")?;
    let mirror = store.read_mirror().await.context("read mirror state")?;
    let report = json!({
        "stateId": config.state_id,
        "phase": plan.phase.as_str(),
        "readSource": plan.read_source.as_str(),
        "writeBase": plan.write_base.as_str(),
        "writeMirror": plan.write_mirror,
        "legacyWrite": format!("{:?}", plan.legacy_write),
        "compareReads": plan.compare_reads,
        "legacy": {
            "recordCount": legacy.records.len(),
            "updatedAt": legacy.updated_at,
            "stale": legacy.stale,
        },
        "mirror": {
            "rowCount": mirror.rows.len(),
            "updatedAt": mirror.updated_at,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn verify(config: &Config) -> Result<()> {
    let (service, _) = postgres_service(config).await?;
    let outcome = service.verify().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let ComparisonOutcome::Mismatch(_) = outcome {
        bail!("legacy and mirror representations differ");
    }
    Ok(())
}

async fn backfill(config: &Config) -> Result<()> {
    let (service, _) = postgres_service(config).await?;
    let outcome = service.backfill_mirror().await?;
    let report = json!({
        "updatedAt": outcome.updated_at,
        "previousUpdatedAt": outcome.previous,
        "recordCount": outcome.record_count,
        "mirror": outcome.mirror,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_transition(args: &CheckTransitionArgs) -> Result<()> {
    match MigrationPhase::validate_transition(args.from, args.to) {
        Ok(()) => {
            println!("{} -> {} is allowed", args.from, args.to);
            Ok(())
        }
        Err(reason) => bail!(reason),
    }
}
