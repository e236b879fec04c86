//! leadpool CLI: operator interface to the record allocation engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use leadpool::config::Config;
use leadpool::engine::Engine;
use leadpool::model::*;
use leadpool::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "leadpool", about = "Customer-record allocation engine")]
struct Cli {
    /// TOML config file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Uploaded databases and their records
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Download requests
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },
    /// Auto-approve policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Consistency diagnosis and repair
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Print audit events
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Import a JSON array of row objects as a new database
    Import {
        /// JSON file with one object per row
        file: PathBuf,
        /// Staff id of the uploader
        #[arg(long)]
        uploaded_by: String,
        /// Product the contacts belong to
        #[arg(long)]
        product: Option<String>,
    },
    /// List databases
    List,
    /// Show a database with its status counts
    Show { id: DatabaseId },
    /// List a database's records
    Records {
        id: DatabaseId,
        #[arg(long)]
        status: Option<RecordStatus>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Delete a database with its records and requests
    Delete {
        id: DatabaseId,
        #[arg(long)]
        admin: String,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// Submit a download request
    Submit {
        staff: String,
        database: DatabaseId,
        count: u64,
    },
    /// Approve or reject a pending request
    Decide {
        id: RequestId,
        decision: Decision,
        #[arg(long)]
        admin: String,
    },
    /// List requests
    List {
        #[arg(long)]
        status: Option<RequestStatus>,
        #[arg(long)]
        staff: Option<String>,
        #[arg(long)]
        database: Option<DatabaseId>,
    },
    /// Show a request and its reserved records
    Show { id: RequestId },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Print the current policy
    Get,
    /// Replace the policy
    Set {
        #[arg(long)]
        enabled: bool,
        /// Largest request that is auto-approved (omit for unlimited)
        #[arg(long, allow_negative_numbers = true)]
        max: Option<i64>,
        #[arg(long)]
        admin: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Records stuck in `requested`
    Stuck {
        #[arg(long)]
        database: Option<DatabaseId>,
        /// Apply the repair after printing the diagnosis
        #[arg(long)]
        repair: bool,
    },
    /// Approved requests whose records were never assigned
    Recovery {
        /// Apply the recovery after printing the diagnosis
        #[arg(long)]
        repair: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leadpool".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut engine = Engine::from_config(&config)?;

    match cli.command {
        Command::Db { action } => cmd_db(&mut engine, action),
        Command::Request { action } => cmd_request(&mut engine, action),
        Command::Policy { action } => cmd_policy(&mut engine, action),
        Command::Audit { action } => cmd_audit(&mut engine, action),
        Command::Events { since } => {
            for event in engine.get_events_since(since)? {
                println!(
                    "{:>6}  {}  {}",
                    event.seq,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    serde_json::to_string(&event.kind)?
                );
            }
            Ok(())
        }
    }
}

fn cmd_db(engine: &mut Engine, action: DbAction) -> anyhow::Result<()> {
    match action {
        DbAction::Import {
            file,
            uploaded_by,
            product,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let rows: Vec<RowData> = serde_json::from_str(&content)?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let mut new = NewDatabase::new(filename, uploaded_by);
            if let Some(product) = product {
                new = new.product(product);
            }
            let database = engine.create_database(new, rows)?;
            println!(
                "Created: {} ({} records)",
                database.id, database.total_records
            );
        }
        DbAction::List => {
            let databases = engine.list_databases()?;
            if databases.is_empty() {
                println!("No databases found.");
                return Ok(());
            }

            println!(
                "{:<36}  {:<30}  {:>7}  {:<12}  UPLOADED",
                "ID", "FILE", "RECORDS", "BY"
            );
            println!("{}", "-".repeat(110));
            for db in &databases {
                println!(
                    "{:<36}  {:<30}  {:>7}  {:<12}  {}",
                    db.id,
                    truncate(&db.filename, 30),
                    db.total_records,
                    truncate(db.uploaded_by.as_str(), 12),
                    db.uploaded_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} database(s)", databases.len());
        }
        DbAction::Show { id } => {
            let db = engine.get_database(id)?;
            let counts = engine.status_counts(id)?;
            println!("ID:         {}", db.id);
            println!("File:       {}", db.filename);
            println!("Product:    {}", db.product_id.as_deref().unwrap_or("-"));
            println!("Uploaded:   {} by {}", db.uploaded_at, db.uploaded_by);
            println!("---");
            for status in RecordStatus::ALL {
                println!("{:<11} {}", format!("{status}:"), counts.get(status));
            }
            println!("{:<11} {}", "total:", counts.total_records);
            if !counts.is_balanced() {
                println!("WARNING: status counts do not add up to the total");
            }
        }
        DbAction::Records {
            id,
            status,
            offset,
            limit,
        } => {
            let records = engine.database_records(
                id,
                &RecordFilter {
                    status,
                    offset,
                    limit: Some(limit),
                },
            )?;
            for record in &records {
                println!(
                    "{:>6}  {:<10}  {:<12}  {}",
                    record.row_number,
                    record.status,
                    record.assigned_to.as_ref().map_or("-", StaffId::as_str),
                    serde_json::to_string(&record.row_data)?
                );
            }
        }
        DbAction::Delete { id, admin } => {
            engine.delete_database(id, &StaffId::new(admin))?;
            println!("Deleted: {id}");
        }
    }
    Ok(())
}

fn cmd_request(engine: &mut Engine, action: RequestAction) -> anyhow::Result<()> {
    match action {
        RequestAction::Submit {
            staff,
            database,
            count,
        } => {
            let request = engine.submit(&StaffId::new(staff), database, count)?;
            println!("Submitted: {} (status: {})", request.id, request.status);
        }
        RequestAction::Decide {
            id,
            decision,
            admin,
        } => {
            let request = engine.decide(id, decision, &StaffId::new(admin))?;
            println!("Decided: {} (status: {})", request.id, request.status);
        }
        RequestAction::List {
            status,
            staff,
            database,
        } => {
            let requests = engine.list_requests(&RequestFilter {
                staff_id: staff.map(StaffId::new),
                database_id: database,
                status,
            })?;
            if requests.is_empty() {
                println!("No requests found.");
                return Ok(());
            }

            println!(
                "{:<36}  {:<12}  {:>6}  {:<9}  CREATED",
                "ID", "STAFF", "COUNT", "STATUS"
            );
            println!("{}", "-".repeat(90));
            for r in &requests {
                println!(
                    "{:<36}  {:<12}  {:>6}  {:<9}  {}",
                    r.id,
                    truncate(r.staff_id.as_str(), 12),
                    r.requested_count,
                    r.status,
                    r.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} request(s)", requests.len());
        }
        RequestAction::Show { id } => {
            let request = engine.get_request(id)?;
            println!("ID:         {}", request.id);
            println!("Database:   {}", request.database_id);
            println!("Staff:      {}", request.staff_id);
            println!("Count:      {}", request.requested_count);
            println!("Status:     {}", request.status);
            println!("Created:    {}", request.created_at);
            if let (Some(at), Some(by)) = (request.decided_at, &request.decided_by) {
                println!("Decided:    {at} by {by}");
            }
            println!("---");
            for record in engine.request_records(id)? {
                println!(
                    "{:>6}  {:<10}  {}",
                    record.row_number,
                    record.status,
                    record.assigned_to.as_ref().map_or("-", StaffId::as_str)
                );
            }
        }
    }
    Ok(())
}

fn cmd_policy(engine: &mut Engine, action: PolicyAction) -> anyhow::Result<()> {
    let policy = match action {
        PolicyAction::Get => engine.get_policy()?,
        PolicyAction::Set {
            enabled,
            max,
            admin,
        } => engine.set_policy(
            PolicyUpdate {
                enabled,
                max_records_per_request: max,
            },
            &StaffId::new(admin),
        )?,
    };

    println!("Enabled:    {}", policy.enabled);
    println!(
        "Max:        {}",
        policy
            .max_records_per_request
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );
    if let (Some(at), Some(by)) = (policy.updated_at, &policy.updated_by) {
        println!("Updated:    {at} by {by}");
    }
    Ok(())
}

/// Diagnosis is always printed first; repairs only run on `--repair`.
fn cmd_audit(engine: &mut Engine, action: AuditAction) -> anyhow::Result<()> {
    match action {
        AuditAction::Stuck { database, repair } => {
            let report = engine.diagnose_stuck(database)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if repair {
                let summary = engine.repair_stuck(database)?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        AuditAction::Recovery { repair } => {
            let report = engine.diagnose_recovery_needed()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if repair {
                let summary = engine.recover_approved()?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
