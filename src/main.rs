use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::sync::Arc;
use tracing::info;

use followgraph::api::{AuditLog, CredentialPool, FollowingClient};
use followgraph::config::Config;
use followgraph::db::models::{Credential, CREDENTIAL_STATUS_ACTIVE, CREDENTIAL_STATUS_ERROR};
#[cfg(feature = "postgres")]
use followgraph::db::models::TransferKind;
use followgraph::db::DocumentStore;
use followgraph::pipeline::{CrawlOutcome, Crawler, Ingestor, WorkOutcome, Worker};
use followgraph::queue::WorkQueue;

/// Followgraph: crawl follow relationships into a document store and
/// replicate them into PostgreSQL.
#[derive(Parser)]
#[command(name = "followgraph", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the document store
    Init,

    /// Run a crawl worker against one queue (user, tracking, auto-tracking, kol)
    Crawl {
        queue: String,

        /// Process a single item and exit
        #[arg(long)]
        once: bool,
    },

    /// Queue a subject for crawling
    Enqueue {
        queue: String,
        external_id: String,

        #[arg(long)]
        handle: Option<String>,
    },

    /// Make a subject eligible for crawling again
    Reset { queue: String, external_id: String },

    /// Manage bot sessions used against the following API
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Copy untransferred accounts and edges into PostgreSQL
    #[cfg(feature = "postgres")]
    Transfer {
        #[arg(value_enum, default_value = "all")]
        kind: KindArg,

        /// One transaction per record instead of one per batch
        #[arg(long)]
        per_record: bool,

        /// Drain once and exit instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Queue subjects listed in PostgreSQL (registered users or tracked accounts)
    #[cfg(feature = "postgres")]
    ImportSubjects {
        #[arg(value_enum)]
        source: SourceArg,
    },

    /// Show store counts, queue states and transfer backlog
    Status,
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Add or replace a session
    Add {
        handle: String,
        #[arg(long)]
        cookie: String,
        #[arg(long)]
        auth_token: String,
        #[arg(long)]
        csrf_token: String,
        #[arg(long, default_value = DEFAULT_USER_AGENT)]
        user_agent: String,
    },
    /// Take a session out of rotation
    Disable { handle: String },
    /// Put a disabled session back into rotation
    Enable { handle: String },
    List,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[cfg(feature = "postgres")]
#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Accounts,
    Edges,
    All,
}

#[cfg(feature = "postgres")]
impl KindArg {
    fn kinds(self) -> &'static [TransferKind] {
        match self {
            KindArg::Accounts => &[TransferKind::Account],
            KindArg::Edges => &[TransferKind::Edge],
            KindArg::All => &[TransferKind::Account, TransferKind::Edge],
        }
    }
}

#[cfg(feature = "postgres")]
#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Users,
    Tracking,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Set up structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("followgraph=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            info!("Initializing followgraph document store...");
            let config = Config::load()?;
            let conn = followgraph::db::initialize(&config.db_path)?;
            let table_count = followgraph::db::schema::table_count(&conn)?;

            println!("Document store ready at {}", config.db_path);
            println!("Tables created: {table_count}");
            println!("\nNext: add a session with `followgraph credentials add`");
            println!("Then queue subjects and run `followgraph crawl <queue>`");
        }

        Commands::Crawl { queue, once } => {
            let config = Config::load()?;
            let queue = parse_queue(&queue)?;
            let store = followgraph::db::open_store(&config.db_path)?;

            let pool = CredentialPool::load(store.as_ref()).await?;
            if pool.is_empty() {
                anyhow::bail!(
                    "No usable credentials. Add one with `followgraph credentials add` \
                     or re-enable a disabled one."
                );
            }
            info!(queue = queue.name, credentials = pool.len(), "Starting crawl worker");

            let audit = AuditLog::new(config.audit_log.clone(), config.error_log.clone());
            let client = FollowingClient::new(
                &config.following_api_url,
                Arc::new(pool),
                audit.clone(),
            )?;
            let crawler = Crawler::new(
                Arc::new(client),
                Ingestor::new(store.clone(), audit),
                config.crawl_settings(&queue),
            );
            let worker = Worker::new(store, crawler, queue, config.idle_delay);

            if once {
                print_work_outcome(&worker.run_once().await?);
            } else {
                worker.run_forever().await?;
            }
        }

        Commands::Enqueue {
            queue,
            external_id,
            handle,
        } => {
            let config = Config::load()?;
            let queue = parse_queue(&queue)?;
            let store = followgraph::db::open_store(&config.db_path)?;

            followgraph::pipeline::enqueue(store.as_ref(), &queue, &external_id, handle.as_deref())
                .await?;
            println!("Queued {external_id} on {}", queue.name.bold());
        }

        Commands::Reset { queue, external_id } => {
            let config = Config::load()?;
            let queue = parse_queue(&queue)?;
            let store = followgraph::db::open_store(&config.db_path)?;

            if followgraph::pipeline::requeue(store.as_ref(), &queue, &external_id).await? {
                println!("Reset {external_id} on {}", queue.name.bold());
            } else {
                println!("{external_id} is not queued on {}", queue.name);
            }
        }

        Commands::Credentials { action } => {
            let config = Config::load()?;
            let store = followgraph::db::open_store(&config.db_path)?;
            run_credentials(store.as_ref(), action).await?;
        }

        #[cfg(feature = "postgres")]
        Commands::Transfer {
            kind,
            per_record,
            once,
        } => {
            let config = Config::load()?;
            let url = config.require_relational()?;
            let store = followgraph::db::open_store(&config.db_path)?;
            let target = followgraph::db::connect_postgres(url).await?;

            let mode = if per_record {
                followgraph::pipeline::TransferMode::PerRecord
            } else {
                followgraph::pipeline::TransferMode::Batch
            };
            let transfer = followgraph::pipeline::Transfer::new(
                store,
                target,
                config.transfer_settings(mode),
            );

            info!(
                environment = %config.transfer_environment,
                batch_size = config.transfer_batch_size,
                "Starting transfer"
            );
            if once {
                for &kind in kind.kinds() {
                    drain_with_progress(&transfer, kind, config.transfer_batch_size).await?;
                }
            } else {
                transfer.run_forever(kind.kinds()).await?;
            }
        }

        #[cfg(feature = "postgres")]
        Commands::ImportSubjects { source } => {
            let config = Config::load()?;
            let url = config.require_relational()?;
            let store = followgraph::db::open_store(&config.db_path)?;
            let relational = followgraph::db::connect_postgres(url).await?;

            let source = match source {
                SourceArg::Users => followgraph::db::SubjectSource::Users,
                SourceArg::Tracking => followgraph::db::SubjectSource::Tracking,
            };
            let subjects = relational.load_subjects(source).await?;
            let queue = source.queue();
            for subject in &subjects {
                followgraph::pipeline::enqueue(
                    store.as_ref(),
                    &queue,
                    &subject.external_id,
                    subject.handle.as_deref(),
                )
                .await?;
            }
            println!("Queued {} subjects on {}", subjects.len(), queue.name.bold());
        }

        Commands::Status => {
            let config = Config::load()?;
            if !followgraph::status::is_initialized(&config.db_path) {
                println!("Document store not found. Run `followgraph init` first.");
                return Ok(());
            }
            let store = followgraph::db::open_store(&config.db_path)?;
            followgraph::status::show(&store, &config.db_path, &config.transfer_environment)
                .await?;
        }
    }

    Ok(())
}

fn parse_queue(name: &str) -> Result<WorkQueue> {
    WorkQueue::named(name).ok_or_else(|| {
        let known: Vec<&str> = followgraph::queue::ALL.iter().map(|q| q.name).collect();
        anyhow::anyhow!("Unknown queue '{name}'. Expected one of: {}", known.join(", "))
    })
}

fn print_work_outcome(outcome: &WorkOutcome) {
    match outcome {
        WorkOutcome::Idle => println!("Nothing to crawl right now."),
        WorkOutcome::Skipped { external_id } => {
            println!("{external_id} is already tracked by another queue, marked completed.")
        }
        WorkOutcome::Lost { external_id } => {
            println!("{external_id} was claimed by another worker.")
        }
        WorkOutcome::Crawled {
            external_id,
            report,
        } => {
            let outcome = match &report.outcome {
                CrawlOutcome::Aborted { reason } => format!("aborted: {reason}").red().to_string(),
                other => format!("{other:?}").to_lowercase(),
            };
            println!("{}", format!("Crawled {external_id}").bold());
            println!("  Pages: {}", report.pages);
            println!("  Records: {}", report.records.len());
            println!(
                "  New accounts: {}, new edges: {}",
                report.ingest.accounts.inserted, report.ingest.edges.inserted
            );
            if report.ingest.rejected > 0 {
                println!("  Rejected records: {}", report.ingest.rejected);
            }
            if report.auth_retries > 0 {
                println!("  Authorization retries: {}", report.auth_retries);
            }
            println!("  Stopped: {outcome}");
        }
    }
}

async fn run_credentials(store: &dyn DocumentStore, action: CredentialAction) -> Result<()> {
    match action {
        CredentialAction::Add {
            handle,
            cookie,
            auth_token,
            csrf_token,
            user_agent,
        } => {
            store
                .upsert_credential(&Credential {
                    handle: handle.clone(),
                    cookie,
                    auth_token,
                    csrf_token,
                    user_agent,
                    status: CREDENTIAL_STATUS_ACTIVE.to_string(),
                })
                .await?;
            println!("Saved session for {}", handle.bold());
        }
        CredentialAction::Disable { handle } => {
            if store
                .set_credential_status(&handle, CREDENTIAL_STATUS_ERROR)
                .await?
            {
                println!("{handle} removed from rotation");
            } else {
                println!("No session named {handle}");
            }
        }
        CredentialAction::Enable { handle } => {
            if store
                .set_credential_status(&handle, CREDENTIAL_STATUS_ACTIVE)
                .await?
            {
                println!("{handle} back in rotation");
            } else {
                println!("No session named {handle}");
            }
        }
        CredentialAction::List => {
            let credentials = store.list_credentials().await?;
            if credentials.is_empty() {
                println!("No sessions stored.");
            }
            for credential in credentials {
                let status = if credential.status == CREDENTIAL_STATUS_ERROR {
                    credential.status.red()
                } else {
                    credential.status.green()
                };
                println!("  {:<24} {}", credential.handle, status);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn drain_with_progress(
    transfer: &followgraph::pipeline::Transfer,
    kind: TransferKind,
    batch_size: u32,
) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("  {spinner} {msg}")?);

    let mut transferred = 0;
    let mut failed = 0;
    loop {
        let report = transfer.transfer(kind, batch_size).await?;
        transferred += report.transferred;
        failed += report.failed;
        pb.set_message(format!("{kind}: {transferred} transferred, {failed} failed"));
        pb.tick();
        if report.selected == 0 || report.failed > 0 {
            break;
        }
    }
    pb.finish_and_clear();

    let summary = format!("{kind}: {transferred} transferred");
    if failed > 0 {
        println!("{} ({failed} failed, will be retried)", summary.yellow());
    } else {
        println!("{}", summary.bold());
    }
    Ok(())
}
