use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use argus_client::{HtmdCleaner, OpenAiOracle, PaddleOcrClient, ReqwestFetcher, RobotsGuard};
use argus_core::models::FetchedPage;
use argus_core::task::{EnqueueOutcome, EnqueueRequest, Task, TaskStatus};
use argus_core::traits::PageFetcher;
use argus_core::{
    Cascade, DomRules, DomainThrottle, EngineConfig, IdentityPool, IdentitySpec,
    InMemoryResultStore, InMemoryTaskStore, SharedConfig, TaskStore, TracingWorkerReporter,
    WorkerPool,
};
use argus_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "argus", version, about = "Product-page scraping pipeline")]
struct Cli {
    /// Engine configuration file (JSON). ARGUS_* variables override it.
    #[arg(short, long, global = true, env = "ARGUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue product URLs for scraping
    Enqueue {
        /// URLs to enqueue
        urls: Vec<String>,

        /// File with one URL per line ('#' starts a comment)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Higher is scraped sooner
        #[arg(short, long, default_value_t = EnqueueRequest::DEFAULT_PRIORITY)]
        priority: i32,

        /// Attempts before the task fails (defaults to the store setting)
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Show a task by id or URL, with its result once completed
    Status {
        /// Task UUID or product URL
        target: String,
    },

    /// List tasks
    List {
        /// Only tasks in this status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Task counts per status
    Stats,

    /// Run the extraction cascade on a saved page, without fetching
    Extract {
        /// Saved HTML file
        #[arg(short, long)]
        file: PathBuf,

        /// URL the page was saved from
        #[arg(short, long)]
        url: String,

        /// PNG screenshot of the page, for the OCR strategy
        #[arg(long)]
        screenshot: Option<PathBuf>,

        #[command(flatten)]
        extraction: ExtractionArgs,
    },

    /// Run the worker pool until interrupted
    Worker {
        /// JSON file with the identity pool (proxies and sessions)
        #[arg(short, long, env = "ARGUS_IDENTITIES")]
        identities: Option<PathBuf>,

        /// Number of direct identities when no identity file is given
        #[arg(long, default_value_t = 4)]
        direct_identities: usize,

        /// Keep tasks in memory instead of PostgreSQL; exits when the queue drains
        #[arg(long, default_value_t = false)]
        in_memory: bool,

        /// URLs to seed the in-memory queue with
        #[arg(long, requires = "in_memory")]
        seed: Vec<String>,

        /// Honour robots.txt
        #[arg(long, default_value_t = false)]
        respect_robots: bool,

        /// Allow fetching private/loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,

        /// Render pages in headless Chromium (captures screenshots for OCR)
        #[cfg(feature = "browser")]
        #[arg(long, default_value_t = false)]
        browser: bool,

        #[command(flatten)]
        extraction: ExtractionArgs,
    },

    /// Delete completed/failed tasks older than the given age
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

/// Oracle, OCR and selector settings shared by `extract` and `worker`.
#[derive(Args, Clone)]
struct ExtractionArgs {
    /// Per-domain CSS selector rules (JSON)
    #[arg(long, env = "ARGUS_DOM_RULES")]
    dom_rules: Option<PathBuf>,

    /// LLM model; the oracle is disabled when unset
    #[arg(long, env = "ARGUS_LLM_MODEL")]
    llm_model: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "ARGUS_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    llm_base_url: String,

    #[arg(long, env = "ARGUS_LLM_API_KEY", default_value = "", hide_env_values = true)]
    llm_api_key: String,

    /// PaddleOCR service URL; OCR is disabled when unset
    #[arg(long, env = "ARGUS_OCR_URL")]
    ocr_url: Option<String>,
}

type ArgusCascade = Cascade<HtmdCleaner, Option<OpenAiOracle>, Option<PaddleOcrClient>>;

impl ExtractionArgs {
    fn build_cascade(&self, config: &EngineConfig) -> Result<ArgusCascade> {
        let oracle = match &self.llm_model {
            Some(model) => Some(
                OpenAiOracle::with_base_url(&self.llm_api_key, model, &self.llm_base_url)?
                    .with_timeout(config.cascade.llm_timeout)?,
            ),
            None => None,
        };
        let ocr = match &self.ocr_url {
            Some(url) => Some(PaddleOcrClient::with_timeout(url, config.cascade.ocr_timeout)?),
            None => None,
        };
        tracing::info!(
            llm = self.llm_model.as_deref().unwrap_or("disabled"),
            ocr = self.ocr_url.as_deref().unwrap_or("disabled"),
            "Extraction cascade configured"
        );

        let mut cascade = Cascade::new(HtmdCleaner::new(), oracle, ocr, config.breaker.clone());
        if let Some(path) = &self.dom_rules {
            let rules = DomRules::load_file(path)
                .with_context(|| format!("Failed to load DOM rules from {}", path.display()))?;
            cascade = cascade.with_dom_rules(rules);
        }
        Ok(cascade)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("argus=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("Invalid engine configuration")?;

    match cli.command {
        Commands::Enqueue {
            urls,
            file,
            priority,
            max_attempts,
        } => {
            let mut all = urls;
            if let Some(path) = file {
                all.extend(read_url_file(&path)?);
            }
            if all.is_empty() {
                bail!("No URLs given");
            }
            let db = connect_db().await?;
            cmd_enqueue(&db.task_repo(config.store.clone()), all, priority, max_attempts).await?;
        }
        Commands::Status { target } => {
            let db = connect_db().await?;
            cmd_status(&db, &config, &target).await?;
        }
        Commands::List {
            status,
            limit,
            offset,
            format,
        } => {
            let db = connect_db().await?;
            let tasks = db
                .task_repo(config.store.clone())
                .list(status, limit, offset)
                .await?;
            print_tasks(&tasks, format)?;
        }
        Commands::Stats => {
            let db = connect_db().await?;
            let counts = db.task_repo(config.store.clone()).counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Extract {
            file,
            url,
            screenshot,
            extraction,
        } => {
            cmd_extract(&config, &file, &url, screenshot.as_deref(), &extraction).await?;
        }
        Commands::Worker {
            identities,
            direct_identities,
            in_memory,
            seed,
            respect_robots,
            allow_private,
            #[cfg(feature = "browser")]
            browser,
            extraction,
        } => {
            let specs = match identities {
                Some(path) => IdentitySpec::load_file(&path)?,
                None => vec![IdentitySpec::direct(); direct_identities.max(1)],
            };
            let opts = WorkerOptions {
                specs,
                in_memory,
                seed,
                config_path: cli.config.clone(),
                cascade: extraction.build_cascade(&config)?,
            };

            #[cfg(feature = "browser")]
            if browser {
                let fetcher = argus_client::BrowserFetcher::with_timeout(config.worker.fetch_timeout);
                return cmd_worker(config, fetcher, opts).await;
            }

            let mut fetcher = ReqwestFetcher::with_timeout(config.worker.fetch_timeout)?;
            if respect_robots {
                fetcher = fetcher.with_robots(RobotsGuard::new(argus_client::fetcher::DEFAULT_USER_AGENT)?);
            }
            if allow_private {
                fetcher = fetcher.allow_private_urls();
            }
            cmd_worker(config, fetcher, opts).await?;
        }
        Commands::Purge { older_than_days } => {
            let db = connect_db().await?;
            let older_than = Duration::from_secs(older_than_days * 24 * 60 * 60);
            let purged = db
                .task_repo(config.store.clone())
                .purge_terminal(older_than)
                .await?;
            println!("Purged {purged} tasks older than {older_than_days} days");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn read_url_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL file: {}", path.display()))?;
    Ok(parse_url_lines(&raw))
}

fn parse_url_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

async fn cmd_enqueue<S: TaskStore>(
    store: &S,
    urls: Vec<String>,
    priority: i32,
    max_attempts: Option<u32>,
) -> Result<()> {
    let (mut created, mut skipped, mut invalid) = (0, 0, 0);
    for url in urls {
        let mut request = EnqueueRequest::new(&url).with_priority(priority);
        if let Some(max) = max_attempts {
            request = request.with_max_attempts(max);
        }
        match store.enqueue(request).await {
            Ok(EnqueueOutcome::Created(task)) => {
                created += 1;
                println!("created  {}  {}", task.id, task.url);
            }
            Ok(EnqueueOutcome::DuplicateSkipped { canonical_url }) => {
                skipped += 1;
                println!("skipped  {canonical_url} (seen recently)");
            }
            Err(e) => {
                invalid += 1;
                tracing::warn!(%url, error = %e, "Rejected URL");
            }
        }
    }
    println!("\n{created} created, {skipped} duplicates skipped, {invalid} rejected");
    Ok(())
}

async fn cmd_status(db: &Database, config: &EngineConfig, target: &str) -> Result<()> {
    let repo = db.task_repo(config.store.clone());
    let task = match Uuid::parse_str(target) {
        Ok(id) => repo.get(id).await?,
        Err(_) => repo.get_by_url(target).await?,
    };
    let Some(task) = task else {
        bail!("No task found for {target}");
    };

    let result = match task.result_id {
        Some(id) => db.result_repo().get(id).await?,
        None => None,
    };
    let out = serde_json::json!({
        "task": task,
        "result": result,
        "discount_percent": result.as_ref().and_then(|r| r.result.fields.discount_percent()),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_tasks(tasks: &[Task], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.write_record([
                "id", "url", "status", "priority", "attempts", "max_attempts", "error_kind",
                "last_error", "created_at",
            ])?;
            for t in tasks {
                wtr.write_record([
                    t.id.to_string(),
                    t.url.clone(),
                    t.status.to_string(),
                    t.priority.to_string(),
                    t.attempts.to_string(),
                    t.max_attempts.to_string(),
                    t.error_kind.map(|k| k.to_string()).unwrap_or_default(),
                    t.last_error.clone().unwrap_or_default(),
                    t.created_at.to_rfc3339(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks");
                return Ok(());
            }
            let mut out = std::io::stdout().lock();
            for t in tasks {
                writeln!(
                    out,
                    "{}  {:<9}  p{:<3} {}/{}  {}{}",
                    t.id,
                    t.status,
                    t.priority,
                    t.attempts,
                    t.max_attempts,
                    t.url,
                    t.last_error
                        .as_deref()
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default(),
                )?;
            }
            writeln!(out, "\n{} tasks", tasks.len())?;
        }
    }
    Ok(())
}

async fn cmd_extract(
    config: &EngineConfig,
    file: &Path,
    url: &str,
    screenshot: Option<&Path>,
    extraction: &ExtractionArgs,
) -> Result<()> {
    let html = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read HTML file: {}", file.display()))?;
    let mut page = FetchedPage::new(url, html);
    if let Some(path) = screenshot {
        let png = std::fs::read(path)
            .with_context(|| format!("Failed to read screenshot: {}", path.display()))?;
        page = page.with_screenshot(png);
    }

    let cascade = extraction.build_cascade(config)?;
    let result = cascade.run(&page, &config.cascade).await?;

    tracing::info!(
        strategy = %result.strategy_used,
        confidence = result.confidence,
        fallback_count = result.fallback_count,
        "Extraction complete"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

struct WorkerOptions {
    specs: Vec<IdentitySpec>,
    in_memory: bool,
    seed: Vec<String>,
    config_path: Option<PathBuf>,
    cascade: ArgusCascade,
}

async fn cmd_worker<F>(config: EngineConfig, fetcher: F, opts: WorkerOptions) -> Result<()>
where
    F: PageFetcher + 'static,
{
    let identities = IdentityPool::new(opts.specs, config.pool.clone());
    let throttle = DomainThrottle::new(config.throttle.clone());
    let shared = SharedConfig::new(config.clone());
    let cancel = CancellationToken::new();

    spawn_shutdown_listener(cancel.clone());
    if let Some(path) = opts.config_path.clone() {
        spawn_reload_listener(path, shared.clone());
    }

    if opts.in_memory {
        let store = InMemoryTaskStore::new(config.store.clone());
        cmd_enqueue(&store, opts.seed, EnqueueRequest::DEFAULT_PRIORITY, None).await?;
        let results = InMemoryResultStore::new();
        let pool = WorkerPool::new(
            store.clone(),
            fetcher,
            opts.cascade,
            results.clone(),
            identities,
            throttle,
            shared,
        );
        spawn_drain_watcher(store.clone(), cancel.clone());
        pool.run(cancel, Arc::new(TracingWorkerReporter)).await?;
        log_shutdown_stats(pool.identities(), pool.cascade());

        for stored in results.all() {
            println!("{}", serde_json::to_string(&stored)?);
        }
        let counts = store.counts().await?;
        tracing::info!(completed = counts.completed, failed = counts.failed, "Queue drained");
        for task in store.list(Some(TaskStatus::Failed), usize::MAX, 0).await? {
            tracing::warn!(
                url = %task.url,
                kind = task.error_kind.map(|k| k.as_str()),
                error = task.last_error.as_deref(),
                "Task failed"
            );
        }
    } else {
        let db = connect_db().await?;
        let store = db.task_repo(config.store.clone());
        let recovered = store.recover_stale(config.worker.stale_task_timeout).await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered stale tasks from a previous run");
        }
        let pool = WorkerPool::new(
            store,
            fetcher,
            opts.cascade,
            db.result_repo(),
            identities,
            throttle,
            shared,
        );
        pool.run(cancel, Arc::new(TracingWorkerReporter)).await?;
        log_shutdown_stats(pool.identities(), pool.cascade());
    }
    Ok(())
}

fn log_shutdown_stats(identities: &IdentityPool, cascade: &ArgusCascade) {
    let stats = identities.stats();
    tracing::info!(
        leases_granted = stats.leases_granted,
        leases_forced = stats.leases_forced,
        quarantined = stats.quarantined,
        "Identity pool at shutdown"
    );
    for breaker in [cascade.llm_breaker(), cascade.ocr_breaker()] {
        let stats = breaker.stats();
        if stats.failure_count > 0 || stats.last_error.is_some() {
            tracing::info!(
                circuit = %stats.name,
                state = %stats.state,
                failures = stats.failure_count,
                last_error = stats.last_error.as_deref(),
                "Circuit breaker at shutdown"
            );
        }
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight tasks");
            cancel.cancel();
        }
    });
}

/// Reloads the config file on SIGHUP. Only hot-reloadable settings take effect.
#[cfg(unix)]
fn spawn_reload_listener(path: PathBuf, shared: SharedConfig) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let Ok(mut hangups) = signal(SignalKind::hangup()) else {
            tracing::warn!("Cannot listen for SIGHUP; config reload disabled");
            return;
        };
        while hangups.recv().await.is_some() {
            match EngineConfig::from_file(&path).and_then(|c| shared.replace(c)) {
                Ok(()) => tracing::info!(path = %path.display(), "Configuration reloaded"),
                Err(e) => tracing::error!(error = %e, "Configuration reload rejected"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_path: PathBuf, _shared: SharedConfig) {}

/// Cancels once no task is pending or in flight.
fn spawn_drain_watcher(store: InMemoryTaskStore, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            match store.counts().await {
                Ok(c) if c.pending + c.leased + c.running == 0 => {
                    cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Cannot read queue counts"),
            }
        }
    });
}
