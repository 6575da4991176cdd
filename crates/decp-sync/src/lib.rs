//! Run orchestration: fetch the configured sources, resolve each one, merge them
//! and publish the run outputs under `<dist>/<run_date>/`.

mod export;
mod snapshot;
mod stats;
mod tables;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use decp_adapters::{adapter_for_schema, AdapterContext, AdapterReport, SourceSchema};
use decp_core::{
    concat_and_dedup, ConcatReport, Engine, ResolveConfig, SequenceOrder, SourceReport,
    SubmissionResolver,
};
use decp_storage::{is_remote, BackoffPolicy, CachedSource, HttpClientConfig, HttpFetcher, SourceCache};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use export::{
    awardees_batch, contracts_batch, manifest_entry, write_csv, write_parquet, ManifestFile,
    ParquetManifest, MANIFEST_SCHEMA_VERSION,
};
pub use snapshot::write_snapshot;
pub use stats::{RunStatistics, YearStats, FIRST_STATS_YEAR};
pub use tables::{CompanyKey, ContractAwardeeLink, OutputTables};

pub const CRATE_NAME: &str = "decp-sync";

pub const AWARDEES_PARQUET: &str = "decp.parquet";
pub const AWARDEES_CSV: &str = "decp.csv";
pub const CONTRACTS_PARQUET: &str = "marches.parquet";
pub const SQLITE_SNAPSHOT: &str = "decp.sqlite";
pub const RUN_METADATA: &str = "run_metadata.json";
pub const RUN_BRIEF: &str = "brief.md";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file_name: String,
    /// Download URL, or a local path when it does not start with `http`.
    pub url: String,
    pub schema: SourceSchema,
    #[serde(default = "default_process")]
    pub process: bool,
}

fn default_process() -> bool {
    true
}

impl SourceRegistry {
    /// Parse a registry; relative local paths are resolved against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self> {
        let mut registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        for source in &mut registry.sources {
            if !is_remote(&source.url) && Path::new(&source.url).is_relative() {
                source.url = base_dir.join(&source.url).display().to_string();
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.process)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dist_dir: PathBuf,
    pub data_dir: PathBuf,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub same_day_order: SequenceOrder,
    /// Fixed run date; today (UTC) when unset.
    pub run_date: Option<NaiveDate>,
}

/// `DECP_SAME_DAY_ORDER`: `descending` (or `desc`) reverses same-date amendments;
/// anything else keeps them in ascending sequence order.
pub fn parse_same_day_order(value: Option<&str>) -> SequenceOrder {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("descending" | "desc") => SequenceOrder::Descending,
        _ => SequenceOrder::Ascending,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            dist_dir: std::env::var("DECP_DIST_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./dist")),
            data_dir: std::env::var("DECP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sources_path: std::env::var("DECP_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            scheduler_enabled: std::env::var("DECP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("DECP_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * Mon-Fri".to_string()),
            user_agent: std::env::var("DECP_USER_AGENT")
                .unwrap_or_else(|_| format!("decp-bot/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("DECP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            http_max_retries: std::env::var("DECP_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            same_day_order: parse_same_day_order(
                std::env::var("DECP_SAME_DAY_ORDER").ok().as_deref(),
            ),
            run_date: None,
        }
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn run_dir(&self, run_date: NaiveDate) -> PathBuf {
        self.dist_dir.join(run_date.format("%Y-%m-%d").to_string())
    }
}

/// What happened to one source during a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub file_name: String,
    pub schema: SourceSchema,
    pub url: String,
    pub path: String,
    pub sha256: String,
    pub byte_size: usize,
    pub downloaded: bool,
    pub adapter: AdapterReport,
    pub resolution: SourceReport,
    pub warnings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub concat: ConcatReport,
    pub statistics: RunStatistics,
    pub outputs: ParquetManifest,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub rows: usize,
    pub contracts: usize,
    pub duplicates_removed: usize,
    pub warnings: usize,
    pub run_dir: String,
    pub parquet_manifest: String,
    pub sqlite: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    cache: SourceCache,
    http: HttpFetcher,
    engine: Engine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let cache = SourceCache::new(config.data_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        })?;
        let engine = Engine::new(
            SubmissionResolver::default(),
            ResolveConfig {
                same_day_order: config.same_day_order,
            },
        );
        Ok(Self {
            config,
            cache,
            http,
            engine,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Download (or reuse) every enabled source for the run date without processing it.
    pub async fn fetch_sources(&self) -> Result<Vec<CachedSource>> {
        let registry = self.load_source_registry().await?;
        let run_date = self.config.run_date();
        let mut cached = Vec::new();
        for source in registry.enabled() {
            cached.push(
                self.cache
                    .fetch_or_load(&self.http, &source.file_name, &source.url, run_date)
                    .await?,
            );
        }
        Ok(cached)
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let run_date = self.config.run_date();
        let registry = self.load_source_registry().await?;
        info!(%run_id, %run_date, sources = registry.enabled().count(), "starting run");

        let mut summaries = Vec::new();
        let mut tables = Vec::new();
        for source in registry.enabled() {
            let cached = self
                .cache
                .fetch_or_load(&self.http, &source.file_name, &source.url, run_date)
                .await?;
            let ctx = AdapterContext {
                file_name: source.file_name.clone(),
                run_date,
            };
            let parsed = adapter_for_schema(source.schema)
                .parse_file(&ctx, &cached.path)
                .await
                .with_context(|| format!("parsing {}", source.file_name))?;
            let (table, report) = self
                .engine
                .resolve_source(parsed.table)
                .with_context(|| format!("resolving {}", source.file_name))?;

            summaries.push(SourceSummary {
                file_name: source.file_name.clone(),
                schema: source.schema,
                url: source.url.clone(),
                path: cached.path.display().to_string(),
                sha256: cached.sha256,
                byte_size: cached.byte_size,
                downloaded: cached.downloaded,
                warnings: report.warning_count(),
                adapter: parsed.report,
                resolution: report,
            });
            tables.push(table);
        }

        let (merged, concat) = concat_and_dedup(tables);
        let outputs = OutputTables::build(merged);

        let run_dir = self.config.run_dir(run_date);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let (manifest, manifest_path) = self.export_files(&run_dir, &outputs).await?;
        let sqlite_path = run_dir.join(SQLITE_SNAPSHOT);
        write_snapshot(&sqlite_path, &outputs).await?;
        let statistics = stats::compute(&outputs, run_date);

        let warnings = summaries.iter().map(|s| s.warnings).sum();
        if warnings > 0 {
            warn!(warnings, "run finished with resolution warnings");
        }

        let metadata = RunMetadata {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            sources: summaries,
            concat,
            statistics,
            outputs: manifest,
        };
        write_reports(&run_dir, &metadata).await?;

        info!(
            %run_id,
            rows = metadata.statistics.rows,
            contracts = metadata.statistics.contracts,
            run_dir = %run_dir.display(),
            "run complete"
        );

        Ok(RunSummary {
            run_id,
            run_date,
            started_at,
            finished_at: metadata.finished_at,
            sources: metadata.sources.len(),
            rows: metadata.statistics.rows,
            contracts: metadata.statistics.contracts,
            duplicates_removed: metadata.concat.duplicates_removed,
            warnings,
            run_dir: run_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
            sqlite: sqlite_path.display().to_string(),
        })
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let mut config = self.config.clone();
        // Scheduled runs always use the date they fire on.
        config.run_date = None;
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let config = config.clone();
            Box::pin(async move {
                let outcome = match SyncPipeline::new(config) {
                    Ok(pipeline) => pipeline.run_once().await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.rows,
                        "scheduled run complete"
                    ),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "scheduled run failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = &self.config.sources_path;
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        SourceRegistry::from_yaml(&text, base_dir)
            .with_context(|| format!("parsing {}", path.display()))
    }

    async fn export_files(
        &self,
        run_dir: &Path,
        outputs: &OutputTables,
    ) -> Result<(ParquetManifest, PathBuf)> {
        let awardees_path = run_dir.join(AWARDEES_PARQUET);
        let contracts_path = run_dir.join(CONTRACTS_PARQUET);
        let csv_path = run_dir.join(AWARDEES_CSV);

        write_parquet(&awardees_path, &awardees_batch(&outputs.awardees)?)?;
        write_parquet(&contracts_path, &contracts_batch(&outputs.contracts)?)?;
        write_csv(&csv_path, &outputs.awardees)?;

        let manifest = ParquetManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            files: vec![
                manifest_entry("decp", run_dir, &awardees_path, outputs.awardees.len())?,
                manifest_entry("marches", run_dir, &contracts_path, outputs.contracts.len())?,
                manifest_entry("decp_csv", run_dir, &csv_path, outputs.awardees.len())?,
            ],
        };

        let manifest_path = run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok((manifest, manifest_path))
    }
}

async fn write_reports(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata).context("serializing run metadata")?;
    fs::write(run_dir.join(RUN_METADATA), json)
        .await
        .with_context(|| format!("writing {RUN_METADATA}"))?;
    fs::write(run_dir.join(RUN_BRIEF), run_brief(metadata))
        .await
        .with_context(|| format!("writing {RUN_BRIEF}"))?;
    Ok(())
}

fn run_brief(metadata: &RunMetadata) -> String {
    let stats = &metadata.statistics;
    let mut lines = vec![
        "# DECP Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", metadata.run_id),
        format!("- Run date: {}", metadata.run_date),
        format!("- Started: {}", metadata.started_at),
        format!("- Finished: {}", metadata.finished_at),
        format!("- Sources processed: {}", metadata.sources.len()),
        format!("- Rows: {} ({} columns)", stats.rows, stats.columns),
        format!("- Contracts: {}", stats.contracts),
        format!("- Buyers: {}", stats.buyers),
        format!("- Awardees: {}", stats.awardees),
        format!(
            "- Duplicate rows removed across sources: {}",
            metadata.concat.duplicates_removed
        ),
        format!(
            "- Current flags corrected across sources: {}",
            metadata.concat.current_flags_corrected
        ),
        format!("- Implausible dates: {}", stats.implausible_dates),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &metadata.sources {
        lines.push(format!(
            "- {} ({}): {} records, {} duplicate submissions, {} rows, {} warnings",
            source.file_name,
            source.schema,
            source.adapter.records,
            source.resolution.submissions.duplicates_removed,
            source.resolution.awardee_rows,
            source.warnings
        ));
    }

    lines.push(String::new());
    lines.push("## Yearly Statistics".to_string());
    lines.push(String::new());
    lines.push("| year | published | notified | amount sum | amount median |".to_string());
    lines.push("|---|---|---|---|---|".to_string());
    for (year, y) in &stats.years {
        lines.push(format!(
            "| {year} | {} | {} | {} | {} |",
            y.published,
            y.notified,
            format_amount(y.notified_amount_sum),
            format_amount(y.notified_amount_median)
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn format_amount(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

/// Markdown digest of the latest `runs` run directories under `dist_dir`.
pub fn report_markdown(runs: usize, dist_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(dist_dir)
        .with_context(|| format!("reading {}", dist_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(RUN_METADATA).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# DECP Runs".to_string(), String::new()];
    for dir in dirs {
        let run_name = dir.file_name().to_string_lossy().to_string();
        let metadata_path = dir.path().join(RUN_METADATA);
        let metadata: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&metadata_path)
                .with_context(|| format!("reading {}", metadata_path.display()))?,
        )
        .with_context(|| format!("parsing {}", metadata_path.display()))?;

        let stat = |key: &str| {
            metadata
                .get("statistics")
                .and_then(|v| v.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let sources = metadata
            .get("sources")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let run_id = metadata
            .get("run_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run {run_name}"));
        lines.push(format!("- run id: `{run_id}`"));
        lines.push(format!("- sources: {sources}"));
        lines.push(format!("- rows: {}", stat("rows")));
        lines.push(format!("- contracts: {}", stat("contracts")));
        lines.push(format!("- metadata: `{}`", metadata_path.display()));
        let brief_path = dir.path().join(RUN_BRIEF);
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        let manifest_path = dir.path().join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
