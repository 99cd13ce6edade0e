use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sweep_core::{
    load_request_file, load_tuner_config, ApiError, AutoSweepRequest, AutoTuneRequest,
    HistoryError, ParamValue, RunComparison, RunFilter, SqliteSweepStore, StatusResponse,
    SweepError, SweepRunRecord, SyntheticEvaluator, Termination, TuneError, TunerConfig,
    TuningService,
};
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] sweep_core::ConfigError),
    #[error("{0}")]
    Request(#[from] ApiError),
    #[error("invalid parameter space: {0}")]
    Sweep(#[from] SweepError),
    #[error("tuning error: {0}")]
    Tune(#[from] TuneError),
    #[error("history error: {0}")]
    History(#[from] HistoryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("session ended with status {status}: {message}")]
    SessionFailed { status: String, message: String },
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "LiDAR parameter sweep and auto-tune control",
    long_about = None
)]
pub struct Cli {
    /// Path to tuner.toml
    #[arg(long, global = true, default_value = "configs/tuner.toml")]
    pub config: PathBuf,
    /// Run history database (overrides history.path)
    #[arg(long, global = true)]
    pub history_db: Option<PathBuf>,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validates a request and lists its round-1 combinations
    Grid(GridArgs),
    /// Runs a multi-round auto-tune session against the synthetic evaluator
    Auto(RunArgs),
    /// Runs a single sweep against the synthetic evaluator
    Sweep(RunArgs),
    /// Inspects recorded sessions
    #[command(subcommand)]
    History(HistoryCommands),
}

#[derive(Args, Debug)]
pub struct GridArgs {
    /// JSON or YAML request file
    #[arg(long)]
    pub request: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON or YAML request file
    #[arg(long)]
    pub request: PathBuf,
    /// Target id the session is registered under
    #[arg(long, default_value = "synthetic")]
    pub target: String,
    /// Status polling interval in milliseconds
    #[arg(long, default_value_t = 200)]
    pub poll_ms: u64,
    /// Skip settle and sample waits
    #[arg(long, default_value_t = false)]
    pub instant: bool,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    /// Lists recorded sessions, newest first
    List(HistoryListArgs),
    /// Shows one recorded session
    Show {
        run_id: String,
    },
    /// Compares the recommendations of two sessions
    Compare {
        left: String,
        right: String,
    },
}

#[derive(Args, Debug)]
pub struct HistoryListArgs {
    /// Filter by target
    #[arg(long)]
    pub target: Option<String>,
    /// Filter by termination (converged, exhausted, cancelled, failed)
    #[arg(long)]
    pub termination: Option<String>,
    /// Maximum number of rows
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Grid(args) => {
            let grid = context.grid(args)?;
            render(&grid, cli.format)?;
        }
        Commands::Auto(args) => {
            let status = context.run_session(args, false)?;
            render(&status, cli.format)?;
            status.ensure_success()?;
        }
        Commands::Sweep(args) => {
            let status = context.run_session(args, true)?;
            render(&status, cli.format)?;
            status.ensure_success()?;
        }
        Commands::History(HistoryCommands::List(args)) => {
            let list = context.history_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::History(HistoryCommands::Show { run_id }) => {
            let record = context.history_show(run_id)?;
            render(&record, cli.format)?;
        }
        Commands::History(HistoryCommands::Compare { left, right }) => {
            let comparison = context.history_compare(left, right)?;
            render(&comparison, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: TunerConfig,
    history_db: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = if cli.config.exists() {
            load_tuner_config(&cli.config)?
        } else {
            info!(
                target: "sweepctl",
                path = %cli.config.display(),
                "config not found, using built-in defaults"
            );
            TunerConfig::default()
        };
        let history_db = cli.history_db.clone().or_else(|| {
            config
                .history
                .enabled
                .then(|| config.history.path.clone())
        });
        Ok(Self { config, history_db })
    }

    fn load_request(&self, path: &Path) -> Result<AutoTuneRequest> {
        let wire: AutoSweepRequest = load_request_file(path)?;
        Ok(wire.into_request(&self.config)?)
    }

    fn grid(&self, args: &GridArgs) -> Result<GridReport> {
        let request = self.load_request(&args.request)?;
        request.validate(&self.config.limits)?;
        let combinations = request
            .space
            .enumerate(request.values_per_param)?
            .into_iter()
            .map(|combination| combination.as_map().clone())
            .collect::<Vec<_>>();
        Ok(GridReport {
            values_per_param: request.values_per_param,
            bounds: request
                .space
                .bounds()
                .into_iter()
                .map(|(name, (min, max))| (name, [min, max]))
                .collect(),
            total: combinations.len(),
            combinations,
        })
    }

    fn run_session(&self, args: &RunArgs, single_pass: bool) -> Result<SessionReport> {
        let mut request = self.load_request(&args.request)?;
        if args.instant {
            request.eval.settle_time = Duration::ZERO;
            request.eval.sample_interval = Duration::ZERO;
        }

        let mut service = TuningService::new(self.config.limits);
        if let Some(store) = self.history_store(false)? {
            service = service.with_history(store);
        }
        let service = Arc::new(service);
        service.register(
            args.target.clone(),
            Arc::new(SyntheticEvaluator::new(self.config.synthetic.clone())),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let poll = Duration::from_millis(args.poll_ms.max(1));
        let status = runtime.block_on(async {
            let session_id = if single_pass {
                service.start_sweep(&args.target, request)?
            } else {
                service.start_auto(&args.target, request)?
            };
            info!(
                target: "sweepctl",
                session = %session_id,
                device = %args.target,
                "session started"
            );

            let mut last_progress = None;
            loop {
                let snapshot = service.status(&args.target)?;
                if !snapshot.is_running() {
                    break;
                }
                let progress = (snapshot.round, snapshot.completed_combos);
                if last_progress != Some(progress) {
                    info!(
                        target: "sweepctl",
                        state = snapshot.phase.as_str(),
                        round = snapshot.round,
                        total_rounds = snapshot.total_rounds,
                        completed = snapshot.completed_combos,
                        total = snapshot.total_combos,
                        "progress"
                    );
                    last_progress = Some(progress);
                }
                tokio::time::sleep(poll).await;
            }
            service.wait(&args.target).await?;
            let snapshot = service.status(&args.target)?;
            Ok::<_, AppError>(StatusResponse::from(&snapshot))
        })?;

        Ok(SessionReport { status })
    }

    fn history_store(&self, must_exist: bool) -> Result<Option<SqliteSweepStore>> {
        let Some(path) = &self.history_db else {
            return Ok(None);
        };
        if must_exist {
            if !path.exists() {
                return Err(AppError::MissingResource(format!(
                    "history database not found: {}",
                    path.display()
                )));
            }
            let store = SqliteSweepStore::builder()
                .path(path)
                .create_if_missing(false)
                .build()?;
            return Ok(Some(store));
        }
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = SqliteSweepStore::new(path)?;
        store.initialize()?;
        Ok(Some(store))
    }

    fn existing_history(&self) -> Result<SqliteSweepStore> {
        self.history_store(true)?.ok_or_else(|| {
            AppError::MissingResource(
                "history is disabled; pass --history-db or enable [history]".to_string(),
            )
        })
    }

    fn history_list(&self, args: &HistoryListArgs) -> Result<HistoryList> {
        let termination = args
            .termination
            .as_deref()
            .map(str::parse::<Termination>)
            .transpose()
            .map_err(|reason| AppError::Request(ApiError::Invalid(reason)))?;
        let filter = RunFilter {
            target: args.target.clone(),
            termination,
            limit: args.limit,
        };
        let rows = self
            .existing_history()?
            .list_runs(&filter)?
            .iter()
            .map(HistoryEntry::from)
            .collect();
        Ok(HistoryList { rows })
    }

    fn history_show(&self, run_id: &str) -> Result<RunDetail> {
        let record = self
            .existing_history()?
            .fetch_run(run_id)?
            .ok_or_else(|| AppError::MissingResource(format!("run {run_id} not found")))?;
        Ok(RunDetail { record })
    }

    fn history_compare(&self, left: &str, right: &str) -> Result<ComparisonReport> {
        let comparison = self.existing_history()?.compare_runs(left, right)?;
        Ok(ComparisonReport { comparison })
    }
}

#[derive(Debug, Serialize)]
struct GridReport {
    values_per_param: usize,
    bounds: BTreeMap<String, [f64; 2]>,
    total: usize,
    combinations: Vec<BTreeMap<String, ParamValue>>,
}

impl DisplayFallback for GridReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} combinations ({} values per parameter)",
            self.total, self.values_per_param
        )];
        for (name, [min, max]) in &self.bounds {
            lines.push(format!("  {name}: [{min}, {max}]"));
        }
        for (index, combination) in self.combinations.iter().enumerate() {
            lines.push(format!("#{index} {}", format_params(combination)));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct SessionReport {
    status: StatusResponse,
}

impl SessionReport {
    fn ensure_success(&self) -> Result<()> {
        match self.status.status.as_str() {
            "failed" | "cancelled" => Err(AppError::SessionFailed {
                status: self.status.status.clone(),
                message: self
                    .status
                    .error
                    .clone()
                    .unwrap_or_else(|| "no recommendation".to_string()),
            }),
            _ => Ok(()),
        }
    }
}

impl DisplayFallback for SessionReport {
    fn display(&self) -> String {
        let status = &self.status;
        let mut lines = vec![format!(
            "Status: {} ({}) rounds {}/{}",
            status.status, status.state, status.round, status.total_rounds
        )];
        if let Some(error) = &status.error {
            lines.push(format!("Error: {error}"));
        }
        for round in &status.round_results {
            let bounds = round
                .bounds
                .iter()
                .map(|(name, [min, max])| format!("{name}=[{min:.4}, {max:.4}]"))
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(format!(
                "  round {}: best={:.4} {} | {}",
                round.round,
                round.best_score,
                format_params(&round.best_params),
                bounds
            ));
        }
        match &status.recommendation {
            Some(recommendation) => {
                lines.push("Recommendation:".to_string());
                for (name, value) in recommendation {
                    lines.push(format!("  - {name}: {value}"));
                }
            }
            None => lines.push("Recommendation: none".to_string()),
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    run_id: String,
    target: String,
    mode: String,
    termination: String,
    started_at: DateTime<Utc>,
    rounds: usize,
    best_score: Option<f64>,
}

impl From<&SweepRunRecord> for HistoryEntry {
    fn from(record: &SweepRunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            target: record.target.clone(),
            mode: record.mode.to_string(),
            termination: record.termination.to_string(),
            started_at: record.started_at,
            rounds: record.rounds_completed(),
            best_score: record.best_score,
        }
    }
}

#[derive(Debug, Serialize)]
struct HistoryList {
    rows: Vec<HistoryEntry>,
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No recorded runs".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let score = entry
                .best_score
                .map(|v| format!("{v:.4}"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{} | {} | mode={} | {} | rounds={} | score={} | {}",
                entry.run_id,
                entry.target,
                entry.mode,
                entry.termination,
                entry.rounds,
                score,
                entry.started_at.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct RunDetail {
    record: SweepRunRecord,
}

impl DisplayFallback for RunDetail {
    fn display(&self) -> String {
        let record = &self.record;
        let mut lines = vec![
            format!("Run: {} ({})", record.run_id, record.target),
            format!("Mode: {} | termination: {}", record.mode, record.termination),
            format!(
                "Window: {} -> {}",
                record.started_at.format("%Y-%m-%d %H:%M:%S"),
                record.ended_at.format("%Y-%m-%d %H:%M:%S")
            ),
        ];
        if let Some(error) = &record.error {
            lines.push(format!("Error: {error}"));
        }
        for round in &record.rounds {
            lines.push(format!(
                "  round {}: {} combos, best={:.4} {}",
                round.round,
                round.results.len(),
                round.best.score,
                format_params(round.best.combination.as_map())
            ));
        }
        if let Some(recommendation) = &record.recommendation {
            lines.push(format!(
                "Recommendation (round {}, score {:.4}): {}",
                recommendation.round,
                recommendation.score(),
                format_params(recommendation.result.combination.as_map())
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ComparisonReport {
    comparison: RunComparison,
}

impl DisplayFallback for ComparisonReport {
    fn display(&self) -> String {
        let comparison = &self.comparison;
        let fmt = |value: Option<f64>| {
            value
                .map(|v| format!("{v:.4}"))
                .unwrap_or_else(|| "-".to_string())
        };
        let mut lines = vec![format!("{} -> {}", comparison.left, comparison.right)];
        lines.push(format!(
            "score: {} -> {} (delta {})",
            fmt(comparison.score.left),
            fmt(comparison.score.right),
            fmt(comparison.score.delta)
        ));
        let sections = [
            ("Parameters", &comparison.parameters),
            ("Metrics", &comparison.metrics),
        ];
        for (title, deltas) in sections {
            if deltas.is_empty() {
                continue;
            }
            lines.push(format!("{title}:"));
            for delta in deltas {
                lines.push(format!(
                    "  - {}: {} -> {} (delta {})",
                    delta.name,
                    fmt(delta.left),
                    fmt(delta.right),
                    fmt(delta.delta)
                ));
            }
        }
        lines.join("\n")
    }
}

fn format_params(params: &BTreeMap<String, ParamValue>) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sweepctl",
            "auto",
            "--request",
            "req.json",
            "--format",
            "json",
            "--instant",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Auto(args) => {
                assert_eq!(args.target, "synthetic");
                assert_eq!(args.poll_ms, 200);
                assert!(args.instant);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_history_compare() {
        let cli = Cli::try_parse_from(["sweepctl", "history", "compare", "a", "b"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::History(HistoryCommands::Compare { ref left, ref right })
                if left == "a" && right == "b"
        ));
    }

    #[test]
    fn format_params_is_name_ordered() {
        let params: BTreeMap<String, ParamValue> = [
            ("b".to_string(), ParamValue::Int(3)),
            ("a".to_string(), ParamValue::Float(0.5)),
        ]
        .into_iter()
        .collect();
        assert_eq!(format_params(&params), "a=0.5 b=3");
    }
}
