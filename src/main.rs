use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use anomalytriage::calibrate::{select_threshold, Calibrator, CostModel};
use anomalytriage::config::{LoggingConfig, TriageConfig};
use anomalytriage::ingest::{ingest, ScoreBatch};
use anomalytriage::oracle::StaticScores;
use anomalytriage::report::render::{render_completed, JsonRenderer, ReportRenderer, TextRenderer};
use anomalytriage::session::{
    AnalysisRequest, AnalysisRunner, AnalysisSession, ScoreSource, SessionStateMachine,
    SessionStatus,
};

#[derive(Parser)]
#[command(
    name = "anomalytriage",
    about = "Cost-calibrated anomaly thresholds and triage reports",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides ANOMALYTRIAGE_CONFIG and ./anomalytriage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage datasets
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Run a full analysis session over a score file
    Analyze {
        /// JSON file: {"scores": [...], "labels": [...]}
        #[arg(long)]
        input: PathBuf,

        /// Existing dataset to analyse
        #[arg(long, conflicts_with = "name")]
        dataset: Option<Uuid>,

        /// Register a new dataset with this name first
        #[arg(long)]
        name: Option<String>,

        /// Classify with this threshold instead of calibrating
        #[arg(long)]
        threshold: Option<f64>,

        /// Cost of one false positive
        #[arg(long, requires = "fn_cost")]
        fp_cost: Option<f64>,

        /// Cost of one false negative
        #[arg(long, requires = "fp_cost")]
        fn_cost: Option<f64>,

        /// Anomalies listed in the report
        #[arg(long)]
        top_n: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Pick a threshold for a score file without recording a session
    Calibrate {
        /// JSON file: {"scores": [...], "labels": [...]}
        #[arg(long)]
        input: PathBuf,

        #[arg(long, requires = "fn_cost")]
        fp_cost: Option<f64>,

        #[arg(long, requires = "fp_cost")]
        fn_cost: Option<f64>,
    },

    /// Inspect or cancel analysis sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show triage reports
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
}

#[derive(Subcommand)]
enum DatasetAction {
    /// Register a dataset
    Register {
        #[arg(long)]
        name: String,
    },

    /// List all datasets
    List,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show one session
    Show { id: Uuid },

    /// List the sessions of a dataset, oldest first
    List {
        #[arg(long)]
        dataset: Uuid,
    },

    /// Cancel a Pending or Running session
    Cancel { id: Uuid },
}

#[derive(Subcommand)]
enum ReportAction {
    /// Render the report of a completed session
    Show {
        session: Uuid,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn renderer(self) -> &'static dyn ReportRenderer {
        match self {
            OutputFormat::Text => &TextRenderer,
            OutputFormat::Json => &JsonRenderer,
        }
    }
}

#[derive(Deserialize)]
struct ScoreFile {
    scores: Vec<f64>,
    #[serde(default)]
    labels: Option<Vec<bool>>,
}

fn read_batch(path: &Path) -> Result<ScoreBatch> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read score file: {}", path.display()))?;
    let file: ScoreFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse score file: {}", path.display()))?;
    Ok(ingest(file.scores, file.labels)?)
}

fn cost_override(fp_cost: Option<f64>, fn_cost: Option<f64>) -> Result<Option<CostModel>> {
    match (fp_cost, fn_cost) {
        (Some(fp), Some(fnc)) => Ok(Some(CostModel::new(fp, fnc)?)),
        _ => Ok(None),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_session(session: &AnalysisSession) {
    println!("Session:   {}", session.id);
    println!("Dataset:   {}", session.dataset_id);
    println!("Status:    {}", session.status);
    println!("Progress:  {}%", session.progress);
    println!("Started:   {}", session.started_at.to_rfc3339());
    if let Some(done) = session.completed_at {
        println!("Finished:  {}", done.to_rfc3339());
    }
    if let Some(err) = &session.error_message {
        println!("Error:     {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TriageConfig::load_or_default(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let store = anomalytriage::open_store(&config.storage)?;
    let machine = Arc::new(SessionStateMachine::new(store));

    match cli.command {
        Commands::Dataset { action } => match action {
            DatasetAction::Register { name } => {
                let dataset = machine.register_dataset(&name)?;
                println!("{}", dataset.id);
            }
            DatasetAction::List => {
                let datasets = machine.list_datasets()?;
                if datasets.is_empty() {
                    println!("No datasets found.");
                } else {
                    println!("{:<36} | {:<10} | {:<25} | Name", "ID", "Status", "Uploaded");
                    println!("{:-<36}-|-{:-<10}-|-{:-<25}-|-{:-<20}", "", "", "", "");
                    for d in datasets {
                        println!(
                            "{:<36} | {:<10} | {:<25} | {}",
                            d.id,
                            d.status,
                            d.uploaded_at.to_rfc3339(),
                            d.name
                        );
                    }
                }
            }
        },
        Commands::Analyze {
            input,
            dataset,
            name,
            threshold,
            fp_cost,
            fn_cost,
            top_n,
            format,
        } => {
            let batch = read_batch(&input)?;
            let dataset_id = match (dataset, name) {
                (Some(id), _) => id,
                (None, Some(name)) => machine.register_dataset(&name)?.id,
                (None, None) => bail!("either --dataset or --name is required"),
            };

            let mut request = AnalysisRequest::new(dataset_id, ScoreSource::Batch(batch));
            request.threshold = threshold;
            request.cost = cost_override(fp_cost, fn_cost)?;
            request.top_n = top_n;

            tracing::info!(%dataset_id, input = %input.display(), "Running analysis");
            let runner = AnalysisRunner::new(
                Arc::clone(&machine),
                Arc::new(StaticScores::default()),
                &config.analysis_settings(),
            )?;
            let session = runner.run(request).await?;

            match session.status {
                SessionStatus::Completed => {
                    let output = render_completed(&machine, session.id, format.renderer())?;
                    println!("{}", output);
                }
                SessionStatus::Failed => bail!(
                    "analysis session {} failed: {}",
                    session.id,
                    session.error_message.as_deref().unwrap_or("unknown error")
                ),
                _ => {
                    println!("Dataset already has an active session:");
                    print_session(&session);
                }
            }
        }
        Commands::Calibrate {
            input,
            fp_cost,
            fn_cost,
        } => {
            let batch = read_batch(&input)?;
            let cost = match cost_override(fp_cost, fn_cost)? {
                Some(cost) => cost,
                None => config.calibration.cost_model()?,
            };
            let calibrator = Calibrator::new(config.calibration.grid.clone())?;
            let decision = select_threshold(
                &batch,
                &calibrator,
                &cost,
                config.calibration.fallback_percentile,
                None,
                &CancellationToken::new(),
            )?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Session { action } => match action {
            SessionAction::Show { id } => print_session(&machine.session(id)?),
            SessionAction::List { dataset } => {
                let sessions = machine.sessions_for_dataset(dataset)?;
                if sessions.is_empty() {
                    println!("No sessions found.");
                } else {
                    println!("{:<36} | {:<10} | {:<8} | Started", "ID", "Status", "Progress");
                    println!("{:-<36}-|-{:-<10}-|-{:-<8}-|-{:-<25}", "", "", "", "");
                    for s in sessions {
                        println!(
                            "{:<36} | {:<10} | {:<8} | {}",
                            s.id,
                            s.status,
                            format!("{}%", s.progress),
                            s.started_at.to_rfc3339()
                        );
                    }
                }
            }
            SessionAction::Cancel { id } => {
                let session = machine.cancel(id)?;
                println!("Session {} is {}.", session.id, session.status);
            }
        },
        Commands::Report { action } => match action {
            ReportAction::Show { session, format } => {
                let output = render_completed(&machine, session, format.renderer())?;
                println!("{}", output);
            }
        },
    }

    Ok(())
}
