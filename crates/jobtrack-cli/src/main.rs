//! Terminal driver for pipeline runs, status watches and chat replies.

mod config;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use jobtrack_stream::{
    ChatSession, ClientConfig, JobId, JobtrackError, Phase, PipelineRun, PipelineSnapshot, Run,
    RunController, RunSnapshot, RunState, SectionPhase, SectionRow, SectionStatus, StatusOverlay,
    init_observability, merge_sections,
};

#[derive(Parser)]
#[command(
    name = "jobtrack",
    about = "Stream pipeline progress and chat replies from the job tracker",
    version
)]
struct Cli {
    /// Backend base URL. Overrides JOBTRACK_API_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Default log level when JOBTRACK_LOG_LEVEL and RUST_LOG are unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis phase and follow its sections.
    Analyze { job_id: String },
    /// Run the cover-letter phase and follow its sections.
    CoverLetter { job_id: String },
    /// Follow the status stream of a job without starting anything.
    Watch { job_id: String },
    /// Ask one question about a job and stream the reply.
    Chat {
        job_id: String,
        message: String,
        #[arg(long, default_value = "cli")]
        widget: String,
    },
    /// Print the persisted section table of a job.
    Sections {
        job_id: String,
        #[arg(long, value_enum)]
        phase: Option<PhaseArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    Analysis,
    CoverLetter,
}

impl From<PhaseArg> for SectionPhase {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::Analysis => SectionPhase::Analysis,
            PhaseArg::CoverLetter => SectionPhase::CoverLetter,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    config::init();
    let cli = Cli::parse();
    init_observability(&cli.log_level);
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, JobtrackError> {
    let mut client_config = ClientConfig::from_env()?;
    if let Some(url) = cli.api_url {
        client_config = client_config.base_url(url);
    }
    tracing::debug!(base_url = %client_config.base_url, "using backend");
    let controller = RunController::from_config(client_config)?;

    match cli.command {
        Commands::Analyze { job_id } => {
            run_phase(&controller, JobId::new(job_id), Phase::Analyze).await
        }
        Commands::CoverLetter { job_id } => {
            run_phase(&controller, JobId::new(job_id), Phase::CoverLetter).await
        }
        Commands::Watch { job_id } => {
            let run = controller.watch_status(&JobId::new(job_id));
            let mut printed = BTreeMap::new();
            let state = follow(&run, |snapshot| print_changes(snapshot, &mut printed)).await;
            Ok(report(&run, state))
        }
        Commands::Chat {
            job_id,
            message,
            widget,
        } => {
            let mut session = ChatSession::new(widget, job_id);
            let run = session.send(&controller, &message)?;
            let mut shown = 0;
            let state = follow(&run, |snapshot| {
                let reply = snapshot.reply();
                if reply.len() > shown {
                    print!("{}", &reply[shown..]);
                    let _ = std::io::stdout().flush();
                    shown = reply.len();
                }
            })
            .await;
            println!();
            if let Some(error) = run.snapshot().error {
                eprintln!("chat failed: {error}");
            }
            Ok(exit_code(state))
        }
        Commands::Sections { job_id, phase } => {
            let catalogue = controller.store().fetch_section_catalogue().await?;
            let job = controller.store().fetch_job(&JobId::new(job_id)).await?;
            let rows = merge_sections(
                &catalogue,
                Some(&job),
                &StatusOverlay::new(),
                phase.map(Into::into),
            );
            println!("{} / {} [{}]", job.company, job.role, job.pipeline_stage);
            print_rows(&rows);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_phase(
    controller: &RunController,
    job_id: JobId,
    phase: Phase,
) -> Result<ExitCode, JobtrackError> {
    let catalogue = controller.store().fetch_section_catalogue().await?;
    let run = controller.start_pipeline(&job_id, phase);
    let mut printed = BTreeMap::new();
    let state = follow(&run, |snapshot| print_changes(snapshot, &mut printed)).await;
    let code = report(&run, state);

    if let Some(job) = controller.refresh_after(&run).await? {
        let rows = merge_sections(
            &catalogue,
            Some(&job),
            &StatusOverlay::new(),
            Some(phase.section_phase()),
        );
        println!();
        print_rows(&rows);
    }
    Ok(code)
}

/// Drives `run` to a terminal state, calling `on_change` for every published
/// snapshot. Ctrl-C stops the run.
async fn follow<T: RunSnapshot>(run: &Run<T>, mut on_change: impl FnMut(&T)) -> RunState {
    let mut rx = run.subscribe();
    let settled = run.settled();
    tokio::pin!(settled);
    let state = loop {
        tokio::select! {
            state = &mut settled => break state,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(run_id = %run.run_id(), "interrupted; stopping run");
                run.stop();
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break run.state();
                }
                let snapshot = rx.borrow_and_update().clone();
                on_change(&snapshot);
            }
        }
    };
    on_change(&run.snapshot());
    state
}

fn print_changes(snapshot: &PipelineSnapshot, printed: &mut BTreeMap<String, SectionStatus>) {
    for (key, status) in snapshot.statuses.to_map() {
        if printed.get(&key) == Some(&status) {
            continue;
        }
        match snapshot
            .statuses
            .detail(&key)
            .and_then(|d| d.error_message.as_deref())
        {
            Some(error) => println!("{status:<8} {key}: {error}"),
            None => println!("{status:<8} {key}"),
        }
        printed.insert(key, status);
    }
}

fn print_rows(rows: &[SectionRow]) {
    for row in rows {
        match &row.error_message {
            Some(error) => println!("{:>3}  {:<8}  {} ({error})", row.order, row.status, row.label),
            None => println!("{:>3}  {:<8}  {}", row.order, row.status, row.label),
        }
    }
}

fn report(run: &PipelineRun, state: RunState) -> ExitCode {
    match state {
        RunState::Completed => println!("run completed"),
        RunState::Cancelled => println!("run cancelled"),
        _ => {
            let message = run
                .snapshot()
                .error_message()
                .unwrap_or_else(|| "run failed".into());
            eprintln!("{message}");
        }
    }
    exit_code(state)
}

fn exit_code(state: RunState) -> ExitCode {
    match state {
        RunState::Completed => ExitCode::SUCCESS,
        RunState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}
