use std::path::PathBuf;
use std::sync::OnceLock;

use clap::{Args, Parser, Subcommand};
use relay_cli::{
    relay_home, run_agent, run_approve, run_chat, run_rag, run_resume, run_team, run_tools,
    CommandContext, RelayConfig, DEFAULT_CONFIG_FILE,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "checkpointed agent/tool control loop demos")]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `llm.model` from the config file.
    #[arg(long, global = true)]
    model: Option<String>,
    /// Overrides `loop.recursion_limit` from the config file.
    #[arg(long, global = true)]
    recursion_limit: Option<usize>,
    #[arg(long, global = true, default_value_t = false)]
    hide_tool_results: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Web-search agent with a follow-up question on the same thread.
    Agent {
        #[arg(default_value = "what is the weather in sf")]
        query: String,
    },
    /// Weather tools in a plain consult/execute loop.
    Tools {
        #[arg(default_value = "what's the weather in the coolest cities?")]
        query: String,
    },
    /// Retrieval with relevance grading and question rewriting.
    Rag {
        #[arg(default_value = "What does Lilian Weng say about the types of agent memory?")]
        question: String,
        /// Overrides `retrieval.docs_dir`.
        #[arg(long)]
        docs_dir: Option<PathBuf>,
    },
    /// Researcher and chart generator handing work to each other.
    Team {
        #[arg(
            default_value = "Fetch the UK's GDP over the past 5 years, then draw a line graph of it. Once you code it up, finish."
        )]
        task: String,
    },
    /// One message on a persisted thread.
    Chat(ThreadMessageArgs),
    /// Start a run that pauses before tools execute.
    Approve(ThreadMessageArgs),
    /// Continue a paused thread.
    Resume {
        #[arg(long)]
        thread: String,
        /// Approve every pending tool call without asking.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct ThreadMessageArgs {
    #[arg(long)]
    thread: String,
    message: String,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let log_dir = relay_home();
    if let Err(error) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            log_dir.display()
        );
        return;
    }

    let appender = tracing_appender::rolling::never(&log_dir, "relay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut config = RelayConfig::load(&cli.config)?;
    if let Some(model) = cli.model {
        config.llm.model = model;
    }
    if let Some(limit) = cli.recursion_limit {
        if limit == 0 {
            return Err("--recursion-limit must be at least 1".to_string());
        }
        config.control.recursion_limit = Some(limit);
    }
    tracing::info!(
        config = %cli.config.display(),
        model = %config.llm.model,
        "relay starting"
    );

    let context = CommandContext::new(config, !cli.hide_tool_results)?;
    match cli.command {
        Command::Agent { query } => run_agent(&context, &query).await,
        Command::Tools { query } => run_tools(&context, &query).await,
        Command::Rag { question, docs_dir } => {
            run_rag(&context, &question, docs_dir.as_deref()).await
        }
        Command::Team { task } => run_team(&context, &task).await,
        Command::Chat(args) => run_chat(&context, &args.thread, &args.message).await,
        Command::Approve(args) => run_approve(&context, &args.thread, &args.message).await,
        Command::Resume { thread, yes } => run_resume(&context, &thread, yes).await,
    }
}
