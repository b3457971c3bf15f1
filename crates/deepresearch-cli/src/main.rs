mod console;
mod providers;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deepresearch_engine::stub::{StubModel, StubSearchTool};
use deepresearch_engine::{
    CancellationFlag, ConfigLoader, DynModel, DynTool, ProgressCollector,
    ResearchConfig, ResearchEngine, SearchApi, SessionOptions, StageModels, TelemetryOptions,
    ToolProviderConfig, ToolRegistry, ToolTransport, TraceCollector, drain, init_telemetry,
    metrics, secret_status,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::console::{ConsoleProgress, StdinResponder, pick_documents};
use crate::providers::{OpenAiCompatible, TavilySearch, local_docs_tools};

const LOCAL_DOCS_INSTRUCTIONS: &str = "Local documents are available through list_directory, \
read_text_file and read_file. Start with list_directory, read the relevant files, and prefer \
them over web results when they cover the topic. Cite local files by their file:// url.";

#[derive(Parser, Debug)]
#[command(
    name = "deepresearch-cli",
    version,
    about = "Clarify, research and report on a question with cited sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a question and print the final report.
    Run(RunArgs),
    /// Load and validate the configuration, then print the resolved limits.
    Validate(ValidateArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModelPreset {
    QwenFlash,
    QwenPlus,
    DeepseekChat,
    DeepseekReasoner,
}

impl ModelPreset {
    fn model(&self) -> &'static str {
        match self {
            ModelPreset::QwenFlash => "qwen-flash",
            ModelPreset::QwenPlus => "qwen-plus",
            ModelPreset::DeepseekChat => "deepseek-chat",
            ModelPreset::DeepseekReasoner => "deepseek-reasoner",
        }
    }

    fn base_url(&self) -> &'static str {
        match self {
            ModelPreset::QwenFlash | ModelPreset::QwenPlus => {
                "https://dashscope.aliyuncs.com/compatible-mode/v1"
            }
            ModelPreset::DeepseekChat | ModelPreset::DeepseekReasoner => {
                "https://api.deepseek.com/v1"
            }
        }
    }

    fn api_key_env(&self) -> &'static str {
        match self {
            ModelPreset::QwenFlash | ModelPreset::QwenPlus => "DASHSCOPE_API_KEY",
            ModelPreset::DeepseekChat | ModelPreset::DeepseekReasoner => "DEEPSEEK_API_KEY",
        }
    }
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to a TOML config file (defaults to $DEEPRESEARCH_CONFIG or ./config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use one model preset for every stage.
    #[arg(long, value_enum)]
    model: Option<ModelPreset>,

    /// Token budget for every stage.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Never ask a clarifying question.
    #[arg(long)]
    no_clarify: bool,

    /// Disable web search; research relies on local documents only.
    #[arg(long)]
    no_search: bool,

    /// Directory of local documents researchers may read.
    #[arg(long)]
    docs: Option<PathBuf>,

    #[arg(long)]
    max_units: Option<usize>,

    #[arg(long)]
    max_iterations: Option<usize>,

    #[arg(long)]
    max_tool_calls: Option<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question to research.
    question: String,

    #[command(flatten)]
    config: ConfigArgs,

    /// Optional session ID.
    #[arg(long)]
    session: Option<String>,

    /// Write the report to this file instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Persist the session trace as JSON into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Print a markdown summary of the session trace after the report.
    #[arg(long)]
    explain: bool,

    /// Run against the built-in offline model and search tool.
    #[arg(long)]
    offline: bool,

    /// Choose the local documents directory interactively (ignored with --docs).
    #[arg(long)]
    pick_docs: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await,
            Command::Validate(args) => validate_command(args),
        }
    })
}

fn resolve_config(args: &ConfigArgs) -> Result<ResearchConfig> {
    let mut config = ConfigLoader::load(args.config.clone())?;

    if let Some(preset) = args.model {
        config.models = StageModels::uniform(preset.model(), args.max_tokens);
        config.llm.base_url = preset.base_url().to_string();
        config.llm.api_key_env = preset.api_key_env().to_string();
    } else if let Some(max_tokens) = args.max_tokens {
        config.models.summarization.max_tokens = max_tokens;
        config.models.research.max_tokens = max_tokens;
        config.models.compression.max_tokens = max_tokens;
        config.models.final_report.max_tokens = max_tokens;
    }
    if args.no_clarify {
        config.allow_clarification = false;
    }
    if args.no_search {
        config.search_api = SearchApi::Disabled;
    }
    if let Some(docs) = &args.docs {
        config.tool_provider = Some(ToolProviderConfig {
            transport: ToolTransport::Local,
            endpoint: docs.display().to_string(),
            allowed_tools: ["list_directory", "read_text_file", "read_file"]
                .into_iter()
                .map(String::from)
                .collect(),
            instructions: Some(LOCAL_DOCS_INSTRUCTIONS.to_string()),
        });
    }
    if let Some(units) = args.max_units {
        config.max_concurrent_research_units = units;
    }
    if let Some(iterations) = args.max_iterations {
        config.max_researcher_iterations = iterations;
    }
    if let Some(calls) = args.max_tool_calls {
        config.max_react_tool_calls = calls;
    }

    config.validate()?;
    Ok(config)
}

fn build_tools(config: &ResearchConfig, offline: bool) -> Result<ToolRegistry> {
    let timeout = Duration::from_secs(config.llm.timeout_secs);
    let builtin: Vec<DynTool> = match config.search_api {
        SearchApi::Disabled => Vec::new(),
        SearchApi::Tavily if offline => vec![Arc::new(StubSearchTool) as DynTool],
        SearchApi::Tavily => vec![Arc::new(TavilySearch::new(
            config.search_api_key()?,
            config.search.max_results,
            timeout,
        )?) as DynTool],
    };

    let Some(provider) = &config.tool_provider else {
        return Ok(ToolRegistry::new(builtin));
    };
    let external = match provider.transport {
        ToolTransport::Local => local_docs_tools(Path::new(&provider.endpoint))?,
    };
    Ok(ToolRegistry::with_external(builtin, provider, external))
}

fn build_model(config: &ResearchConfig, offline: bool) -> Result<DynModel> {
    if offline {
        return Ok(Arc::new(StubModel::new()) as DynModel);
    }
    let client = OpenAiCompatible::new(
        &config.llm.base_url,
        config.llm_api_key()?,
        Duration::from_secs(config.llm.timeout_secs),
    )?;
    let model: DynModel = Arc::new(client);
    Ok(model)
}

async fn run_command(mut args: RunArgs) -> Result<()> {
    if args.pick_docs && args.config.docs.is_none() {
        let cwd = std::env::current_dir()?;
        let stdin = std::io::stdin();
        args.config.docs = pick_documents(&mut stdin.lock(), &mut std::io::stderr(), &cwd)?;
    }
    let mut config = resolve_config(&args.config)?;
    if args.offline {
        // Offline report sections are short templates.
        config.report.min_section_words = 0;
    }

    init_telemetry(TelemetryOptions {
        env_filter: Some(config.logging.level.clone()),
        ..TelemetryOptions::default()
    })?;
    metrics::init_metrics_from_env("deepresearch-cli")?;

    let model = build_model(&config, args.offline)?;
    let tools = build_tools(&config, args.offline)?;
    if tools.is_empty() {
        warn!("no research tools configured; every topic will end up as a coverage gap");
    }
    info!(question = %args.question, tools = ?tools.names(), "starting DeepResearch session");

    let (collector, receiver) = ProgressCollector::new();
    let printer = tokio::spawn(drain(receiver, ConsoleProgress));

    let cancel = CancellationFlag::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight research and writing the report");
            interrupt.cancel();
        }
    });

    let allow_clarification = config.allow_clarification;
    let mut engine = ResearchEngine::new(config, model)
        .with_tools(tools)
        .with_progress(collector)
        .with_cancellation(cancel);
    if allow_clarification {
        engine = engine.with_responder(Arc::new(StdinResponder));
    }
    if let Some(dir) = &args.trace_dir {
        engine = engine.with_trace_dir(dir);
    }

    let mut options = SessionOptions::new(args.question);
    if let Some(session_id) = args.session {
        options = options.with_session_id(session_id);
    }
    let outcome = engine.run(options).await;
    drop(engine);
    if let Err(err) = printer.await {
        warn!(error = %err, "progress printer stopped unexpectedly");
    }

    let completed = outcome?
        .into_completed()
        .ok_or_else(|| anyhow!("session paused for clarification without a responder"))?;

    match &args.output {
        Some(path) => {
            fs::write(path, completed.report.markdown())
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            eprintln!("report written to {}", path.display());
        }
        None => println!("{}", completed.report.markdown()),
    }

    if let Some(path) = &completed.trace_path {
        info!(path = %path.display(), "session trace persisted");
    }
    if args.explain {
        let summary = TraceCollector::from_events(completed.trace).summary();
        eprintln!("\n{}", summary.render_markdown());
    }
    Ok(())
}

fn validate_command(args: ValidateArgs) -> Result<()> {
    let config = resolve_config(&args.config)?;
    if config.tool_provider.is_none() && config.search_api == SearchApi::Disabled {
        bail!("search is disabled and no tool provider is configured; researchers would have no tools");
    }

    println!("configuration OK");
    println!(
        "max_structured_output_retries = {}",
        config.max_structured_output_retries
    );
    println!("allow_clarification = {}", config.allow_clarification);
    println!(
        "max_concurrent_research_units = {}",
        config.max_concurrent_research_units
    );
    println!(
        "max_researcher_iterations = {}",
        config.max_researcher_iterations
    );
    println!("max_react_tool_calls = {}", config.max_react_tool_calls);
    for (stage, spec) in config.models.iter() {
        println!("models.{stage} = {} ({} tokens)", spec.model, spec.max_tokens);
    }
    println!("search_api = {:?}", config.search_api);
    println!("llm key: {}", secret_status(&config.llm.api_key_env));
    if config.search_api == SearchApi::Tavily {
        println!("search key: {}", secret_status(&config.search.api_key_env));
    }
    if let Some(provider) = &config.tool_provider {
        println!(
            "tool_provider = {:?} {} [{}]",
            provider.transport,
            provider.endpoint,
            provider.allowed_tools.join(", ")
        );
    }
    Ok(())
}
