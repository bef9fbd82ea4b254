//! PersonaGraph CLI
//!
//! Multi-agent research profile enrichment.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use persona_agents::{
    connect, BackendKind, BackendSettings, EnrichConfig, PersonaRegistry, SharedBackend,
    StageToolkit,
};
use persona_core::{EnrichRequest, InboundMessage, ProgressEvent};
use persona_runtime::{build_pipeline, ExecutionReport, Graph, NoopObserver, ProgressStream, ProgressStreamer};

#[derive(Parser)]
#[command(name = "persona-graph")]
#[command(author, version, about = "PersonaGraph: multi-agent profile enrichment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1", global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich one subject and write the profile to a markdown file
    Enrich {
        /// Subject name
        #[arg(short, long)]
        name: Option<String>,

        /// Subject profile summary
        #[arg(short, long)]
        summary: Option<String>,

        /// Stream progress events to stdout as JSON lines
        #[arg(long)]
        stream: bool,

        /// Output file for the profile (default: profile_<timestamp>.md)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Read enrich requests from stdin, stream events to stdout (JSON lines)
    Stdio {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Validate the pipeline and print its node table
    Graph {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// LLM backend: anthropic, openai, openrouter or local
    #[arg(long, default_value = "anthropic")]
    backend: BackendKind,

    /// LLM model to use
    #[arg(short, long, default_value = "claude-sonnet-4-20250514")]
    model: String,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_key: Option<String>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// OpenRouter API key (or set OPENROUTER_API_KEY env var)
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    openrouter_key: Option<String>,

    /// Base URL of a local OpenAI-compatible server
    #[arg(long, default_value = "http://localhost:11434/v1")]
    base_url: String,

    /// Enrichment configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of persona TOML files overriding the built-in personas
    #[arg(long)]
    personas: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // stdout is reserved for streamed events
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Commands::Enrich {
            name,
            summary,
            stream,
            output,
            pipeline,
        } => {
            let request = EnrichRequest {
                subject_name: name,
                subject_summary: summary,
            };
            run_enrich(request, stream, output, &pipeline).await?;
        }
        Commands::Stdio { pipeline } => {
            run_stdio(&pipeline).await?;
        }
        Commands::Graph { pipeline } => {
            print_graph(&build_graph(&pipeline)?);
        }
    }

    Ok(())
}

fn create_llm(args: &PipelineArgs) -> Result<SharedBackend> {
    let key = match args.backend {
        BackendKind::Anthropic => args.anthropic_key.clone(),
        BackendKind::OpenAI => args.api_key.clone(),
        BackendKind::OpenRouter => args.openrouter_key.clone(),
        BackendKind::Local => None,
    };
    let mut settings = BackendSettings::new(args.backend, &args.model).with_api_key(key);
    if args.backend == BackendKind::Local {
        settings = settings.with_base_url(&args.base_url);
    }

    let backend = connect(settings)?;
    info!("Backend: {:?} | Model: {}", args.backend, backend.model_name());
    Ok(backend)
}

fn build_graph(args: &PipelineArgs) -> Result<Graph> {
    let config = match &args.config {
        Some(path) => EnrichConfig::load(path)?,
        None => EnrichConfig::default(),
    };

    let registry = match &args.personas {
        Some(dir) => PersonaRegistry::load_from_dir(dir)
            .with_context(|| format!("loading personas from {}", dir.display()))?,
        None => PersonaRegistry::load_embedded(),
    };
    info!("Loaded {} personas: {:?}", registry.len(), registry.list_ids());

    let toolkit = StageToolkit::from_config(&config, create_llm(args)?)?;
    build_pipeline(&registry, toolkit)
}

async fn write_line(out: &mut Stdout, event: &ProgressEvent) -> Result<()> {
    let line = serde_json::to_string(event)?;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}

/// Forward events to stdout; returns false once stdout is gone
async fn forward_events(stream: ProgressStream) -> Result<(ExecutionReport, bool)> {
    let ProgressStream { mut events, handle } = stream;
    let mut stdout = tokio::io::stdout();
    let mut connected = true;

    while let Some(event) = events.recv().await {
        if let Err(e) = write_line(&mut stdout, &event).await {
            warn!("Stopped streaming: {}", e);
            connected = false;
            break;
        }
    }
    drop(events);

    let report = handle.await??;
    Ok((report, connected))
}

async fn run_enrich(request: EnrichRequest, stream: bool, output: Option<PathBuf>, args: &PipelineArgs) -> Result<()> {
    let graph = Arc::new(build_graph(args)?);

    let report = if stream {
        forward_events(ProgressStreamer::new(graph).start(request, "cli")).await?.0
    } else {
        graph.execute(request.into_state("cli"), &NoopObserver).await?
    };

    let output_path = output.unwrap_or_else(|| {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
        PathBuf::from(format!("profile_{}.md", timestamp))
    });
    let markdown = render_markdown(&report);
    fs::write(&output_path, &markdown).with_context(|| format!("writing {}", output_path.display()))?;

    eprintln!("\nEnrichment finished: {:?}", report.status);
    eprintln!("Successful branches: {:?}", report.successful_branches);
    if !report.failed_branches.is_empty() {
        eprintln!("Failed branches: {:?}", report.failed_branches);
    }
    eprintln!("Profile saved to: {}", output_path.display());

    if !stream {
        println!("\n{}", "=".repeat(60));
        let preview: String = markdown.chars().take(1000).collect();
        println!("{}", preview);
        if markdown.chars().count() > 1000 {
            println!("...\n[truncated - see full profile in output file]");
        }
    }

    Ok(())
}

async fn run_stdio(args: &PipelineArgs) -> Result<()> {
    let streamer = ProgressStreamer::new(Arc::new(build_graph(args)?));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Waiting for enrich requests on stdin");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<InboundMessage>(&line) {
            Ok(InboundMessage::Enrich(request)) => request,
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                continue;
            }
        };

        let (report, connected) = forward_events(streamer.start(request, "stdio")).await?;
        info!("Run {} finished: {:?}", report.state.run_id, report.status);

        if !connected {
            break;
        }
    }

    Ok(())
}

fn print_graph(graph: &Graph) {
    println!("Entry:    {}", graph.entry());
    println!("Terminal: {}", graph.terminal());
    println!(
        "Branches: {}",
        graph.branches().iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!();

    for (from, targets) in graph.edges() {
        let to = if targets.is_empty() {
            "(end)".to_string()
        } else {
            targets.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        };
        println!("  {:<12} -> {}", from.as_str(), to);
    }
}

/// Profile document written by `enrich`
fn render_markdown(report: &ExecutionReport) -> String {
    let state = &report.state;
    let mut doc = format!("# {}\n\n", state.subject_name());

    doc.push_str(state.aggregated_profile.as_deref().unwrap_or("No profile was produced."));
    doc.push_str("\n\n");

    let references = state.stage_references();
    if !references.is_empty() {
        doc.push_str("## References\n\n");
        for url in references {
            doc.push_str(&format!("- {}\n", url));
        }
        doc.push('\n');
    }

    doc.push_str(&format!(
        "---\nStatus: {:?} | Run: {}\n",
        report.status, state.run_id
    ));
    if let Some(error) = &state.error {
        doc.push_str(&format!("First error: {}\n", error));
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::{PipelineState, Provenance, RunStatus, Stage};

    #[test]
    fn test_parse_enrich_args() {
        let cli = Cli::try_parse_from([
            "persona-graph",
            "enrich",
            "--name",
            "Jane Doe",
            "--backend",
            "local",
            "--stream",
            "-v",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Enrich {
                name, stream, pipeline, ..
            } => {
                assert_eq!(name.as_deref(), Some("Jane Doe"));
                assert!(stream);
                assert_eq!(pipeline.backend, BackendKind::Local);
            }
            _ => panic!("expected enrich"),
        }
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result = Cli::try_parse_from(["persona-graph", "graph", "--backend", "gemini"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_render_markdown() {
        let mut state = PipelineState::for_subject(Some("Jane Doe".into()), None, "test");
        state.replace_aggregated_profile("Jane Doe leads ExampleCorp.".into());
        state.record(Provenance::Stage {
            stage: Stage::Leadership,
            info: "done".into(),
            references: vec!["https://example.com/jane".into()],
        });
        let report = ExecutionReport {
            state,
            visited: Vec::new(),
            successful_branches: vec![Stage::Leadership],
            failed_branches: vec![Stage::Reputation, Stage::Strategy],
            status: RunStatus::PartialSuccess,
        };

        let doc = render_markdown(&report);
        assert!(doc.starts_with("# Jane Doe\n\nJane Doe leads ExampleCorp."));
        assert!(doc.contains("- https://example.com/jane"));
        assert!(doc.contains("Status: PartialSuccess"));
        assert!(!doc.contains("First error"));
    }
}
