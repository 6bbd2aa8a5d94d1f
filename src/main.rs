use std::path::PathBuf;
use std::process::ExitCode;

use tokio::sync::broadcast;
use tracing::{error, info};

use knowledge_relay::{Config, Orchestrator, QueryRequest};

/// Flags that take a value, so their value is not read as part of the question.
const VALUE_FLAGS: [&str; 4] = ["--config", "--docs", "--session", "--user"];

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return ExitCode::SUCCESS;
    }

    // Logs go to stderr so stdout carries only events
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let question = positional(&args).join(" ");
    if question.trim().is_empty() {
        print_usage();
        return ExitCode::from(2);
    }

    let config_path = flag_value(&args, "--config").map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let docs_dir = flag_value(&args, "--docs").map(PathBuf::from);
    let orchestrator = match Orchestrator::from_config(&config, docs_dir.as_deref()).await {
        Ok(o) => o,
        Err(e) => {
            error!("failed to build orchestrator: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(steps = ?orchestrator.step_names(), "knowledge-relay ready");

    // Heartbeats and session expiry run until shutdown
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let maintenance = orchestrator.bus().spawn_maintenance(shutdown_tx.subscribe());

    let user_id = flag_value(&args, "--user").unwrap_or("cli");
    let session_id = flag_value(&args, "--session")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let request = QueryRequest::new(user_id, question).session(session_id.clone());
    let (mut emitter, handle) = match orchestrator.start(request) {
        Ok(started) => started,
        Err(e) => {
            error!(session_id = %session_id, "failed to start request: {e}");
            return ExitCode::FAILURE;
        }
    };

    let printer = tokio::spawn(async move {
        while let Some(event) = emitter.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("failed to encode event: {e}"),
            }
        }
    });

    let outcome = tokio::select! {
        result = handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping...");
            let _ = shutdown_tx.send(());
            return ExitCode::from(130);
        }
    };

    // a panicked chain never publishes a terminal event
    if outcome.is_err() {
        let _ = orchestrator.bus().close(&session_id);
    }
    let _ = printer.await;
    let _ = shutdown_tx.send(());
    let _ = maintenance.await;

    match outcome {
        Ok(ctx) if ctx.success => {
            info!(attempts = ctx.attempts(), "answer delivered");
            ExitCode::SUCCESS
        }
        Ok(ctx) => {
            let reason = ctx
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown failure".into());
            error!(attempts = ctx.attempts(), "request failed: {reason}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("chain task panicked: {e}");
            ExitCode::FAILURE
        }
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Arguments that are neither flags nor flag values.
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if VALUE_FLAGS.contains(&arg.as_str()) {
            skip = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

fn print_usage() {
    println!(
        "knowledge-relay: federated knowledge retrieval with streamed progress

USAGE:
    knowledge-relay [OPTIONS] <QUESTION>...

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/knowledge-relay/config.toml)
    --default-config    Print default config to stdout and exit
    --docs <DIR>        Ingest markdown/text files from DIR into the vector source
    --session <ID>      Session id for progress events (default: random)
    --user <ID>         User id used for source preferences (default: cli)
    -h, --help          Print this help message

OUTPUT:
    One JSON progress event per line on stdout. Logs go to stderr.
    Exit status is non-zero when the request fails.

LLM BACKEND:
    LLM_BACKEND           \"ollama\" (default) or \"openai\"
    OLLAMA_HOST           Ollama API base URL (default: http://localhost:11434)
    OLLAMA_MODEL          Ollama model tag (default: llama3.1:8b)
    OPENAI_API_KEY        API key for the OpenAI-compatible backend
    OPENAI_BASE_URL       Base URL (default: https://api.openai.com/v1)
    OPENAI_MODEL          Model name (default: gpt-4o-mini)

SOURCES:
    KNOWLEDGE_API_URL     External search API base URL (enables the API source)
    KNOWLEDGE_API_KEY     Bearer token for the external search API

ENVIRONMENT:
    RUST_LOG              Log filter (default: info)"
    );
}
