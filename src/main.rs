use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use llm_gateway::adapter::anthropic::AnthropicAdapter;
use llm_gateway::adapter::openai::OpenAiAdapter;
use llm_gateway::adapter::Adapter;
use llm_gateway::config::GatewayConfig;
use llm_gateway::http_client::HttpClient;
use llm_gateway::persistence::{InMemoryPersistence, Persistence};
use llm_gateway::registry::ToolRegistry;
use llm_gateway::server::{self, AppState};

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(author, version, about = "Tool-orchestration gateway for LLM chat-completion providers", long_about = None)]
struct Cli {
    /// Path to a YAML config file (spec §6's enumerated options).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Default provider id used when a request doesn't specify one.
    #[arg(long, default_value = "openai")]
    default_provider: String,
}

fn adapters() -> HashMap<String, Arc<dyn Adapter>> {
    let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    map.insert("openai".to_string(), Arc::new(OpenAiAdapter::new()));
    map.insert("anthropic".to_string(), Arc::new(AnthropicAdapter::new()));
    map
}

/// Provider api keys, read from the environment so no secret ever lives in
/// the YAML config (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`).
fn api_keys() -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        map.insert("openai".to_string(), key);
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        map.insert("anthropic".to_string(), key);
    }
    map
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match GatewayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let state = AppState {
        adapters: Arc::new(adapters()),
        api_keys: Arc::new(api_keys()),
        default_provider: cli.default_provider,
        tools: ToolRegistry::with_builtins(),
        http: Arc::new(HttpClient::new(config.retry.clone())),
        persistence: Arc::new(InMemoryPersistence::new()) as Arc<dyn Persistence>,
        config,
    };

    let bind_addr = state.config.bind_addr.clone();
    let router = server::router(state);

    log::info!("llm-gateway listening on {bind_addr}");
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, router).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
