//! `mcp-streaming-server` binary entry point. Doubles as the fork-mode
//! tool worker: re-exec'd with `--tool-worker <request> <result>` by the
//! Tool Registry's out-of-process execution path (spec.md §4.8, §9).

use std::process::ExitCode;
use std::sync::Arc;

use mcp_streaming::config::{SecurityConfig, ServerConfig};
use mcp_streaming::dispatcher::{Dispatcher, ServerCapabilities, ServerInfo};
use mcp_streaming::session::SessionManager;
use mcp_streaming::timeout::TimeoutManager;
use mcp_streaming::tools::{
    echo_tool_definition, run_tool_worker, sleep_tool_definition, EchoTool, SleepTool, ToolRegistry,
    ToolRegistryConfig,
};
use mcp_streaming::Server;
use tracing_subscriber::EnvFilter;

/// The tools available to every instance of this binary, worker mode
/// included, so a re-exec'd child can resolve the same names.
fn build_registry() -> ToolRegistry {
    let registry = ToolRegistry::new(ToolRegistryConfig::default());
    registry
        .register_tool(echo_tool_definition(), Arc::new(EchoTool))
        .expect("built-in tool registration cannot collide");
    registry
        .register_tool(sleep_tool_definition(), Arc::new(SleepTool))
        .expect("built-in tool registration cannot collide");
    registry
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 4 && args[1] == "--tool-worker" {
        let registry = Arc::new(build_registry());
        let request_path = std::path::PathBuf::from(&args[2]);
        let result_path = std::path::PathBuf::from(&args[3]);
        return match run_tool_worker(registry, request_path, result_path).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(error = %err, "tool worker failed");
                ExitCode::FAILURE
            }
        };
    }

    let config = ServerConfig::default();
    let security = SecurityConfig::default();
    let server_info = ServerInfo {
        name: config.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        server_info,
        ServerCapabilities::default(),
        Arc::new(SessionManager::default()),
        Arc::new(TimeoutManager::default()),
        Arc::new(build_registry()),
    ));
    let server = Server::new(config, security, dispatcher);

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind/listen");
            ExitCode::FAILURE
        }
    }
}
