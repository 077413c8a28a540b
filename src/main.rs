use std::sync::Arc;

use mcp_bridge::config::Settings;
use mcp_bridge::ipc::IPCServer;
use mcp_bridge::manager::Manager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("MCP bridge daemon starting");

    let settings = Settings::load()?;
    let manager = Arc::new(Manager::new(settings.clone())?);

    let summary = manager.load_configurations().await;
    tracing::info!("Loaded {} server(s)", summary.total());
    for warning in &summary.warnings {
        tracing::warn!("  {}: {}", warning.path.display(), warning.message);
    }

    // 백그라운드 헬스 체크 태스크
    let sweeper = manager.clone();
    let interval = settings.supervisor.health_interval();
    let sweep = tokio::spawn(async move {
        let mut consecutive_unhealthy = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            let results = sweeper.health_check().await;
            let unhealthy: Vec<&String> = results.iter().filter(|(_, ok)| !**ok).map(|(name, _)| name).collect();
            if unhealthy.is_empty() {
                if consecutive_unhealthy > 0 {
                    tracing::info!("All {} server(s) healthy again", results.len());
                }
                consecutive_unhealthy = 0;
            } else {
                consecutive_unhealthy += 1;
                // 처음 3번과 이후 10번마다 로깅하여 반복 로그 방지
                if consecutive_unhealthy <= 3 || consecutive_unhealthy % 10 == 0 {
                    tracing::warn!("Unhealthy server(s): {:?}", unhealthy);
                }
            }
        }
    });

    let ipc_server = IPCServer::new(manager.clone(), &settings.listen_addr);
    let result = ipc_server
        .start_with_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received, cleaning up...");
        })
        .await;

    sweep.abort();
    manager.shutdown().await;

    if let Err(e) = &result {
        tracing::error!("IPC server error: {}", e);
    }
    tracing::info!("MCP bridge daemon shutting down");
    result
}
