use crate::config::{RunConfig, ServerConfig};
use crate::driver::{self, RunNotification};
use crate::network::{NetworkError, Session};
use crate::reporter::RunReport;
use crate::server::{FragmentServer, ServerSummary};
use crate::state::{SharedRunState, TestRunState};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub struct LoopbackOutcome {
    pub server: ServerSummary,
    pub report: RunReport,
    pub state: TestRunState,
}

/// Runs a self-contained session against a fragment server on the loopback interface.
///
/// The server binds an ephemeral port, so the address fields of both configs are ignored.
pub async fn run_loopback(
    server_config: ServerConfig,
    run_config: RunConfig,
    notifier: Option<UnboundedSender<RunNotification>>,
) -> Result<LoopbackOutcome, NetworkError> {
    run_config.validate()?;

    // --- Server Setup ---
    let server = FragmentServer::bind(ServerConfig {
        bind_ip: "127.0.0.1".to_string(),
        port: 0,
        ..server_config
    })
    .await?;
    let server_addr = server.local_addr()?;
    let server_handle = tokio::spawn(async move { server.serve_session().await });

    // --- Client Setup ---
    let run_config = RunConfig {
        target_ip: server_addr.ip().to_string(),
        target_port: server_addr.port(),
        ..run_config
    };
    let state = SharedRunState::new(TestRunState::from_config(&run_config));
    let client_result = match Session::connect(server_addr).await {
        Ok(session) => driver::run_session(&run_config, session, state.clone(), notifier).await,
        Err(e) => Err(e),
    };
    let outcome = match client_result {
        Ok(outcome) => outcome,
        Err(e) => {
            // the server may still be waiting on accept
            server_handle.abort();
            return Err(e);
        }
    };

    let server_summary = server_handle
        .await
        .map_err(|e| NetworkError::TaskFailed(format!("fragment server task: {}", e)))??;

    // --- Process Results ---
    let state = state.snapshot();
    let report = RunReport::build(&run_config, &state, &outcome);
    tracing::info!(
        sent = server_summary.fragments_sent,
        recorded = outcome.counters.fragments_recorded,
        "loopback run finished"
    );

    Ok(LoopbackOutcome {
        server: server_summary,
        report,
        state,
    })
}
