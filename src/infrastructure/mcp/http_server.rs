//! MCP HTTP server: one JSON-RPC POST endpoint agents call home to.

use anyhow::{Context, Result};
use axum::routing::post;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

use super::handlers::{handle_rpc, McpState};

/// Bind and serve. Returns the bound port (handy when asked for port 0).
pub async fn serve(
    state: McpState,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u16> {
    let app = Router::new().route("/rpc", post(handle_rpc)).with_state(state);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .context("failed to bind MCP listener")?;
    let bound = listener.local_addr()?.port();
    info!(host, port = bound, "mcp surface listening");

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        });
        if let Err(err) = server.await {
            tracing::warn!(error = %err, "mcp server exited with error");
        }
    });

    Ok(bound)
}
