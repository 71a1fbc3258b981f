//! # guardpost-server
//!
//! Messaging server for the Guardpost staffing portal.
//!
//! This binary provides:
//! - **REST API** (axum) for sending messages, listing conversations,
//!   reading history and marking messages seen
//! - **Realtime gateway** over WebSocket: presence, conversation rooms and
//!   per-user notification channels
//! - **Attachment storage** on local disk, content-addressed by blake3

mod api;
mod attachments;
mod config;
mod error;
mod facade;
mod gateway;
mod identity;
mod presence;
mod store;
mod ws;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guardpost_shared::constants::SERVICE_NAME;
use guardpost_store::Database;

use crate::api::AppState;
use crate::attachments::AttachmentStore;
use crate::config::ServerConfig;
use crate::facade::MessagingFacade;
use crate::gateway::RealtimeGateway;
use crate::identity::{IdentityGateway, StaticDirectory};
use crate::presence::PresenceTracker;
use crate::store::SharedStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,guardpost_server=debug,guardpost_store=info")
        }))
        .init();

    info!("Starting {} server v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => Database::default_path().context("No data directory for the database")?,
    };
    let db = Database::open_at(&db_path)
        .with_context(|| format!("Failed to open database '{}'", db_path.display()))?;
    info!(path = %db_path.display(), "Database ready");

    let identity: Arc<dyn IdentityGateway> = match &config.identity_file {
        Some(path) => Arc::new(StaticDirectory::load(path).await?),
        None => {
            warn!("IDENTITY_FILE not set, no caller can authenticate");
            Arc::new(StaticDirectory::empty())
        }
    };

    let attachments = Arc::new(
        AttachmentStore::new(
            config.attachment_storage_path.clone(),
            config.max_attachment_size,
        )
        .await?,
    );

    let gateway = RealtimeGateway::new(PresenceTracker::new(), config.outbound_queue);
    let facade = MessagingFacade::new(
        SharedStore::new(db),
        gateway.clone(),
        identity.clone(),
        attachments.clone(),
    );

    let http_addr = config.http_addr;
    let app_state = AppState {
        facade,
        identity,
        attachments,
        gateway,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + WebSocket server until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
