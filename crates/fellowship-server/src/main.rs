use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use fellowship_server::api::{self, AppState};
use fellowship_server::assistant::{Assistant, DisabledAssistant, HttpAssistant};
use fellowship_server::billing::{Billing, DisabledBilling, HttpBilling};
use fellowship_server::config::ServerConfig;
use fellowship_server::gateway::{Gateway, Policy};
use fellowship_server::identity::IdentityVerifier;
use fellowship_server::subscriptions::SubscriptionVerifier;
use fellowship_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fellowship_server=debug")),
        )
        .init();

    info!("Starting Fellowship server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        assistant_enabled = config.assistant_url.is_some(),
        billing_enabled = config.billing_url.is_some(),
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Database (runs migrations)
    let db = Arc::new(match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    });

    let assistant: Arc<dyn Assistant> = match &config.assistant_url {
        Some(url) => Arc::new(HttpAssistant::new(url.clone())?),
        None => Arc::new(DisabledAssistant),
    };
    let billing: Arc<dyn Billing> = match &config.billing_url {
        Some(url) => Arc::new(HttpBilling::new(url.clone())?),
        None => Arc::new(DisabledBilling),
    };

    let gateway = Gateway::new(
        db.clone(),
        assistant,
        billing,
        Policy {
            free_daily_ai_questions: config.free_daily_ai_questions,
        },
    );

    let subscriptions = Arc::new(SubscriptionVerifier::new(config.payment_server_pubkey, db));
    let identity = Arc::new(IdentityVerifier::new(config.identity_server_pubkey));

    let http_addr = config.http_addr;
    let app_state = AppState {
        gateway,
        identity,
        subscriptions,
        config: Arc::new(config),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic subscription cache cleanup (every 10 minutes)
    let sv = app_state.subscriptions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            sv.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
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
