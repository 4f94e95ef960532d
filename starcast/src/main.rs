use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use starcast::config::AppConfig;
use starcast::notification::Destination;
use starcast::secret::{DEFAULT_KEY_FILE, TokenCipher};
use starcast::services::ServiceContainer;
use starcast::{database, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("starcast: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e:#}");
            eprintln!("starcast: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let (logging, _guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        filter = %logging.get_filter(),
        "Starting starcast"
    );

    let pool = database::init_pool(&config.database_url)
        .await
        .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let cipher = match (&config.secret_key, &config.secret_key_file) {
        (Some(key), _) => TokenCipher::from_base64_key(key)?,
        (None, Some(path)) => TokenCipher::load_or_create(path)?,
        (None, None) => TokenCipher::load_or_create(Path::new(DEFAULT_KEY_FILE))?,
    };

    let services = ServiceContainer::new(&config, pool.clone(), cipher)?;
    let applied = services.bootstrap(config.bootstrap.actions()).await?;
    if applied > 0 {
        info!(applied, "Applied startup settings");
    }

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.child_token());
    if let Some(raw) = &config.log_channel_id {
        match Destination::parse(raw) {
            Ok(channel) => logging.start_channel_forwarder(
                services.messenger.clone(),
                channel,
                background.child_token(),
            ),
            Err(e) => warn!(error = %e, "Ignoring invalid LOG_CHANNEL_ID"),
        }
    }

    match services.status().await {
        Ok(status) => info!("\n{}", status.render_html()),
        Err(e) => warn!(error = %e, "Failed to collect status"),
    }

    let mut running = services.start();
    running
        .wait_for(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Shutdown signal received");
    running.shutdown().await;
    background.cancel();
    pool.close().await;
    info!("starcast stopped");
    Ok(())
}
