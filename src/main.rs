use std::sync::Arc;
use std::time::Duration;

use contract_watch::attribution::AttributionClient;
use contract_watch::config::Config;
use contract_watch::error::{AppError, FatalConfigError};
use contract_watch::persistence::Store;
use contract_watch::sig_down::SigDown;
use contract_watch::{supervisor, telemetry};

const ATTRIBUTION_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    telemetry::init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "fatal error during startup");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::load()?;

    let selected_chains = config.selected_chains();
    if selected_chains.is_empty() {
        return Err(AppError::Config(FatalConfigError::NoUsableChains));
    }

    let store = Store::open(&config.persistence_location)
        .await
        .map_err(FatalConfigError::Persistence)?;

    let api_key = match config.attribution.api_key {
        Some(literal_or_env) => Some(literal_or_env.into_inner()),
        None => None,
    };
    let attribution = Arc::new(AttributionClient::new(
        config.attribution.base_url.clone(),
        api_key,
        ATTRIBUTION_TIMEOUT,
    ));

    let factory_signatures = config
        .factory_signatures
        .iter()
        .cloned()
        .map(Into::into)
        .collect();

    let sig_down = SigDown::try_new().map_err(|e| AppError::Other(format!("failed to install signal handler: {e}")))?;
    let shutdown = sig_down.cancellation_token();

    tracing::info!(chains = selected_chains.len(), "starting contract-watch");

    let result = supervisor::run(
        selected_chains.into_iter().collect(),
        factory_signatures,
        attribution,
        store,
        shutdown,
    )
    .await;

    if let Some(signal) = sig_down.reason() {
        tracing::info!(signal = signal.as_str(), "shutdown was triggered by signal");
    }

    result
}
