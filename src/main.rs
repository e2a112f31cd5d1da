// src/main.rs
use std::sync::Arc;

use plate_layout::api::{self, ApiState};
use plate_layout::client::{InMemoryRepository, ItemRepository, JsonApiClient};
use plate_layout::config::{AppConfig, BackendConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plate_layout=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn build_repository(config: &BackendConfig) -> Result<Arc<dyn ItemRepository>, String> {
    if let Some(url) = config.url() {
        let mut client = JsonApiClient::new(url, config.timeout())
            .map_err(|err| format!("could not build HTTP client: {err}"))?
            .with_page_limit(config.page_limit());
        if let Some(token) = config.token() {
            client = client.with_token(token);
        }
        info!(url, "Using JSON:API item store");
        return Ok(Arc::new(client));
    }

    let repository = match config.seed_file() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|err| format!("could not read {}: {err}", path.display()))?;
            InMemoryRepository::from_seed_json(&raw)
                .map_err(|err| format!("could not parse {}: {err}", path.display()))?
        }
        None => InMemoryRepository::new(),
    };
    warn!(
        batches = repository.batch_count(),
        "No backend URL configured; using the in-memory item store"
    );
    Ok(Arc::new(repository))
}

#[tokio::main]
async fn main() {
    let dotenv_result = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = dotenv_result {
        if !matches!(err, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            warn!("Could not load .env: {}", err);
        }
    }

    let app_config = AppConfig::from_env();

    info!("Plate layout service starting...");
    let repository = match build_repository(&app_config.backend) {
        Ok(repository) => repository,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let state = ApiState::new(repository, app_config.placement.clone());
    if let Err(err) = api::start_api_server(app_config.api.clone(), state).await {
        error!("API server terminated with an error: {err}");
        std::process::exit(1);
    }
}
