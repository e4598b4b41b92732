pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod server;
pub mod validation;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::RelayConfig;
use engine::cache::{MemoryCache, ResponseCache};
use engine::crypto::ConfigCipher;
use engine::rate_limiter::RateLimiter;
use engine::upstream::UpstreamClient;
use error::AppError;

/// Shared state handed to every request handler.
///
/// Built once at startup and dropped on shutdown, taking the keypair with it.
pub struct AppState {
    pub config: RelayConfig,
    /// Read-only after startup.
    pub cipher: Arc<ConfigCipher>,
    pub cache: Arc<dyn ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    /// Root token; every relay task holds a child and stops when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: RelayConfig, cipher: ConfigCipher) -> Result<Self, AppError> {
        let upstream = UpstreamClient::new(
            config.upstream_url.clone(),
            config.upstream_timeout,
            config.connect_timeout,
        )?;
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window);

        Ok(Self {
            cipher: Arc::new(cipher),
            cache: Arc::new(MemoryCache::new()),
            limiter: Arc::new(limiter),
            upstream: Arc::new(upstream),
            shutdown: CancellationToken::new(),
            config,
        })
    }
}

/// Process entry point: load `.env`, configure logging, generate the
/// keypair and serve until Ctrl-C.
pub fn run() -> Result<(), AppError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {}", e);
        }
    }

    let config = RelayConfig::from_env()?;
    logging::init(config.log_json);
    if let Some(dir) = &config.data_dir {
        logging::install_crash_hook(dir);
    }

    tracing::info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let bits = config.rsa_bits;
        tracing::info!(bits, "Generating transport keypair");
        let cipher = tokio::task::spawn_blocking(move || ConfigCipher::generate(bits))
            .await
            .map_err(|e| AppError::Internal(format!("Key generation task failed: {}", e)))??;

        let state = Arc::new(AppState::new(config, cipher)?);
        server::serve(state).await
    })
}
