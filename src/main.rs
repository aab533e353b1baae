use anyhow::{Context, Result};
use mitm_whitelist::{
    CaKeyManager, CertificateAuthority, Config, LogFormat, ProxyServer, TracingLogger,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

const ROOT_CA_COMMON_NAME: &str = "mitm-whitelist Root CA";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(config.log_format);

    info!("Starting {} {}", mitm_whitelist::NAME, mitm_whitelist::VERSION);
    info!(
        entries = config.whitelist.len(),
        "Whitelist loaded: [{}]",
        config.whitelist.entries().join(", ")
    );
    if config.whitelist.is_empty() {
        info!("Whitelist is empty, every request will be blocked");
    }

    // Root CA: loaded when configured, otherwise generated for this run
    let root = match config.ca_backend() {
        Some(backend) => CaKeyManager::load_or_fail(Arc::new(backend))
            .await
            .context("Failed to load root CA")?,
        None => {
            info!("No CA_CERT_PATH/CA_KEY_PATH set, generating an ephemeral root CA");
            CaKeyManager::generate(ROOT_CA_COMMON_NAME).context("Failed to generate root CA")?
        }
    };

    if let Some(path) = &config.ca_export_path {
        root.export_ca_certificate_to_file(path)?;
        info!(path = %path.display(), "Root CA certificate exported; install it as a trusted root in clients");
    }

    let ca = Arc::new(CertificateAuthority::with_ttl(
        Arc::new(root),
        config.cert_cache_size,
        config.cert_ttl,
    ));
    info!(
        cache_size = config.cert_cache_size,
        ttl_secs = config.cert_ttl.as_secs(),
        "Certificate authority ready"
    );

    let server = ProxyServer::from_config(&config, ca, Arc::new(TracingLogger))
        .context("Failed to build proxy server")?;

    // Bind TCP listener
    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on {}", bind_addr);

    server.serve_with_shutdown(listener, shutdown_signal()).await?;

    info!("Proxy stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
