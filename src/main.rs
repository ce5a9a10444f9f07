//! viewcache server
//!
//! Serves the remote cache protocol over TCP for calculation processes that
//! share one identifier authority and one shared value store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         viewcache                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  TCP accept  │───▶│ CacheServer  │───▶│ StoreRegistry│       │
//! │  │     loop     │    │  (dispatch)  │    │ memory|redb  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │                        /metrics (hyper)                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use viewcache::cache::{
    InMemoryIdentifierMap, InMemoryStoreFactory, PersistentIdentifierMap, PersistentStoreFactory,
    StorageEnvironment, StoreRegistry,
};
use viewcache::config::{BackendKind, CacheServiceConfig};
use viewcache::domain::{IdentifierMap, ValueSpecification};
use viewcache::remote::CacheServer;

// =============================================================================
// CLI Arguments
// =============================================================================

/// viewcache - shared computation value cache server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags override its values
    #[arg(long, env = "VIEWCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Protocol listen address [default: 127.0.0.1:7300]
    #[arg(long, env = "VIEWCACHE_LISTEN")]
    listen: Option<String>,

    /// Store backend (memory, persistent)
    #[arg(long, env = "VIEWCACHE_BACKEND")]
    backend: Option<BackendKind>,

    /// Root directory of the persistent backend
    #[arg(long, env = "VIEWCACHE_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Bound on handling one request, in seconds
    #[arg(long, env = "VIEWCACHE_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn service_config(&self) -> anyhow::Result<CacheServiceConfig> {
        let mut config = match &self.config {
            Some(path) => CacheServiceConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CacheServiceConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = Some(addr.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    let config = args.service_config()?;

    info!("Starting viewcache");
    info!("  Listen address: {}", config.listen);
    info!("  Backend: {:?}", config.backend);
    if config.backend == BackendKind::Persistent {
        info!("  Storage root: {}", config.storage_root.display());
        info!("  Durable writes: {}", config.durable_writes);
    }
    info!("  Request timeout: {:?}", config.request_timeout());

    let (identifiers, registry) = build_backend(&config)?;
    let server = Arc::new(
        CacheServer::new(identifiers, registry.clone())
            .with_request_timeout(config.request_timeout()),
    );

    if let Some(metrics_addr) = config.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    tokio::select! {
        result = server.serve(listener) => {
            result.context("cache server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    registry.shutdown().await.context("stopping stores")?;
    info!("viewcache shutdown complete");
    Ok(())
}

type Backend = (
    Arc<dyn IdentifierMap<ValueSpecification>>,
    Arc<StoreRegistry>,
);

fn build_backend(config: &CacheServiceConfig) -> anyhow::Result<Backend> {
    let backend: Backend = match config.backend {
        BackendKind::Memory => {
            let identifiers: Arc<dyn IdentifierMap<ValueSpecification>> =
                Arc::new(InMemoryIdentifierMap::<ValueSpecification>::new());
            let registry = StoreRegistry::new(Arc::new(InMemoryStoreFactory::new()));
            (identifiers, Arc::new(registry))
        }
        BackendKind::Persistent => {
            let environment =
                StorageEnvironment::new(config.storage_root.clone(), config.durable_writes);
            let identifiers: Arc<dyn IdentifierMap<ValueSpecification>> = Arc::new(
                PersistentIdentifierMap::<ValueSpecification>::open(environment.clone())
                    .context("opening persistent identifier map")?,
            );
            let registry = StoreRegistry::new(Arc::new(PersistentStoreFactory::new(environment)));
            (identifiers, Arc::new(registry))
        }
    };
    Ok(backend)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("redb=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;

    fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match viewcache::metrics::render() {
                Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string().into_bytes(),
                ),
            },
            "/healthz" | "/livez" | "/readyz" => {
                respond(StatusCode::OK, "text/plain", b"ok".to_vec())
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", b"not found".to_vec()),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
