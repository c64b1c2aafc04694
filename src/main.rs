//! ztl - Zone Translation Layer driver
//!
//! Opens a zoned device, runs a write/read/verify workload of objects over
//! it and reports the resulting I/O counters. With `--serve` the instance
//! stays up and exposes its Prometheus counters until interrupted.
//!
//! ```text
//!  worker threads ──▶ Ztl::write_object / read_object ──▶ sim device
//!                                    │
//!  GET /metrics ◀── Telemetry ◀──────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ztl::{Ztl, ZtlConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Zone Translation Layer - variable-length writes over zoned media
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device to open (`sim:<name>` for an in-memory zoned device)
    #[arg(long, env = "ZTL_DEVICE", default_value = "sim:demo")]
    device: String,

    /// YAML configuration file
    #[arg(long, env = "ZTL_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Objects written by the workload (0 skips it)
    #[arg(long, env = "ZTL_OBJECTS", default_value = "256")]
    objects: u64,

    /// Size of each workload object in bytes
    #[arg(long, env = "ZTL_OBJECT_SIZE", default_value = "65536")]
    object_size: usize,

    /// Workload threads
    #[arg(long, env = "ZTL_THREADS", default_value = "4")]
    threads: u64,

    /// Keep running and serve /metrics until interrupted
    #[arg(long, env = "ZTL_SERVE")]
    serve: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting zone translation layer");
    info!("  Device: {}", args.device);
    info!(
        "  Workload: {} objects x {} bytes on {} threads",
        args.objects, args.object_size, args.threads
    );

    let config = match &args.config {
        Some(path) => ZtlConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ZtlConfig::default(),
    };

    let ztl = Arc::new(
        Ztl::init(&args.device, config)
            .with_context(|| format!("failed to open device {}", args.device))?,
    );

    if args.objects > 0 {
        run_workload(Arc::clone(&ztl), &args).await?;
    }

    let stats = ztl.stats();
    info!(
        io_count = stats.io_count,
        written_bytes = stats.written_bytes,
        read_bytes = stats.read_bytes,
        zone_resets = stats.zone_resets,
        write_amplification = stats.write_amplification,
        objects = ztl.object_count(),
        "workload complete"
    );

    if args.serve {
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        run_metrics_server(&args.metrics_addr, Arc::clone(&ztl), shutdown).await?;
    }

    match Arc::try_unwrap(ztl) {
        Ok(ztl) => ztl.shutdown(),
        Err(_) => warn!("instance still referenced at exit; skipping orderly shutdown"),
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

/// Write, read back and verify `args.objects` objects from blocking worker
/// threads. Object `id` is filled with bytes derived from its id.
async fn run_workload(ztl: Arc<Ztl>, args: &Args) -> anyhow::Result<()> {
    let threads = args.threads.max(1);
    let objects = args.objects;
    let size = args.object_size;
    let started = Instant::now();

    let mut handles = Vec::new();
    for worker in 0..threads {
        let ztl = Arc::clone(&ztl);
        handles.push(tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let mut verified = 0;
            let mut readback = vec![0u8; size];
            for id in (worker..objects).step_by(threads as usize) {
                let data = object_pattern(id, size);
                ztl.write_object(id, &data, (id % 4) as u8)
                    .with_context(|| format!("write of object {} failed", id))?;

                let n = ztl
                    .read_object(id, 0, &mut readback)
                    .with_context(|| format!("read of object {} failed", id))?;
                if n != size || readback != data {
                    bail!("object {} read back {} bytes that differ from what was written", id, n);
                }
                verified += 1;
            }
            Ok(verified)
        }));
    }

    let mut verified = 0;
    for handle in handles {
        verified += handle.await.context("workload thread panicked")??;
    }

    info!(
        verified,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "objects written and verified"
    );
    Ok(())
}

fn object_pattern(id: u64, size: usize) -> Vec<u8> {
    (0..size).map(|i| (id as usize).wrapping_add(i) as u8).collect()
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

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
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    ztl: Arc<Ztl>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    async fn metrics_handler(
        ztl: Arc<Ztl>,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match ztl.telemetry().encode_text() {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            "/stats" => match serde_json::to_string(&ztl.stats()) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            },
            "/healthz" => respond(StatusCode::OK, "text/plain", "ok".into()),
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found".into()),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Metrics server stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted.context("metrics server accept error")?,
        };

        let io = TokioIo::new(stream);
        let ztl = Arc::clone(&ztl);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(Arc::clone(&ztl), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
