//! Kafka Writer CLI
//!
//! Reads lines from stdin and produces them to a Kafka topic in batches.
//! Each line is either `key<TAB>value` or a bare value.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_writer_core::config::{AppConfig, LoggingConfig};
use kafka_writer_core::{Message, Writer, WriterMetrics};

/// Batching Kafka producer fed from stdin.
#[derive(Parser)]
#[command(name = "kafka-writer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override the target topic.
    #[arg(long)]
    topic: Option<String>,

    /// Override the broker list (comma separated).
    #[arg(long, value_delimiter = ',')]
    brokers: Option<Vec<String>>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_file(&args.config)?;

    if let Some(topic) = args.topic {
        config.writer.topic = topic;
    }
    if let Some(brokers) = args.brokers {
        config.writer.brokers = brokers;
    }
    config.writer.validate()?;

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        topic = %config.writer.topic,
        brokers = ?config.writer.brokers,
        batch_size = config.writer.batch_size,
        batch_bytes = config.writer.batch_bytes,
        "starting kafka writer"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_writer(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries the final stats
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_writer(config: AppConfig) -> anyhow::Result<()> {
    let group_size = config.writer.batch_size;
    let writer = Arc::new(Writer::new(config.writer)?);

    if config.metrics.enabled {
        let metrics = Arc::new(WriterMetrics::new());
        let writer = Arc::clone(&writer);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics, writer).await {
                error!(error = %e, "metrics server error");
            }
        });
        info!(address = %config.metrics.address, "metrics server started");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::with_capacity(group_size);
    let mut failed_groups = 0u64;

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received, flushing pending messages");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    pending.push(parse_line(&line));
                    if pending.len() >= group_size {
                        failed_groups += write_group(&writer, &mut pending).await;
                    }
                }
                None => break,
            }
        }
    }

    failed_groups += write_group(&writer, &mut pending).await;
    writer.close().await?;

    print!("{}", serde_yaml::to_string(&writer.stats())?);

    if failed_groups > 0 {
        anyhow::bail!("{failed_groups} group(s) of messages failed to write");
    }
    info!("writer shutdown complete");
    Ok(())
}

/// Write and clear `pending`, returning 1 if the write failed.
async fn write_group(writer: &Writer, pending: &mut Vec<Message>) -> u64 {
    if pending.is_empty() {
        return 0;
    }
    let group = std::mem::take(pending);
    let count = group.len();
    match writer.write_messages(None, group).await {
        Ok(()) => 0,
        Err(e) => {
            error!(count, error = %e, "failed to write messages");
            1
        }
    }
}

/// Parse a `key<TAB>value` line; lines without a tab are keyless values.
fn parse_line(line: &str) -> Message {
    match line.split_once('\t') {
        Some((key, value)) => Message::new(value.to_string()).with_key(key.to_string()),
        None => Message::new(line.to_string()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<WriterMetrics>,
    writer: Arc<Writer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);
        let writer = Arc::clone(&writer);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                let writer = Arc::clone(&writer);
                async move {
                    metrics.observe(&writer.stats());
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
