use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

// Cleanup metrics
pub static CLEANUP_VMS_TOTAL: OnceLock<GaugeVec> = OnceLock::new();
pub static CLEANUP_POWEROFFS: OnceLock<CounterVec> = OnceLock::new();
pub static CLEANUP_DESTROYS: OnceLock<CounterVec> = OnceLock::new();
pub static CLEANUP_ERRORS: OnceLock<CounterVec> = OnceLock::new(); // labels: path, kind
pub static CLEANUP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

// Debounce metrics
pub static DEBOUNCE_TRACKED: OnceLock<Gauge> = OnceLock::new();

// Thread-safe initialization result
static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Times one cleanup run of a path.
#[derive(Debug)]
pub struct CleanupTimer {
    start: Instant,
    path: String,
}

impl CleanupTimer {
    pub fn new(path: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
        }
    }

    pub fn complete(self) {
        if let Some(duration) = CLEANUP_DURATION.get() {
            duration
                .with_label_values(&[self.path.as_str()])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

pub fn record_vms_total(path: &str, total: usize) {
    if let Some(gauge) = CLEANUP_VMS_TOTAL.get() {
        gauge.with_label_values(&[path]).set(total as f64);
    }
}

pub fn record_poweroff(path: &str) {
    if let Some(counter) = CLEANUP_POWEROFFS.get() {
        counter.with_label_values(&[path]).inc();
    }
}

pub fn record_destroy(path: &str) {
    if let Some(counter) = CLEANUP_DESTROYS.get() {
        counter.with_label_values(&[path]).inc();
    }
}

pub fn record_error(path: &str, kind: &str) {
    if let Some(counter) = CLEANUP_ERRORS.get() {
        counter.with_label_values(&[path, kind]).inc();
    }
}

pub fn record_debounce_tracked(tracked: usize) {
    if let Some(gauge) = DEBOUNCE_TRACKED.get() {
        gauge.set(tracked as f64);
    }
}

pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    // If encoding fails, return empty metrics rather than panic
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Thread-safe metrics initialization
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {}", e)),
    }
}

// Only called once
fn init_metrics_internal() -> Result<()> {
    let vms_total = register_gauge_vec!(
        "vsphere_janitor_cleanup_vms_total",
        "VMs evaluated during the last cleanup of a path",
        &["path"]
    )
    .context("Failed to register CLEANUP_VMS_TOTAL metric")?;

    let poweroffs = register_counter_vec!(
        "vsphere_janitor_cleanup_vms_poweroff_total",
        "Total VMs powered off",
        &["path"]
    )
    .context("Failed to register CLEANUP_POWEROFFS metric")?;

    let destroys = register_counter_vec!(
        "vsphere_janitor_cleanup_vms_destroy_total",
        "Total VMs destroyed",
        &["path"]
    )
    .context("Failed to register CLEANUP_DESTROYS metric")?;

    let errors = register_counter_vec!(
        "vsphere_janitor_cleanup_errors_total",
        "Total cleanup errors by kind",
        &["path", "kind"]
    )
    .context("Failed to register CLEANUP_ERRORS metric")?;

    let duration = register_histogram_vec!(
        "vsphere_janitor_cleanup_duration_seconds",
        "Cleanup run duration in seconds",
        &["path"]
    )
    .context("Failed to register CLEANUP_DURATION metric")?;

    let debounce_tracked = register_gauge!(
        "vsphere_janitor_debounce_tracked",
        "VMs currently waiting out the zero-uptime grace period"
    )
    .context("Failed to register DEBOUNCE_TRACKED metric")?;

    CLEANUP_VMS_TOTAL
        .set(vms_total)
        .map_err(|_| anyhow::anyhow!("Failed to set CLEANUP_VMS_TOTAL"))?;
    CLEANUP_POWEROFFS
        .set(poweroffs)
        .map_err(|_| anyhow::anyhow!("Failed to set CLEANUP_POWEROFFS"))?;
    CLEANUP_DESTROYS
        .set(destroys)
        .map_err(|_| anyhow::anyhow!("Failed to set CLEANUP_DESTROYS"))?;
    CLEANUP_ERRORS
        .set(errors)
        .map_err(|_| anyhow::anyhow!("Failed to set CLEANUP_ERRORS"))?;
    CLEANUP_DURATION
        .set(duration)
        .map_err(|_| anyhow::anyhow!("Failed to set CLEANUP_DURATION"))?;
    DEBOUNCE_TRACKED
        .set(debounce_tracked)
        .map_err(|_| anyhow::anyhow!("Failed to set DEBOUNCE_TRACKED"))?;

    Ok(())
}

// Serve the text exposition format until the listener fails to bind
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;

    init_metrics().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    tracing::info!("Metrics server listening on http://0.0.0.0:{}", port);

    serve_metrics(listener).await
}

/// Answer `GET /metrics` (or `/`) on every accepted connection, 404 otherwise.
pub async fn serve_metrics(listener: TcpListener) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream).await {
                        tracing::error!("Metrics write error: {:?}", e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {:?}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream) -> std::io::Result<()> {
    let request_line = read_request_head(&mut stream).await?;
    let mut parts = request_line.split_whitespace();
    let target = (parts.next(), parts.next());

    let resp = match target {
        (Some("GET"), Some("/metrics" | "/")) => {
            let body = get_metrics();
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
        }
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    };

    stream.write_all(resp.as_bytes()).await?;
    stream.shutdown().await
}

/// Drain the request head and return its first line.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut header = String::new();
    loop {
        header.clear();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }

    Ok(request_line)
}
