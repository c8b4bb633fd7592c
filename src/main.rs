use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use traceway_agent::capture::{self, Capture, RequestInfo, Response};
use traceway_agent::collectors::{cpu, memory};
use traceway_agent::config::Config;
use traceway_agent::flusher::{self, SpoolSink};
use traceway_agent::models::record::Envelope;
use traceway_agent::util::human::{fmt_bytes, fmt_pct};
use traceway_agent::util::ring_buffer::RingBuffer;
use traceway_agent::util::spool;

#[derive(Parser, Debug)]
#[command(name = "traceway-agent", about = "Buffered diagnostics agent with ack-style spooling", version = "0.1")]
struct Cli {
    /// Flush interval in milliseconds (overrides config)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Ring capacity (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    capacity: Option<i64>,

    /// Print a one-shot JSON sample of CPU and memory and exit
    #[arg(long)]
    sample: bool,

    /// Run headless: sample host metrics into the buffer and flush to the spool
    #[arg(long)]
    daemon: bool,

    /// Instrument N synthetic handler calls (every 5th panics), flush once and exit
    #[arg(long, value_name = "N")]
    demo: Option<usize>,

    /// Print recent spooled records and exit
    #[arg(long)]
    spool: bool,

    /// Number of spooled records to show (used with --spool)
    #[arg(long, default_value_t = 50)]
    last: usize,

    /// Print config file path and current values, then exit
    #[arg(long)]
    config: bool,

    /// Generate a shell completion script and exit
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        clap_complete::generate(shell, &mut Cli::command(), "traceway-agent", &mut io::stdout());
        return Ok(());
    }

    let mut cfg = Config::load();
    if let Some(ms) = cli.interval {
        cfg.flush.interval_ms = ms;
    }
    if let Some(cap) = cli.capacity {
        cfg.buffer.capacity = cap;
    }

    if cli.sample {
        return run_sample(&cfg);
    }
    if cli.spool {
        return run_print_spool(&cfg, cli.last);
    }
    if cli.config {
        return run_print_config(&cfg);
    }
    if let Some(n) = cli.demo {
        return run_demo(&cfg, n);
    }
    if cli.daemon {
        return run_daemon(&cfg);
    }

    Cli::command().print_help()?;
    println!();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn spool_path(cfg: &Config) -> Result<PathBuf> {
    cfg.spool_path().context("no spool path configured and no local data dir available")
}

fn new_capture(cfg: &Config) -> Result<Capture> {
    let ring = RingBuffer::<Envelope>::with_requested_capacity(cfg.buffer.capacity)
        .context("invalid [buffer] capacity")?;
    Ok(Capture::new(capture::shared(ring), cfg.capture.options()))
}

fn run_sample(cfg: &Config) -> Result<()> {
    use serde_json::json;

    let cpu_pct = cpu::sample_cpu_percent(Duration::from_millis(cfg.general.cpu_sample_ms))?;
    let mem     = memory::total_memory()?;
    let snapshot = json!({
        "timestamp":       chrono::Utc::now().to_rfc3339(),
        "cpu_percent":     cpu_pct,
        "cpu_percent_hr":  fmt_pct(cpu_pct),
        "memory_total":    mem,
        "memory_total_hr": fmt_bytes(mem),
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn run_print_spool(cfg: &Config, n: usize) -> Result<()> {
    let path = spool_path(cfg)?;
    let entries = spool::load_recent(&path, n);
    if entries.is_empty() {
        println!("No records in {}.", path.display());
        return Ok(());
    }
    for env in &entries {
        println!(
            "{} [{}] #{} {}",
            env.record.timestamp().format("%Y-%m-%d %H:%M:%S"),
            env.record.label(),
            env.id,
            env.record.summary()
        );
    }
    Ok(())
}

fn run_print_config(cfg: &Config) -> Result<()> {
    let path = Config::config_path()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "(unknown)".to_string());
    println!("Config: {}", path);
    println!();
    println!("[general]");
    println!("  metrics_interval_ms = {}", cfg.general.metrics_interval_ms);
    println!("  cpu_sample_ms       = {}", cfg.general.cpu_sample_ms);
    println!();
    println!("[buffer]");
    println!("  capacity            = {}", cfg.buffer.capacity);
    println!();
    println!("[flush]");
    println!("  interval_ms         = {}", cfg.flush.interval_ms);
    println!("  max_batch           = {}", cfg.flush.max_batch);
    match cfg.spool_path() {
        Some(p) => println!("  spool_path          = {}", p.display()),
        None    => println!("  spool_path          = (unavailable)"),
    }
    println!();
    println!("[capture]");
    println!("  repanic             = {}", cfg.capture.repanic);
    println!("  record_unmatched    = {}", cfg.capture.record_unmatched);
    println!("  recording           = {:?}", cfg.capture.recording);
    println!("  server_name         = {}", cfg.capture.server_name.as_deref().unwrap_or("(not set)"));
    println!("  version             = {}", cfg.capture.version.as_deref().unwrap_or("(not set)"));
    Ok(())
}

fn run_demo(cfg: &Config, n: usize) -> Result<()> {
    let mut demo_cfg = cfg.clone();
    demo_cfg.capture.repanic = false;
    let agent = new_capture(&demo_cfg)?;

    for i in 0..n {
        let mut req = RequestInfo::new("GET", Some("/demo/:id"), &format!("/demo/{}", i));
        req.client_ip = Some("127.0.0.1".into());
        agent.instrument(&req, |scope| {
            scope.set_tag("iteration", i.to_string());
            if i % 5 == 4 {
                panic!("synthetic failure on call {}", i);
            }
            Response::ok(64 * (i as u64 + 1))
        });
    }

    let buffered = capture::lock(agent.buffer()).len();
    let mut sink = SpoolSink::new(spool_path(cfg)?);
    let report = flusher::flush_once(agent.buffer(), &mut sink, cfg.flush.max_batch)?;
    println!(
        "{} call(s) instrumented, {} record(s) buffered, {} sent, {} removed → {}",
        n, buffered, report.sent, report.removed, sink.path().display()
    );
    Ok(())
}

fn run_daemon(cfg: &Config) -> Result<()> {
    let agent = new_capture(cfg)?;
    let mut sink = SpoolSink::new(spool_path(cfg)?);

    tracing::info!(
        capacity = cfg.buffer.capacity,
        flush_ms = cfg.flush.interval_ms,
        spool = %sink.path().display(),
        "traceway-agent daemon starting"
    );

    let sampler = agent.clone();
    let metrics_every = Duration::from_millis(cfg.general.metrics_interval_ms.max(100));
    let cpu_window    = Duration::from_millis(cfg.general.cpu_sample_ms.max(10));
    std::thread::Builder::new()
        .name("metrics-sampler".into())
        .spawn(move || sample_loop(&sampler, metrics_every, cpu_window))
        .context("spawning metrics sampler")?;

    let tick = Duration::from_millis(cfg.flush.interval_ms.max(500));
    loop {
        std::thread::sleep(tick);
        match flusher::flush_once(agent.buffer(), &mut sink, cfg.flush.max_batch) {
            Ok(r) if r.sent > 0 => tracing::info!(sent = r.sent, removed = r.removed, "flushed"),
            Ok(_)  => {}
            // Unacked records stay buffered for the next cycle.
            Err(e) => tracing::warn!("flush failed: {:#}", e),
        }
    }
}

fn sample_loop(agent: &Capture, every: Duration, cpu_window: Duration) {
    loop {
        match cpu::sample_cpu_percent(cpu_window) {
            Ok(pct) => agent.metric("cpu.percent", pct),
            Err(e)  => tracing::warn!("cpu sample failed: {}", e),
        }
        match memory::total_memory() {
            Ok(bytes) => agent.metric("memory.total_bytes", bytes as f64),
            Err(e)    => tracing::warn!("memory sample failed: {}", e),
        }
        std::thread::sleep(every.saturating_sub(cpu_window));
    }
}
