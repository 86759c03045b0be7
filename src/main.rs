mod app;
mod ui;

use anyhow::{Context, Result};
use app::{poll_event, run_speed_test, App, AppAction, AppEvent};
use cfspeed::settings::{Settings, DEFAULT_BASE_URL};
use cfspeed::speedtest::{HttpTransport, PhaseTable, SpeedTest, SpeedTestResult, TestPhase};
use clap::{ArgAction, Parser};
use crossterm::event::Event;
use ratatui::DefaultTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ui::draw_ui;

#[derive(Parser, Debug)]
#[command(name = "cfspeed", version, about = "Measure bandwidth and latency against a Cloudflare speed endpoint")]
struct Cli {
    /// Base URL of the speed test server
    #[arg(long, env = "CFSPEED_URL", default_value = DEFAULT_BASE_URL)]
    url: String,

    /// Password for a protected worker, sent as HTTP basic auth
    #[arg(long, env = "CFSPEED_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Bandwidth percentile, 0-100
    #[arg(long, env = "CFSPEED_PERCENTILE", default_value_t = 90.0, value_parser = parse_percentile)]
    percentile: f64,

    /// Per-request timeout in seconds
    #[arg(long, env = "CFSPEED_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Expected run time in seconds (informational)
    #[arg(long, env = "CFSPEED_PATIENCE", default_value_t = 15)]
    patience: u64,

    /// Phase table override, e.g. `latency:0:20,download:1000000:8`
    #[arg(long, env = "CFSPEED_PHASES")]
    phases: Option<PhaseTable>,

    /// Backoff retries allowed per request
    #[arg(long, env = "CFSPEED_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Smallest payload the rate-limit shrink will go down to
    #[arg(long, env = "CFSPEED_MIN_BYTES", default_value_t = 100_000)]
    min_bytes: u64,

    /// Run without the TUI and print a plain report
    #[arg(long, conflicts_with = "json")]
    plain: bool,

    /// Run without the TUI and print the report as JSON
    #[arg(long)]
    json: bool,

    /// Write logs to this file while the TUI is running
    #[arg(long, env = "CFSPEED_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_percentile(value: &str) -> Result<f64, String> {
    let perc: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;
    if (0.0..=100.0).contains(&perc) {
        Ok(perc)
    } else {
        Err(format!("{} is not in 0-100", value))
    }
}

impl Cli {
    fn headless(&self) -> bool {
        self.plain || self.json
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings {
            base_url: self.url.clone(),
            password: self.password.clone().filter(|p| !p.is_empty()),
            percentile: self.percentile,
            request_timeout: Duration::from_secs(self.timeout.max(1)),
            patience: Duration::from_secs(self.patience),
            ..Settings::default()
        };
        if let Some(PhaseTable(phases)) = &self.phases {
            settings.phases = phases.clone();
        }
        settings.retry.max_retries = self.max_retries;
        settings.retry.min_bytes = self.min_bytes.max(1);
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;
    let settings = cli.settings();

    if cli.headless() {
        let result = run_headless(settings).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_report(&result);
        }
        return Ok(());
    }

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, settings).await;

    ratatui::restore();
    result
}

/// Headless runs log to stderr. The TUI owns the terminal, so it only logs
/// when given a file.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if cli.headless() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
        return Ok(None);
    }

    let Some(path) = &cli.log_file else {
        return Ok(None);
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("invalid log file path: {}", path.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Ok(Some(guard))
}

async fn run_headless(settings: Settings) -> Result<SpeedTestResult> {
    let transport = HttpTransport::new(&settings).context("failed to build HTTP client")?;
    let result = SpeedTest::new(transport, settings)
        .run()
        .await
        .context("speed test failed")?;
    Ok(result)
}

fn print_report(result: &SpeedTestResult) {
    let client = result.client.summary();
    if !client.is_empty() {
        println!("Client:   {}", client);
    }
    if !result.client.colo.is_empty() {
        println!("Server:   {}", result.client.colo);
    }
    println!("Latency:  {:.2} ms (jitter {:.2} ms)", result.ping_ms, result.jitter_ms);
    println!(
        "Download: {:.2} Mbps ({:.2} MB/s)",
        result.download_mbps(),
        result.download_bytes_per_sec() / 1_000_000.0
    );
    println!(
        "Upload:   {:.2} Mbps ({:.2} MB/s)",
        result.upload_mbps(),
        result.upload_bytes_per_sec() / 1_000_000.0
    );
}

async fn run_app(terminal: &mut DefaultTerminal, settings: Settings) -> Result<()> {
    let mut app = App::new(settings);
    let mut test_rx: Option<mpsc::Receiver<AppEvent>> = None;

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        // Drain every pending update so fast phases don't lag the display.
        if let Some(rx) = test_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(AppEvent::Progress(update)) => app.apply_update(update),
                    Ok(AppEvent::Finished(Ok(result))) => app.complete_test(result),
                    Ok(AppEvent::Finished(Err(error))) => app.fail_test(error),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if app.is_running() {
                            app.fail_test("speed test stopped unexpectedly".to_string());
                        }
                        test_rx = None;
                        break;
                    }
                }
            }
        }

        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        app.reset_for_new_test();
                        app.phase = TestPhase::Ping;

                        let (tx, rx) = mpsc::channel(64);
                        let (cancel_tx, cancel_rx) = mpsc::channel(1);

                        app.set_cancel_tx(cancel_tx);
                        test_rx = Some(rx);

                        let settings = app.settings.clone();
                        tokio::spawn(run_speed_test(tx, cancel_rx, settings));
                    }
                    AppAction::CancelTest => {
                        app.cancel_test();
                        test_rx = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}
