use anyhow::{bail, Context};
use fragtest_core::config::{RunConfig, ServerConfig};
use fragtest_core::driver::{self, RunNotification};
use fragtest_core::export;
use fragtest_core::loopback;
use fragtest_core::network::Session;
use fragtest_core::packet::TestSize;
use fragtest_core::registry::BoundsPolicy;
use fragtest_core::reporter::RunReport;
use fragtest_core::server::FragmentServer;
use fragtest_core::state::{SharedRunState, TestRunState};
use fragtest_core::stats::SizeStatistics;
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

#[derive(Debug, StructOpt)]
#[structopt(about = "Measures how fragmented application messages survive the network")]
enum Args {
    /// Connect to a fragment server and run the test battery
    Run(RunArgs),
    /// Serve the test battery to clients
    Serve(ServeArgs),
    /// Run server and client on the loopback interface
    Loopback(LoopbackArgs),
}

#[derive(Debug, StructOpt)]
struct ClientOpts {
    /// JSON run configuration; command line flags override it
    #[structopt(long)]
    config: Option<PathBuf>,
    /// Comma-separated test sizes to expect, e.g. 10,25,50
    #[structopt(long, use_delimiter = true)]
    sizes: Vec<TestSize>,
    #[structopt(long)]
    population: Option<u8>,
    /// Ask the server for a warm-up burst before the battery
    #[structopt(long)]
    warmup: bool,
    /// Ask the server to space out the fragments of an instance
    #[structopt(long)]
    inter_fragment_delay: bool,
    /// Grow matrices for out-of-range test indices instead of dropping them
    #[structopt(long)]
    grow: bool,
    #[structopt(long)]
    idle_timeout_secs: Option<u64>,
    /// Write latency, finish and fragment CSVs into this directory
    #[structopt(long)]
    export_dir: Option<PathBuf>,
    /// Directory for the JSON report
    #[structopt(long, default_value = ".")]
    report_dir: PathBuf,
}

impl ClientOpts {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load_json(path)
                .with_context(|| format!("loading run config {}", path.display()))?,
            None => RunConfig::default(),
        };
        if !self.sizes.is_empty() {
            config.test_sizes = self.sizes.clone();
        }
        if let Some(population) = self.population {
            config.population = population;
        }
        config.warmup |= self.warmup;
        config.inter_fragment_delay |= self.inter_fragment_delay;
        if self.grow {
            config.bounds_policy = BoundsPolicy::Grow;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, StructOpt)]
struct RunArgs {
    /// Fragment server address
    #[structopt(default_value = "127.0.0.1")]
    ip: String,
    #[structopt(long)]
    port: Option<u16>,
    #[structopt(flatten)]
    client: ClientOpts,
}

#[derive(Debug, StructOpt)]
struct ServerOpts {
    /// JSON server configuration; command line flags override it
    #[structopt(long = "server-config")]
    server_config: Option<PathBuf>,
    /// Probability in [0, 1] that a fragment is withheld
    #[structopt(long)]
    loss: Option<f64>,
    #[structopt(long)]
    seed: Option<u64>,
    /// Comma-separated test sizes the battery walks through
    #[structopt(long = "server-sizes", use_delimiter = true)]
    server_sizes: Vec<TestSize>,
    #[structopt(long = "server-population")]
    server_population: Option<u8>,
}

impl ServerOpts {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.server_config {
            Some(path) => ServerConfig::load_json(path)
                .with_context(|| format!("loading server config {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(loss) = self.loss {
            config.loss_probability = loss;
        }
        if self.seed.is_some() {
            config.rng_seed = self.seed;
        }
        if !self.server_sizes.is_empty() {
            config.test_sizes = self.server_sizes.clone();
        }
        if let Some(population) = self.server_population {
            config.population = population;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, StructOpt)]
struct ServeArgs {
    #[structopt(long)]
    bind: Option<String>,
    #[structopt(long)]
    port: Option<u16>,
    /// Stop after this many sessions; serves forever when omitted
    #[structopt(long)]
    sessions: Option<u64>,
    #[structopt(flatten)]
    server: ServerOpts,
}

#[derive(Debug, StructOpt)]
struct LoopbackArgs {
    #[structopt(flatten)]
    server: ServerOpts,
    #[structopt(flatten)]
    client: ClientOpts,
}

fn main() -> Result {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async {
        match Args::from_args() {
            Args::Run(args) => args.run().await,
            Args::Serve(args) => args.run().await,
            Args::Loopback(args) => args.run().await,
        }
    })
}

impl RunArgs {
    async fn run(self) -> Result {
        let mut config = self.client.run_config()?;
        config.target_ip = self.ip.clone();
        if let Some(port) = self.port {
            config.target_port = port;
        }
        let addr = config.target_addr()?;

        let state = SharedRunState::new(TestRunState::from_config(&config));
        let (tx, progress) = progress_printer(state.clone());
        let session = Session::connect(addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        let outcome = driver::run_session(&config, session, state.clone(), Some(tx)).await?;
        let _ = progress.await;

        let state = state.snapshot();
        let report = RunReport::build(&config, &state, &outcome);
        finish(&report, &state, &self.client)
    }
}

impl ServeArgs {
    async fn run(self) -> Result {
        let mut config = self.server.server_config()?;
        if let Some(bind) = self.bind {
            config.bind_ip = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }

        let server = FragmentServer::bind(config).await?;
        let mut served = 0u64;
        while self.sessions.map_or(true, |limit| served < limit) {
            match server.serve_session().await {
                Ok(summary) => info!(?summary, "session done"),
                Err(e) => warn!(error = %e, "session failed"),
            }
            served += 1;
        }
        Ok(())
    }
}

impl LoopbackArgs {
    async fn run(self) -> Result {
        let server_config = self.server.server_config()?;
        let run_config = self.client.run_config()?;

        // the loopback state is created inside the run, so progress only logs sizes
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let RunNotification::TestStarted { test_size } = notification {
                    println!("Test for {} fragments started", test_size);
                }
            }
        });
        let outcome = loopback::run_loopback(server_config, run_config, Some(tx)).await?;
        let _ = progress.await;

        info!(server = ?outcome.server, "fragment server summary");
        finish(&outcome.report, &outcome.state, &self.client)
    }
}

/// Prints the statistics of each size once the next one starts, and of the last one at the end.
fn progress_printer(state: SharedRunState) -> (mpsc::UnboundedSender<RunNotification>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut current: Option<TestSize> = None;
        while let Some(notification) = rx.recv().await {
            match notification {
                RunNotification::TestStarted { test_size } => {
                    if let Some(done) = current.replace(test_size) {
                        print_size(&state, done);
                    }
                    println!("Test for {} fragments started", test_size);
                }
                RunNotification::SessionClosed => {
                    if let Some(done) = current.take() {
                        print_size(&state, done);
                    }
                }
                RunNotification::StateChanged { .. } => {}
            }
        }
    });
    (tx, handle)
}

fn print_size(state: &SharedRunState, test_size: TestSize) {
    let stats = state.with(|s| SizeStatistics::collect(s, test_size));
    println!(
        "  {} fragments: {}/{} instances seen, {} failed, drop rate {}",
        test_size,
        stats.observed_instances,
        stats.population,
        stats.failed_tests,
        stats
            .drop_rate_percent
            .map_or_else(|| "n/a".to_string(), |rate| format!("{:.2}%", rate)),
    );
}

fn finish(report: &RunReport, state: &TestRunState, opts: &ClientOpts) -> Result {
    println!("{}", report);

    if let Some(dir) = &opts.export_dir {
        export::export_all(dir, state).with_context(|| format!("exporting CSVs to {}", dir.display()))?;
    }

    let report_path = report_file(&opts.report_dir);
    std::fs::create_dir_all(&opts.report_dir)?;
    report
        .write_json(&report_path)
        .with_context(|| format!("writing report {}", report_path.display()))?;
    println!("Report: {}", report_path.display());

    if !report.verdict.passed() {
        bail!("{} threshold violation(s)", report.verdict.violations.len());
    }
    Ok(())
}

fn report_file(dir: &Path) -> PathBuf {
    dir.join(format!("fragtest_report_{}.json", chrono::Local::now().format("%Y%m%d_%H%M%S")))
}
