use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use hyphae::{Runtime, RuntimeConfig};

mod stress;

/// Hammers the hyphae concurrency primitives and checks their invariants.
#[derive(Debug, Parser)]
#[command(name = "hyphae-stress", version, about)]
struct Options {
    /// Which scenario to run.
    #[arg(value_enum, default_value_t = stress::Scenario::All)]
    scenario: stress::Scenario,

    /// How many times to run each scenario.
    #[arg(short, long, default_value_t = 3)]
    iterations: usize,

    /// Problem size: nodes, indices, or lock acquisitions per scenario.
    #[arg(short = 'n', long, default_value_t = 12_345)]
    count: usize,

    /// Parallel loop batch size.
    #[arg(short, long, default_value_t = 32)]
    batch: usize,

    /// Number of scheduler worker threads.
    #[arg(short, long, env = "HYPHAE_WORKER_THREADS")]
    workers: Option<usize>,

    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, env = "HYPHAE_LOG", default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let opts = Options::parse();
    trace_init(&opts.log)?;

    let mut config = RuntimeConfig::from_env().wrap_err("invalid runtime configuration")?;
    if opts.workers.is_some() {
        config.worker_threads = opts.workers;
    }
    // fatal errors already reach stderr through `tracing`.
    let runtime = Runtime::new(config.with_stderr_diagnostics(false));
    tracing::debug!(?opts, "hyphae-stress configuration");

    let params = stress::Params {
        count: opts.count,
        batch: opts.batch,
    };
    for iteration in 0..opts.iterations {
        let _span = tracing::info_span!("iteration", iteration).entered();
        for &scenario in opts.scenario.expand() {
            stress::run(&runtime, scenario, &params)
                .wrap_err_with(|| format!("scenario `{scenario}` failed"))?;
        }
    }

    runtime.shutdown();
    tracing::info!(iterations = opts.iterations, "all scenarios passed");
    Ok(())
}

fn trace_init(filter: &str) -> Result<()> {
    use tracing_subscriber::prelude::*;
    let filter = filter
        .parse::<tracing_subscriber::EnvFilter>()
        .wrap_err_with(|| format!("invalid log filter {filter:?}"))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .with(tracing_error::ErrorLayer::default())
        .with(filter)
        .try_init()?;
    Ok(())
}
