// snewpdag - command line driver
//
// Loads detectors and the node graph, then injects the input messages once
// or as a series of Monte-Carlo bursts.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use snewpdag::config::{load_messages, load_node_specs, Config};
use snewpdag::dag;
use snewpdag::detector::DetectorRegistry;
use snewpdag::driver;
use snewpdag::error::ConfigError;
use snewpdag::node::Context;
use snewpdag::plugins::PluginRegistry;

fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn run(config: &Config) -> Result<(), ConfigError> {
    let mut detectors = DetectorRegistry::new();
    for path in &config.detectors {
        detectors.read_csv(path)?;
    }
    info!("{} detectors registered", detectors.len());

    let specs = load_node_specs(&config.config)?;
    let registry = PluginRegistry::with_builtins();
    let mut dag = dag::build(&specs, &registry, Context::new(detectors))?;
    info!("built graph of {} nodes from {}", dag.len(), config.config.display());

    let messages = load_messages(&config.input)?;
    match config.trials {
        Some(n) => driver::run_trials(&mut dag, &messages, n, config.first_burst)?,
        None => {
            driver::inject(&mut dag, &messages)?;
        }
    }
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
