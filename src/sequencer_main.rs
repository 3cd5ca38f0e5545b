//! Mock sequencer binary: connects to a learner and answers its parameter
//! requests with a simulated instrument: a Gaussian response surface plus
//! a result delay queue, standing in for real sequencer hardware.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use optlink::config::Settings;
use optlink::core::{Header, Series};
use optlink::peer::{DelayedExperiment, SequencerClient};

#[derive(Parser)]
#[command(name = "optlink_sequencer", about = "Mock instrument sequencer peer")]
struct Args {
    /// Learner endpoint, e.g. tcp://127.0.0.1:5555 (defaults from settings).
    endpoint: Option<String>,

    /// Configuration file.
    #[arg(long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::new(args.config.as_deref()).context("loading settings")?;
    let endpoint = args.endpoint.unwrap_or_else(|| settings.endpoint.clone());

    let param_header = Header::new([
        "Seq Param T",
        "Seq Param 1",
        "Seq Param 2",
        "Seq Param 3",
    ]);
    let result_header = Header::new(["Seq Result"]);

    // Gaussian bump over the parameter norm: the optimum sits at the origin.
    let simulate = |param: &Series| {
        let norm = param.values().iter().map(|v| v * v).sum::<f64>().sqrt();
        let response = (-0.5 * norm * norm).exp() / (2.0 * std::f64::consts::PI).sqrt();
        Ok(Series::from_pairs([("Seq Result", response)]))
    };
    let mut experiment = DelayedExperiment::new(
        param_header.clone(),
        result_header.clone(),
        simulate,
        settings.delay_size,
    );

    let client = SequencerClient::connect(&endpoint, param_header, result_header)
        .context("connecting to learner")?;
    client
        .run(|param| experiment.run(param), settings.wait_time)
        .context("running sequencer")?;
    Ok(())
}
