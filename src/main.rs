//! Learner binary: binds the link endpoint and runs a demo closed-loop
//! search: random probing to seed the training set, then Bayesian probing
//! against the bundled mock oracle.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use optlink::config::Settings;
use optlink::core::{Header, Series};
use optlink::error::LinkResult;
use optlink::history::TsvHistory;
use optlink::pipeline::policy::{share, MockPolicy, ScoreMode};
use optlink::pipeline::{BayesOptions, Learner, Pipeline, ProbeStream};
use optlink::protocol::serve;

#[derive(Parser)]
#[command(name = "optlink", about = "Closed-loop optimization learner")]
struct Args {
    /// Bind endpoint, e.g. tcp://127.0.0.1:5555 (defaults from settings).
    binder: Option<String>,

    /// Configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Seeds to sweep, one full search per seed.
    #[arg(long, default_value_t = 1)]
    seeds: u64,
}

/// Demo candidate space: four parameters doubled on the way to the
/// sequencer, the first of them swept upward probe by probe.
struct DemoLearner;

const LEARNER_PARAMS: [&str; 4] = [
    "Learner Param T",
    "Learner Param 1",
    "Learner Param 2",
    "Learner Param 3",
];
const SEQUENCER_PARAMS: [&str; 4] = [
    "Seq Param T",
    "Seq Param 1",
    "Seq Param 2",
    "Seq Param 3",
];

impl Learner for DemoLearner {
    fn learner_param_header(&self) -> Header {
        Header::new(LEARNER_PARAMS)
    }

    fn sequencer_param_header(&self) -> Header {
        Header::new(SEQUENCER_PARAMS)
    }

    fn learner_result_header(&self) -> Header {
        Header::new(["Learner Result"])
    }

    fn sequencer_result_header(&self) -> Header {
        Header::new(["Seq Result"])
    }

    fn num_duplicates(&self) -> usize {
        2
    }

    fn param_limits(&self) -> Box<dyn Iterator<Item = (Series, Series)> + Send> {
        // Sweep T from 0 to 1 across 101 probes; the other parameters stay
        // free inside [-1, 1].
        Box::new((0..=100).map(|step| {
            let t = f64::from(step) / 100.0;
            (
                Series::from_pairs(LEARNER_PARAMS.map(String::from).into_iter().zip([
                    t, -1.0, -1.0, -1.0,
                ])),
                Series::from_pairs(LEARNER_PARAMS.map(String::from).into_iter().zip([
                    t, 1.0, 1.0, 1.0,
                ])),
            )
        }))
    }

    fn map_param_to_sequencer(&self, learner_param: &Series) -> LinkResult<Series> {
        Ok(Series::from_pairs(
            SEQUENCER_PARAMS
                .iter()
                .map(|name| name.to_string())
                .zip(learner_param.values().iter().map(|v| v * 2.0)),
        ))
    }

    fn map_result_to_learner(&self, sequencer_result: &Series) -> LinkResult<Series> {
        Ok(Series::from_pairs([(
            "Learner Result",
            sequencer_result.get("Seq Result").unwrap_or(f64::NAN),
        )]))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::new(args.config.as_deref()).context("loading settings")?;
    let endpoint = args.binder.unwrap_or_else(|| settings.endpoint.clone());

    std::fs::create_dir_all(&settings.output_dir).context("creating output directory")?;
    let learner_history = Arc::new(TsvHistory::new(
        settings.output_dir.join("history.learner.tsv"),
    ));
    let sequencer_history = Arc::new(TsvHistory::new(
        settings.output_dir.join("history.sequencer.tsv"),
    ));

    let mut streams: Vec<ProbeStream> = Vec::new();
    for seed in 1..=args.seeds {
        let pipeline = Pipeline::new(
            Arc::new(DemoLearner),
            share(MockPolicy::seeded(seed)),
            learner_history.clone(),
            sequencer_history.clone(),
            seed,
        )?;
        // Random probes seed the training set, then Bayesian probes continue
        // the same search with the refit schedule.
        streams.push(pipeline.random_search(1, 20));
        streams.push(pipeline.bayes_search(
            2,
            80,
            BayesOptions {
                num_candidates: 1000,
                score: ScoreMode::Ts,
                interval: 20,
                num_rand_basis: 500,
            },
        ));
    }

    serve(&endpoint, streams.into_iter()).context("running learner")?;
    Ok(())
}
