//! Drives a full probe (propose, map to sequencer space, duplicate,
//! dispatch, aggregate, feed back) through a session without any network,
//! checking every stage's contract along the way.

use parking_lot::Mutex;
use std::sync::Arc;

use optlink::adapter::Adaptee;
use optlink::core::{Header, Series};
use optlink::error::{LinkError, LinkResult};
use optlink::history::MemoryHistory;
use optlink::pipeline::policy::{share, Policy, Predictor, ScoreMode};
use optlink::pipeline::{BayesOptions, Learner, Pipeline};
use optlink::session::Session;

const LEARNER_PARAMS: [&str; 4] = ["T", "1", "2", "3"];
const SEQ_PARAMS: [&str; 4] = ["Seq T", "Seq 1", "Seq 2", "Seq 3"];

/// Doubles parameters on the way out; result maps back unchanged.
struct DoublingLearner {
    duplicates: usize,
}

impl Learner for DoublingLearner {
    fn learner_param_header(&self) -> Header {
        Header::new(LEARNER_PARAMS)
    }

    fn sequencer_param_header(&self) -> Header {
        Header::new(SEQ_PARAMS)
    }

    fn learner_result_header(&self) -> Header {
        Header::new(["Learner Result"])
    }

    fn sequencer_result_header(&self) -> Header {
        Header::new(["Seq Result"])
    }

    fn num_duplicates(&self) -> usize {
        self.duplicates
    }

    fn param_limits(&self) -> Box<dyn Iterator<Item = (Series, Series)> + Send> {
        // Degenerate bounds pin every probe to {T: 0, 1: -1, 2: -1, 3: -1}.
        let point = Series::from_pairs([("T", 0.0), ("1", -1.0), ("2", -1.0), ("3", -1.0)]);
        Box::new(std::iter::repeat((point.clone(), point)).take(200))
    }

    fn map_param_to_sequencer(&self, learner_param: &Series) -> LinkResult<Series> {
        Ok(Series::from_pairs(
            SEQ_PARAMS
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

/// Records observations where the test can see them.
#[derive(Clone, Default)]
struct CapturingPolicy {
    observed: Arc<Mutex<Vec<(Series, f64)>>>,
    learned: Arc<Mutex<usize>>,
    fail_incremental: bool,
}

impl Policy for CapturingPolicy {
    fn training_len(&self) -> usize {
        self.observed.lock().len()
    }

    fn write(&mut self, x: &[Series], t: &[f64]) -> LinkResult<()> {
        let mut observed = self.observed.lock();
        for (x, t) in x.iter().zip(t) {
            observed.push((x.clone(), *t));
        }
        Ok(())
    }

    fn learn(&mut self, _num_rand_basis: usize) -> LinkResult<Box<dyn Predictor>> {
        *self.learned.lock() += 1;
        Ok(Box::new(CapturingPredictor {
            fail_incremental: self.fail_incremental,
        }))
    }
}

struct CapturingPredictor {
    fail_incremental: bool,
}

impl Predictor for CapturingPredictor {
    fn score(&self, _mode: ScoreMode, candidates: &[Series]) -> LinkResult<Vec<f64>> {
        Ok((0..candidates.len()).map(|i| i as f64).collect())
    }

    fn write(&mut self, _x: &Series, _t: f64) -> LinkResult<()> {
        if self.fail_incremental {
            return Err(LinkError::Policy("incremental update unsupported".into()));
        }
        Ok(())
    }
}

fn wire_initial() -> Series {
    Series::from_pairs(SEQ_PARAMS.iter().map(|name| (name.to_string(), 0.0)))
}

fn session_over(probes: optlink::pipeline::ProbeStream) -> Session {
    Session::new(probes, Header::new(["Seq Result"]), wire_initial())
}

#[test]
fn test_probe_round_trip_with_duplicates() {
    let policy = CapturingPolicy::default();
    let observed = policy.observed.clone();
    let learner_history = Arc::new(MemoryHistory::new());
    let sequencer_history = Arc::new(MemoryHistory::new());
    let pipeline = Pipeline::new(
        Arc::new(DoublingLearner { duplicates: 2 }),
        share(policy),
        learner_history.clone(),
        sequencer_history.clone(),
        7,
    )
    .expect("pipeline");

    let mut session = session_over(pipeline.random_search(1, 1));

    // Learner-space {T:0, 1:-1, 2:-1, 3:-1} doubles to {0, -2, -2, -2};
    // duplicate count 2 yields two identical requests.
    let first = session.next_request().expect("first").expect("ok");
    assert_eq!(first, vec![0.0, -2.0, -2.0, -2.0]);
    let second = session.next_request().expect("second").expect("ok");
    assert_eq!(second, first);

    // Feed back 4.0 and 6.0: mean 5.0, mapped to learner space unchanged.
    session.write(&first, &[4.0]).expect("first result");
    assert!(observed.lock().is_empty(), "one duplicate must not feed back");
    session.write(&second, &[6.0]).expect("second result");

    {
        let observed = observed.lock();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].0.values(), &[0.0, -1.0, -1.0, -1.0]);
        assert_eq!(observed[0].1, 5.0);
    }

    // Training reached the requested probe count: the stream is exhausted.
    assert!(session.next_request().is_none());

    // One learner row with the aggregated result, one sequencer row per
    // duplicate with its own raw result.
    let learner_rows = learner_history.records();
    assert_eq!(learner_rows.len(), 1);
    assert!(learner_rows[0].values().contains(&"5".to_string()));
    let sequencer_rows = sequencer_history.records();
    assert_eq!(sequencer_rows.len(), 2);
    assert!(sequencer_rows[0].values().contains(&"4".to_string()));
    assert!(sequencer_rows[1].values().contains(&"6".to_string()));

    // Duplicate rows carry their duplicate index next to the scan number.
    assert_eq!(sequencer_rows[0].columns()[4], "duplicate_num");
    assert_eq!(sequencer_rows[0].values()[4], "1");
    assert_eq!(sequencer_rows[1].values()[4], "2");
}

#[test]
fn test_bayes_refit_schedule_and_fallback() {
    let policy = CapturingPolicy {
        fail_incremental: true,
        ..CapturingPolicy::default()
    };
    let observed = policy.observed.clone();
    let learned = policy.learned.clone();
    let pipeline = Pipeline::new(
        Arc::new(DoublingLearner { duplicates: 1 }),
        share(policy),
        Arc::new(MemoryHistory::new()),
        Arc::new(MemoryHistory::new()),
        7,
    )
    .expect("pipeline");

    let mut session = session_over(
        pipeline.bayes_search(
            2,
            3,
            BayesOptions {
                num_candidates: 10,
                score: ScoreMode::Ts,
                interval: 2,
                num_rand_basis: 50,
            },
        ),
    );

    for _ in 0..3 {
        let request = session.next_request().expect("request").expect("ok");
        session.write(&request, &[1.0]).expect("result");
    }
    assert!(session.next_request().is_none());
    assert_eq!(observed.lock().len(), 3);

    // Interval 2 over 3 probes refits twice; every incremental update fails
    // and falls back to a full refit, adding three more.
    assert_eq!(*learned.lock(), 5);
}
