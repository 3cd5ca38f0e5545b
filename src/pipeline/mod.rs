//! The search pipeline: one suspended exchange per dispatched experiment.
//!
//! For every probe the pipeline asks the oracle for a learner-space
//! candidate, wraps it as an [`Exp`], maps it into sequencer space, fans out
//! into duplicates, and yields each duplicate's parameter vector to the
//! outside world. When measured results flow back in, the same chain runs in
//! reverse: duplicate results are aggregated, mapped back to learner space,
//! recorded to history, and fed to the oracle, all expressed with the
//! [`Exchange`] combinators, so the whole probe is a single suspending unit
//! of work.
//!
//! # Stage order
//!
//! ```text
//! propose ─ map ─▶ Exp ─ map ─▶ history ─ map ─▶ sequencer space
//!     ─ fan-out ─▶ duplicates ─ map ─▶ history ─▶ wire dispatch
//! ```
//!
//! History rows are written on the resume path, once results are known.
//! Probe accounting follows the oracle's training length, not the number of
//! dispatched requests: probes keep being proposed while earlier results are
//! still in flight, and the stream ends only when enough feedback has
//! arrived.

pub mod policy;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{Header, Series};
use crate::error::{LinkError, LinkResult};
use crate::exchange::Exchange;
use crate::history::{HistorySink, Record};
use policy::{Predictor, ScoreMode, SharedPolicy};

/// Completion value of a probe exchange: feedback delivered, or the error
/// that ended it.
pub type Completion = LinkResult<()>;

/// One suspended probe (or probe duplicate): yields a parameter vector,
/// resumes with a result vector.
pub type ProbeExchange = Exchange<Series, Series, Completion>;

/// Lazy stream of probe exchanges for one session.
pub type ProbeStream = Box<dyn Iterator<Item = LinkResult<ProbeExchange>> + Send>;

/// One experiment occurrence as it flows through the pipeline stages.
#[derive(Clone, Debug)]
pub struct Exp {
    pub search_num: u32,
    pub probe_num: u32,
    pub duplicate_num: u32,
    pub learner_param: Series,
    pub sequencer_param: Option<Series>,
    pub sequencer_result: Option<Series>,
    pub learner_result: Option<Series>,
}

impl Exp {
    pub fn new(search_num: u32, probe_num: u32, learner_param: Series) -> Self {
        Exp {
            search_num,
            probe_num,
            duplicate_num: 0,
            learner_param,
            sequencer_param: None,
            sequencer_result: None,
            learner_result: None,
        }
    }
}

/// The candidate-space seam: headers on both sides of the link, the bounds
/// schedule, and the (possibly lossy) column transforms between learner and
/// sequencer space.
pub trait Learner: Send + Sync {
    fn learner_param_header(&self) -> Header;
    fn sequencer_param_header(&self) -> Header;
    fn learner_result_header(&self) -> Header;
    fn sequencer_result_header(&self) -> Header;

    /// Candidate-parameter bounds, one entry per probe. The schedule is
    /// advanced past already-recorded training and its final entry repeats
    /// once the iterator runs dry.
    fn param_limits(&self) -> Box<dyn Iterator<Item = (Series, Series)> + Send>;

    fn map_param_to_sequencer(&self, learner_param: &Series) -> LinkResult<Series>;
    fn map_result_to_learner(&self, sequencer_result: &Series) -> LinkResult<Series>;

    /// Number of identical sequencer requests issued per proposed candidate.
    fn num_duplicates(&self) -> usize {
        1
    }

    /// Parameter vector for each duplicate.
    fn duplicate_params(&self, sequencer_param: &Series) -> Vec<Series> {
        vec![sequencer_param.clone(); self.num_duplicates()]
    }

    /// Aggregates duplicate results into one; arithmetic mean per column.
    fn duplicate_result(&self, results: &[Series]) -> LinkResult<Series> {
        mean_series(results)
    }
}

/// Column-wise arithmetic mean over equally shaped series.
pub fn mean_series(results: &[Series]) -> LinkResult<Series> {
    let first = results
        .first()
        .ok_or_else(|| LinkError::Pipeline("no duplicate results to aggregate".into()))?;
    let mut sums = vec![0.0; first.len()];
    for series in results {
        if series.len() != first.len() {
            return Err(LinkError::LengthMismatch(series.len(), first.len()));
        }
        for (sum, value) in sums.iter_mut().zip(series.values()) {
            *sum += value;
        }
    }
    let count = results.len() as f64;
    Series::new(
        first.header().clone(),
        sums.into_iter().map(|sum| sum / count).collect(),
    )
}

/// Options for Bayesian-mode searches.
#[derive(Clone, Copy, Debug)]
pub struct BayesOptions {
    /// Candidates sampled and scored per probe.
    pub num_candidates: usize,
    /// Acquisition score handed to the predictor.
    pub score: ScoreMode,
    /// Probes between full refits.
    pub interval: usize,
    /// Basis count forwarded to `Policy::learn`.
    pub num_rand_basis: usize,
}

/// Builds probe streams over one learner definition, one oracle, and a pair
/// of injected history sinks.
pub struct Pipeline {
    ctx: StageCtx,
    policy: SharedPolicy,
    rng: Arc<Mutex<StdRng>>,
}

#[derive(Clone)]
struct StageCtx {
    learner: Arc<dyn Learner>,
    learner_history: Arc<dyn HistorySink>,
    sequencer_history: Arc<dyn HistorySink>,
    seed: u64,
    learner_param_header: Header,
    learner_result_header: Header,
    sequencer_param_header: Header,
    sequencer_result_header: Header,
}

impl Pipeline {
    pub fn new(
        learner: Arc<dyn Learner>,
        policy: SharedPolicy,
        learner_history: Arc<dyn HistorySink>,
        sequencer_history: Arc<dyn HistorySink>,
        seed: u64,
    ) -> LinkResult<Self> {
        if learner.num_duplicates() == 0 {
            return Err(LinkError::Configuration(
                "num_duplicates must be at least 1".into(),
            ));
        }
        let ctx = StageCtx {
            learner_param_header: learner.learner_param_header(),
            learner_result_header: learner.learner_result_header(),
            sequencer_param_header: learner.sequencer_param_header(),
            sequencer_result_header: learner.sequencer_result_header(),
            learner,
            learner_history,
            sequencer_history,
            seed,
        };
        Ok(Pipeline {
            ctx,
            policy,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        })
    }

    /// Probes by uniform sampling inside the current bounds.
    pub fn random_search(&self, search_num: u32, num_probes: usize) -> ProbeStream {
        let policy = Arc::clone(&self.policy);
        let rng = Arc::clone(&self.rng);
        let header = self.ctx.learner_param_header.clone();
        let propose = move |limit: &(Series, Series)| -> LinkResult<ProbeExchange> {
            let mut candidates = sample_candidates(&mut rng.lock(), limit, &header, 1)?;
            let best = candidates
                .pop()
                .ok_or_else(|| LinkError::Pipeline("candidate sampling came up empty".into()))?;
            let chosen = best.clone();
            let policy = Arc::clone(&policy);
            Ok(Exchange::suspend(best, move |result: Series| {
                let outcome = single_result(&result)?;
                policy.lock().write(&[chosen], &[outcome])?;
                Ok(())
            }))
        };
        self.stream(search_num, num_probes, propose)
    }

    /// Probes by acquisition scoring with a periodically refitted predictor.
    ///
    /// Every `interval` probes the predictor is refitted from the full
    /// training set; between refits it is updated incrementally with each
    /// observation, falling back to a full refit (non-fatal) when the
    /// incremental update fails.
    pub fn bayes_search(
        &self,
        search_num: u32,
        num_probes: usize,
        options: BayesOptions,
    ) -> ProbeStream {
        let policy = Arc::clone(&self.policy);
        let rng = Arc::clone(&self.rng);
        let header = self.ctx.learner_param_header.clone();
        let state = Arc::new(Mutex::new(BayesState {
            predictor: None,
            remaining: 0,
        }));
        let propose = move |limit: &(Series, Series)| -> LinkResult<ProbeExchange> {
            let mut guard = state.lock();
            if guard.remaining == 0 || guard.predictor.is_none() {
                guard.predictor = Some(policy.lock().learn(options.num_rand_basis)?);
                guard.remaining = options.interval.max(1);
            }
            guard.remaining -= 1;
            let mut candidates =
                sample_candidates(&mut rng.lock(), limit, &header, options.num_candidates)?;
            let scores = match guard.predictor.as_ref() {
                Some(predictor) => predictor.score(options.score, &candidates)?,
                None => return Err(LinkError::Policy("predictor unavailable".into())),
            };
            drop(guard);
            let best_index = argmax(&scores)
                .ok_or_else(|| LinkError::Policy("no candidates to score".into()))?;
            let best = candidates.swap_remove(best_index);
            let chosen = best.clone();
            let policy = Arc::clone(&policy);
            let state = Arc::clone(&state);
            let num_rand_basis = options.num_rand_basis;
            Ok(Exchange::suspend(best, move |result: Series| {
                let outcome = single_result(&result)?;
                policy.lock().write(&[chosen.clone()], &[outcome])?;
                let mut guard = state.lock();
                if let Some(predictor) = guard.predictor.as_mut() {
                    if let Err(err) = predictor.write(&chosen, outcome) {
                        tracing::warn!(error = %err, "incremental predictor update failed; refitting");
                        match policy.lock().learn(num_rand_basis) {
                            Ok(refitted) => guard.predictor = Some(refitted),
                            Err(refit_err) => {
                                tracing::warn!(
                                    error = %refit_err,
                                    "refit failed; predictor dropped until the next interval"
                                );
                                guard.predictor = None;
                            }
                        }
                    }
                }
                Ok(())
            }))
        };
        self.stream(search_num, num_probes, propose)
    }

    fn stream<F>(&self, search_num: u32, num_probes: usize, mut propose: F) -> ProbeStream
    where
        F: FnMut(&(Series, Series)) -> LinkResult<ProbeExchange> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let policy = Arc::clone(&self.policy);
        let mut schedule: Option<(usize, LimitSchedule)> = None;
        let mut probe_num: u32 = 0;
        let mut queued: VecDeque<ProbeExchange> = VecDeque::new();
        Box::new(std::iter::from_fn(move || loop {
            if let Some(exchange) = queued.pop_front() {
                return Some(Ok(exchange));
            }
            // Deferred until the first pull so that earlier sessions have
            // already grown the training set.
            let (initial_len, limits) = schedule.get_or_insert_with(|| {
                let initial_len = policy.lock().training_len();
                probe_num = initial_len as u32;
                (
                    initial_len,
                    LimitSchedule::new(ctx.learner.param_limits(), initial_len),
                )
            });
            if policy.lock().training_len() >= *initial_len + num_probes {
                return None;
            }
            probe_num += 1;
            let limit = limits.next()?;
            match propose(&limit)
                .and_then(|base| assemble_probe(&ctx, search_num, probe_num, base))
            {
                Ok(children) => queued.extend(children),
                Err(err) => return Some(Err(err)),
            }
        }))
    }
}

struct BayesState {
    predictor: Option<Box<dyn Predictor>>,
    remaining: usize,
}

/// Chains the per-probe stages onto a proposed base exchange, returning one
/// wire exchange per duplicate.
fn assemble_probe(
    ctx: &StageCtx,
    search_num: u32,
    probe_num: u32,
    base: ProbeExchange,
) -> LinkResult<Vec<ProbeExchange>> {
    let with_exp = base.map(move |learner_param| {
        Exchange::suspend(
            Exp::new(search_num, probe_num, learner_param),
            move |exp: Exp| {
                exp.learner_result.clone().ok_or_else(|| {
                    LinkError::Pipeline("probe resumed without a learner result".into())
                })
            },
        )
    });

    let seed = ctx.seed;
    let sink = Arc::clone(&ctx.learner_history);
    let with_learner_history = with_exp.map(move |exp: Exp| {
        Exchange::suspend(exp, move |exp: Exp| {
            sink.append(&learner_record(seed, &exp)?)?;
            Ok(exp)
        })
    });

    let learner = Arc::clone(&ctx.learner);
    let sequencer_param_header = ctx.sequencer_param_header.clone();
    let learner_result_header = ctx.learner_result_header.clone();
    let transformed = with_learner_history.try_map(move |mut exp: Exp| {
        let sequencer_param = learner
            .map_param_to_sequencer(&exp.learner_param)?
            .project(&sequencer_param_header)?;
        exp.sequencer_param = Some(sequencer_param);
        Ok(Exchange::suspend(exp, move |mut exp: Exp| {
            let sequencer_result = sequencer_result_of(&exp)?;
            exp.learner_result = Some(
                learner
                    .map_result_to_learner(&sequencer_result)?
                    .project(&learner_result_header)?,
            );
            Ok(exp)
        }))
    })?;

    let learner = Arc::clone(&ctx.learner);
    let fan_out = transformed.try_map(move |exp: Exp| {
        let sequencer_param = exp
            .sequencer_param
            .clone()
            .ok_or_else(|| LinkError::Pipeline("duplicating without a sequencer param".into()))?;
        let duplicates: Vec<Exp> = learner
            .duplicate_params(&sequencer_param)
            .into_iter()
            .enumerate()
            .map(|(index, param)| {
                let mut duplicate = exp.clone();
                duplicate.sequencer_param = Some(param);
                duplicate.duplicate_num = (index + 1) as u32;
                duplicate
            })
            .collect();
        Ok(Exchange::suspend(duplicates, move |resumed: Vec<Exp>| {
            let results = resumed
                .iter()
                .map(sequencer_result_of)
                .collect::<LinkResult<Vec<Series>>>()?;
            let mut aggregated = exp;
            aggregated.sequencer_result = Some(learner.duplicate_result(&results)?);
            Ok(aggregated)
        }))
    })?;

    fan_out
        .flatten()
        .into_iter()
        .map(|child| {
            let seed = ctx.seed;
            let sink = Arc::clone(&ctx.sequencer_history);
            let with_sequencer_history = child.map(move |exp: Exp| {
                Exchange::suspend(exp, move |exp: Exp| {
                    sink.append(&sequencer_record(seed, &exp)?)?;
                    Ok(exp)
                })
            });
            let sequencer_result_header = ctx.sequencer_result_header.clone();
            with_sequencer_history.try_map(move |exp: Exp| {
                let sequencer_param = exp.sequencer_param.clone().ok_or_else(|| {
                    LinkError::Pipeline("dispatching without a sequencer param".into())
                })?;
                let wire_param =
                    sequencer_param.with_prefixed("scanNum", scan_num(seed, &exp) as f64);
                Ok(Exchange::suspend(wire_param, move |wire_result: Series| {
                    let mut exp = exp;
                    exp.sequencer_result = Some(wire_result.project(&sequencer_result_header)?);
                    Ok(exp)
                }))
            })
        })
        .collect()
}

fn sequencer_result_of(exp: &Exp) -> LinkResult<Series> {
    exp.sequencer_result
        .clone()
        .ok_or_else(|| LinkError::Pipeline("experiment resumed without a sequencer result".into()))
}

/// Scan identity baked into history rows and outgoing vectors:
/// seed, search, probe and duplicate packed into one decimal number.
fn scan_num(seed: u64, exp: &Exp) -> u64 {
    let mut scan = seed;
    scan = scan * 10 + u64::from(exp.search_num);
    scan = scan * 1000 + u64::from(exp.probe_num);
    scan * 10 + u64::from(exp.duplicate_num)
}

fn learner_record(seed: u64, exp: &Exp) -> LinkResult<Record> {
    let learner_result = exp
        .learner_result
        .as_ref()
        .ok_or_else(|| LinkError::Pipeline("learner history row without a result".into()))?;
    let mut record = Record::new();
    record.push("scanNum", scan_num(seed, exp));
    record.push("seed", seed);
    record.push("search_num", exp.search_num);
    record.push("probe_num", exp.probe_num);
    push_series(&mut record, &exp.learner_param);
    push_series(&mut record, learner_result);
    Ok(record)
}

fn sequencer_record(seed: u64, exp: &Exp) -> LinkResult<Record> {
    let sequencer_param = exp
        .sequencer_param
        .as_ref()
        .ok_or_else(|| LinkError::Pipeline("sequencer history row without a param".into()))?;
    let sequencer_result = exp
        .sequencer_result
        .as_ref()
        .ok_or_else(|| LinkError::Pipeline("sequencer history row without a result".into()))?;
    let mut record = Record::new();
    record.push("scanNum", scan_num(seed, exp));
    record.push("seed", seed);
    record.push("search_num", exp.search_num);
    record.push("probe_num", exp.probe_num);
    record.push("duplicate_num", exp.duplicate_num);
    push_series(&mut record, sequencer_param);
    push_series(&mut record, sequencer_result);
    Ok(record)
}

fn push_series(record: &mut Record, series: &Series) {
    for (name, value) in series.header().names().iter().zip(series.values()) {
        record.push(name.clone(), value);
    }
}

fn single_result(result: &Series) -> LinkResult<f64> {
    match result.values() {
        [value] => Ok(*value),
        other => Err(LinkError::Pipeline(format!(
            "expected a single learner result, got {} values",
            other.len()
        ))),
    }
}

fn argmax(scores: &[f64]) -> Option<usize> {
    let mut best = None;
    for (index, &score) in scores.iter().enumerate() {
        best = match best {
            None => Some(index),
            Some(current) if score > scores[current] => Some(index),
            keep => keep,
        };
    }
    best
}

fn sample_candidates(
    rng: &mut StdRng,
    limit: &(Series, Series),
    header: &Header,
    size: usize,
) -> LinkResult<Vec<Series>> {
    let (low, high) = limit;
    let low = low.project(header)?;
    let high = high.project(header)?;
    (0..size)
        .map(|_| {
            let values: Vec<f64> = low
                .values()
                .iter()
                .zip(high.values())
                .map(|(&l, &h)| if l >= h { l } else { rng.gen_range(l..h) })
                .collect();
            Series::new(header.clone(), values)
        })
        .collect()
}

/// Bounds schedule: skips entries already covered by recorded training, then
/// repeats the final entry once the underlying iterator is exhausted.
struct LimitSchedule {
    inner: Option<Box<dyn Iterator<Item = (Series, Series)> + Send>>,
    skip: usize,
    last: Option<(Series, Series)>,
}

impl LimitSchedule {
    fn new(inner: Box<dyn Iterator<Item = (Series, Series)> + Send>, skip: usize) -> Self {
        LimitSchedule {
            inner: Some(inner),
            skip,
            last: None,
        }
    }
}

impl Iterator for LimitSchedule {
    type Item = (Series, Series);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(iter) = self.inner.as_mut() else {
                return self.last.clone();
            };
            if self.skip > 0 {
                self.skip -= 1;
                if iter.next().is_none() {
                    self.inner = None;
                }
                continue;
            }
            match iter.next() {
                Some(limit) => {
                    self.last = Some(limit.clone());
                    return Some(limit);
                }
                None => {
                    self.inner = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_series_averages_columns() {
        let results = [
            Series::from_pairs([("r", 1.0)]),
            Series::from_pairs([("r", 2.0)]),
            Series::from_pairs([("r", 3.0)]),
        ];
        let mean = mean_series(&results).unwrap();
        assert_eq!(mean.values(), &[2.0]);
    }

    #[test]
    fn test_mean_series_rejects_shape_mismatch() {
        let results = [
            Series::from_pairs([("r", 1.0)]),
            Series::from_pairs([("r", 2.0), ("s", 0.0)]),
        ];
        assert!(mean_series(&results).is_err());
    }

    #[test]
    fn test_scan_num_packs_identity() {
        let mut exp = Exp::new(2, 34, Series::from_pairs([("a", 0.0)]));
        exp.duplicate_num = 1;
        assert_eq!(scan_num(5, &exp), 520341);
    }

    #[test]
    fn test_argmax_takes_first_maximum() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_sample_candidates_holds_degenerate_columns() {
        let mut rng = StdRng::seed_from_u64(7);
        let header = Header::new(["t", "x"]);
        let low = Series::from_pairs([("t", 0.5), ("x", -1.0)]);
        let high = Series::from_pairs([("t", 0.5), ("x", 1.0)]);
        let candidates = sample_candidates(&mut rng, &(low, high), &header, 4).unwrap();
        for candidate in candidates {
            assert_eq!(candidate.get("t"), Some(0.5));
            let x = candidate.get("x").unwrap();
            assert!((-1.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_limit_schedule_skips_then_repeats_last() {
        let limits: Vec<(Series, Series)> = (0..3)
            .map(|i| {
                (
                    Series::from_pairs([("t", f64::from(i))]),
                    Series::from_pairs([("t", f64::from(i) + 1.0)]),
                )
            })
            .collect();
        let mut schedule = LimitSchedule::new(Box::new(limits.into_iter()), 1);
        assert_eq!(schedule.next().unwrap().0.get("t"), Some(1.0));
        assert_eq!(schedule.next().unwrap().0.get("t"), Some(2.0));
        assert_eq!(schedule.next().unwrap().0.get("t"), Some(2.0));
        assert_eq!(schedule.next().unwrap().0.get("t"), Some(2.0));
    }
}
