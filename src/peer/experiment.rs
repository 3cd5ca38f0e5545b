//! Delay-queue experiment simulator.
//!
//! Real instrument pipelines report results several requests late. The
//! simulator reproduces that: each call pushes the fresh request into a
//! queue prefilled with `delay` NaN pairs and reports the pair falling out
//! the front, so the learner's matching layer is exercised with genuinely
//! in-flight requests.

use std::collections::VecDeque;

use crate::core::{Header, Series};
use crate::error::{LinkError, LinkResult};

pub struct DelayedExperiment<F> {
    param_header: Header,
    result_header: Header,
    simulate: F,
    queue: VecDeque<(Vec<f64>, Vec<f64>)>,
}

impl<F> DelayedExperiment<F>
where
    F: FnMut(&Series) -> LinkResult<Series>,
{
    pub fn new(param_header: Header, result_header: Header, simulate: F, delay: usize) -> Self {
        let queue = (0..delay)
            .map(|_| {
                (
                    vec![f64::NAN; param_header.len()],
                    vec![f64::NAN; result_header.len()],
                )
            })
            .collect();
        DelayedExperiment {
            param_header,
            result_header,
            simulate,
            queue,
        }
    }

    /// Runs one experiment and reports the oldest finished one.
    pub fn run(&mut self, param: &[f64]) -> LinkResult<(Vec<f64>, Vec<f64>)> {
        let param_series = Series::new(self.param_header.clone(), param.to_vec())?;
        let result = (self.simulate)(&param_series)?.project(&self.result_header)?;
        self.queue.push_back((param.to_vec(), result.values().to_vec()));
        self.queue
            .pop_front()
            .ok_or_else(|| LinkError::Pipeline("delay queue unexpectedly empty".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubler() -> DelayedExperiment<impl FnMut(&Series) -> LinkResult<Series>> {
        DelayedExperiment::new(
            Header::new(["p"]),
            Header::new(["r"]),
            |param: &Series| {
                Ok(Series::from_pairs([(
                    "r",
                    param.get("p").unwrap_or(f64::NAN) * 2.0,
                )]))
            },
            2,
        )
    }

    #[test]
    fn test_results_lag_by_the_queue_depth() {
        let mut experiment = doubler();
        let (param, result) = experiment.run(&[1.0]).unwrap();
        assert!(param[0].is_nan());
        assert!(result[0].is_nan());
        let (param, result) = experiment.run(&[2.0]).unwrap();
        assert!(param[0].is_nan());
        assert!(result[0].is_nan());
        let (param, result) = experiment.run(&[3.0]).unwrap();
        assert_eq!(param, vec![1.0]);
        assert_eq!(result, vec![2.0]);
    }

    #[test]
    fn test_zero_delay_reports_immediately() {
        let mut experiment = DelayedExperiment::new(
            Header::new(["p"]),
            Header::new(["r"]),
            |param: &Series| Ok(Series::from_pairs([("r", param.get("p").unwrap_or(0.0))])),
            0,
        );
        let (param, result) = experiment.run(&[5.0]).unwrap();
        assert_eq!(param, vec![5.0]);
        assert_eq!(result, vec![5.0]);
    }
}
