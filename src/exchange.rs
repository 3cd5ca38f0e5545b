//! Two-way suspension primitive and its combinators.
//!
//! An [`Exchange`] is one suspended step of a computation: the value it
//! yielded on the way out, and the continuation waiting for exactly one
//! resume value on the way back in. A multi-stage experiment (propose →
//! transform → duplicate → dispatch → aggregate → feed back) composes into a
//! single exchange through the combinators here, and the session layer drives
//! the result without knowing anything about the stages inside.
//!
//! # Discipline
//!
//! Each exchange admits exactly one yield/resume/completion cycle.
//! [`Exchange::step`] surrenders the yielded value together with the
//! [`Resume`] handle, and `Resume::resume` consumes the handle, so resuming
//! before the yield was observed or resuming twice is unrepresentable in
//! safe code. The one genuinely dynamic piece of bookkeeping, joining a
//! fan-out back together in [`Exchange::flatten`], reports
//! [`ProtocolViolation`] if its accounting is ever broken, rather than
//! resuming a parent twice or silently dropping a result.
//!
//! Completion types carry errors (`Result<_, E>`), so a failure in any stage
//! short-circuits the remaining stages and surfaces to whoever drives the
//! exchange.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Exchange discipline broken at one of the few points the type system
/// cannot rule out. Fatal to the affected exchange.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Exchange protocol violation: {0}")]
pub struct ProtocolViolation(pub &'static str);

/// Single-shot continuation of a suspended exchange.
pub struct Resume<R, T>(Box<dyn FnOnce(R) -> T + Send>);

impl<R, T> Resume<R, T> {
    pub fn new<F>(resume: F) -> Self
    where
        F: FnOnce(R) -> T + Send + 'static,
    {
        Resume(Box::new(resume))
    }

    /// Delivers the resume value and runs the suspended remainder to its
    /// completion value. Consumes the handle.
    pub fn resume(self, value: R) -> T {
        (self.0)(value)
    }
}

/// A suspended two-way computation: a yielded value of type `Y`, a resume
/// channel of type `R`, and a completion value of type `T`.
pub struct Exchange<Y, R, T> {
    yielded: Y,
    resume: Resume<R, T>,
}

impl<Y, R, T> Exchange<Y, R, T> {
    /// Suspends with a yielded value and the continuation awaiting its
    /// resume.
    pub fn suspend<F>(yielded: Y, resume: F) -> Self
    where
        F: FnOnce(R) -> T + Send + 'static,
    {
        Exchange {
            yielded,
            resume: Resume::new(resume),
        }
    }

    /// Observes the suspension point, surrendering the yielded value and the
    /// resume handle.
    pub fn step(self) -> (Y, Resume<R, T>) {
        (self.yielded, self.resume)
    }

    /// Pure transform of the yielded value; the resume channel is untouched.
    pub fn map_yield<Y2, F>(self, transform: F) -> Exchange<Y2, R, T>
    where
        F: FnOnce(Y) -> Y2,
    {
        Exchange {
            yielded: transform(self.yielded),
            resume: self.resume,
        }
    }

    /// Pure transform of the value used to resume; the yield channel is
    /// untouched.
    pub fn map_return<R2, F>(self, transform: F) -> Exchange<Y, R2, T>
    where
        F: FnOnce(R2) -> R + Send + 'static,
        R: 'static,
        T: 'static,
    {
        let resume = self.resume;
        Exchange {
            yielded: self.yielded,
            resume: Resume::new(move |value| resume.resume(transform(value))),
        }
    }
}

impl<Y, R, T, E> Exchange<Y, R, Result<T, E>> {
    /// Sequential composition: the host's yielded value is routed through a
    /// sub-exchange built by `compose`; when the sub-exchange completes, its
    /// result resumes the host. Sub-exchange failures short-circuit the
    /// host's remainder.
    pub fn map<Y2, R2, F>(self, compose: F) -> Exchange<Y2, R2, Result<T, E>>
    where
        F: FnOnce(Y) -> Exchange<Y2, R2, Result<R, E>>,
        R: 'static,
        R2: 'static,
        T: 'static,
        E: 'static,
    {
        let (yielded, host) = self.step();
        let (sub_yielded, sub) = compose(yielded).step();
        Exchange::suspend(sub_yielded, move |value| match sub.resume(value) {
            Ok(result) => host.resume(result),
            Err(err) => Err(err),
        })
    }

    /// [`Exchange::map`] for compositions that can fail while building the
    /// sub-exchange; the failure surfaces immediately instead of waiting for
    /// a resume that will never come.
    pub fn try_map<Y2, R2, F>(
        self,
        compose: F,
    ) -> Result<Exchange<Y2, R2, Result<T, E>>, E>
    where
        F: FnOnce(Y) -> Result<Exchange<Y2, R2, Result<R, E>>, E>,
        R: 'static,
        R2: 'static,
        T: 'static,
        E: 'static,
    {
        let (yielded, host) = self.step();
        let (sub_yielded, sub) = compose(yielded)?.step();
        Ok(Exchange::suspend(sub_yielded, move |value| {
            match sub.resume(value) {
                Ok(result) => host.resume(result),
                Err(err) => Err(err),
            }
        }))
    }
}

struct FanIn<R, T, E> {
    results: BTreeMap<usize, R>,
    join: Option<Resume<Vec<R>, Result<T, E>>>,
}

impl<Y, R, E> Exchange<Vec<Y>, Vec<R>, Result<(), E>>
where
    R: Send + 'static,
    E: From<ProtocolViolation> + Send + 'static,
{
    /// Fan-out: one child exchange per yielded element, tagged by position.
    /// The parent is joined exactly once, when the last child has received
    /// its resume, with the results assembled in original index order.
    /// Resuming fewer than all children never joins the parent. An empty
    /// fan-out produces no children and drops the parent's continuation,
    /// which then simply never completes.
    pub fn flatten(self) -> Vec<Exchange<Y, R, Result<(), E>>> {
        let (items, join) = self.step();
        let expected = items.len();
        let state = Arc::new(Mutex::new(FanIn {
            results: BTreeMap::new(),
            join: Some(join),
        }));
        items
            .into_iter()
            .enumerate()
            .map(|(index, yielded)| {
                let state = Arc::clone(&state);
                Exchange::suspend(yielded, move |result: R| {
                    let mut fan_in = state.lock();
                    if fan_in.results.insert(index, result).is_some() {
                        return Err(ProtocolViolation("fan-in slot resumed twice").into());
                    }
                    if fan_in.results.len() < expected {
                        return Ok(());
                    }
                    let Some(join) = fan_in.join.take() else {
                        return Err(ProtocolViolation("fan-in joined twice").into());
                    };
                    let assembled: Vec<R> =
                        std::mem::take(&mut fan_in.results).into_values().collect();
                    drop(fan_in);
                    join.resume(assembled)
                })
            })
            .collect()
    }
}

impl<Y, R, E> Exchange<Y, R, Result<(), E>>
where
    R: 'static,
    E: From<ProtocolViolation> + Send + 'static,
{
    /// Fan-out/fan-in composition: routes the yielded value through a
    /// collection-yielding sub-exchange, then flattens into per-element
    /// children.
    pub fn flat_map<Y2, R2, F>(self, compose: F) -> Vec<Exchange<Y2, R2, Result<(), E>>>
    where
        F: FnOnce(Y) -> Exchange<Vec<Y2>, Vec<R2>, Result<R, E>>,
        R2: Send + 'static,
    {
        self.map(compose).flatten()
    }
}
