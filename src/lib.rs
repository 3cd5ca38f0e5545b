//! Closed-loop experiment exchange between an optimization learner and a
//! laboratory instrument sequencer.
//!
//! An optimizer proposes parameter vectors; an external instrument
//! controller executes them and reports measurements; the two meet over a
//! synchronous request/reply TCP link. This crate provides the exchange
//! protocol and the concurrency bridge between them:
//!
//! - [`exchange`]: the generic suspend/resume primitive and combinators a
//!   multi-stage experiment composes into one suspending unit of work
//! - [`pipeline`]: the search pipeline built from those combinators, over an
//!   opaque optimizer oracle
//! - [`adapter`]: a worker thread driving the pipeline behind a non-blocking
//!   read/write surface
//! - [`session`]: routing of identifier-less results back to their pending
//!   requests by tolerance matching, across connection lifetimes
//! - [`protocol`] and [`peer`]: the two ends of the wire handshake and
//!   steady-state loop

pub mod adapter;
pub mod config;
pub mod core;
pub mod error;
pub mod exchange;
pub mod history;
pub mod peer;
pub mod pipeline;
pub mod protocol;
pub mod session;
