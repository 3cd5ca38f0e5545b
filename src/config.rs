//! Runtime settings for the learner and sequencer binaries.
//!
//! Defaults are merged with an optional `optlink.toml` (or an explicitly
//! named file) and `OPTLINK_*` environment variables, in that order.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::LinkResult;

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Transport address the learner binds and the sequencer connects to.
    pub endpoint: String,

    /// Pause between peer poll cycles.
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,

    /// Directory the history files are appended under.
    pub output_dir: PathBuf,

    /// Depth of the mock sequencer's result delay queue.
    pub delay_size: usize,
}

impl Settings {
    /// Loads settings, optionally from a named configuration file.
    pub fn new(path: Option<&str>) -> LinkResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("endpoint", "tcp://127.0.0.1:5555")?
            .set_default("wait_time", "200ms")?
            .set_default("output_dir", "out")?
            .set_default("delay_size", 2)?;
        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("optlink").required(false)),
        };
        let settings = builder
            .add_source(config::Environment::with_prefix("OPTLINK"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
