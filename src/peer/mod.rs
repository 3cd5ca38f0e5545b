//! Sequencer-side peer state machine.
//!
//! Mirrors the learner's handshake from the other end of the wire: announce
//! stopped, exchange headers until both sides agree, wait for the learner to
//! come up, announce running. In steady state each poll cycle pushes a
//! pending result if the learner's inbound slot is free, pulls a new
//! parameter vector if one is waiting, and runs the experiment exactly when
//! a parameter is held and no push is pending.
//!
//! This is the driver for a real instrument controller as much as for the
//! bundled simulator: anything implementing the experiment closure
//! (parameters in, delayed `(parameters, result)` out) plugs in.

pub mod experiment;

pub use experiment::DelayedExperiment;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{decode_values, encode_values, Header};
use crate::error::{LinkError, LinkResult};

pub struct SequencerClient {
    reader: BufReader<TcpStream>,
    param_header: Header,
    result_header: Header,
    last_param: Vec<f64>,
    last_result: Vec<f64>,
    last_ready: bool,
    next_param: Vec<f64>,
    next_received: bool,
    counter: u64,
}

impl SequencerClient {
    pub fn connect(
        endpoint: &str,
        param_header: Header,
        result_header: Header,
    ) -> LinkResult<Self> {
        let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        let stream = TcpStream::connect(addr)?;
        info!(%endpoint, "connected to learner");
        Ok(SequencerClient {
            reader: BufReader::new(stream),
            last_param: vec![0.0; param_header.len()],
            last_result: vec![0.0; result_header.len()],
            param_header,
            result_header,
            last_ready: false,
            next_param: Vec::new(),
            next_received: false,
            counter: 0,
        })
    }

    fn request(&mut self, line: &str) -> LinkResult<String> {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "learner closed the link",
            )));
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    fn request_bool(&mut self, line: &str) -> LinkResult<bool> {
        let reply = self.request(line)?;
        serde_json::from_str(&reply).map_err(|_| LinkError::Reply(reply))
    }

    fn request_text(&mut self, line: &str) -> LinkResult<String> {
        let reply = self.request(line)?;
        serde_json::from_str(&reply).map_err(|_| LinkError::Reply(reply))
    }

    /// Runs the handshake and then the steady-state poll loop until the
    /// learner closes the link. `experiment` maps a received parameter
    /// vector to the next `(parameters, result)` pair ready for reporting,
    /// possibly an earlier experiment's if the instrument pipeline is deep.
    pub fn run<E>(mut self, mut experiment: E, wait_time: Duration) -> LinkResult<()>
    where
        E: FnMut(&[f64]) -> LinkResult<(Vec<f64>, Vec<f64>)>,
    {
        self.request_text("sequencerStopped()")?;

        // Initial dummy experiment: all-zero parameters and result.
        self.last_param = vec![0.0; self.param_header.len()];
        self.last_result = vec![0.0; self.result_header.len()];
        self.last_ready = true;
        self.next_received = false;

        loop {
            if self.request_bool("isHeaderInitialized()")? {
                let param_echo = self.request_text("sendParamHeaderAsStr()")?;
                let result_echo = self.request_text("sendResultHeaderAsStr()")?;
                debug!(%param_echo, %result_echo, "header matching completed");
                break;
            }
            let line = format!(
                "receiveParamHeaderAsStr(\"{}\")",
                self.param_header.to_wire()
            );
            self.request_text(&line)?;
            let line = format!(
                "receiveResultHeaderAsStr(\"{}\")",
                self.result_header.to_wire()
            );
            self.request_text(&line)?;
            debug!("headers sent to learner");
            std::thread::sleep(wait_time);
        }

        while !self.request_bool("isLearnerRunning()")? {
            std::thread::sleep(wait_time);
        }
        self.request_text("sequencerRunning()")?;
        info!("handshake complete; running experiments");

        loop {
            match self.poll_cycle(&mut experiment) {
                Ok(()) => std::thread::sleep(wait_time),
                Err(LinkError::Io(err)) if is_disconnect(&err) => {
                    info!(experiments = self.counter, "learner closed the link");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn poll_cycle<E>(&mut self, experiment: &mut E) -> LinkResult<()>
    where
        E: FnMut(&[f64]) -> LinkResult<(Vec<f64>, Vec<f64>)>,
    {
        // Report the latest finished experiment once the inbound slot frees.
        if self.last_ready && !self.request_bool("isLastExpUnread()")? {
            let line = format!(
                "receiveLastExpAsStr(\"{}\", \"{}\")",
                encode_values(&self.last_param),
                encode_values(&self.last_result)
            );
            let echo = self.request_text(&line)?;
            debug!(%echo, "last experiment reported");
            self.last_ready = false;
        }

        // Pull new parameters when the learner has some waiting.
        if !self.next_received && self.request_bool("isNextExpUnread()")? {
            let text = self.request_text("sendNextExpAsStr()")?;
            self.next_param = decode_values(&text);
            self.next_received = true;
            debug!(params = %text, "next parameters received");
        }

        // Run exactly when a parameter is held and nothing awaits reporting.
        if self.next_received && !self.last_ready {
            let (param, result) = experiment(&self.next_param)?;
            self.last_param = param;
            self.last_result = result;
            self.last_ready = true;
            self.next_received = false;
            self.counter += 1;
            info!(count = self.counter, "experiment done");
        }
        Ok(())
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
