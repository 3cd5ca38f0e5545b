//! Blocking request/reply server and the main learner loop.
//!
//! The wire is strict request/reply over TCP (one outstanding request at a
//! time, never pipelined), so the server is a plain blocking loop: accept a
//! peer, answer one newline-delimited request per [`LinkServer::solve_request`]
//! call, and re-enter `accept` when the peer goes away. Server state
//! survives reconnection (the peer resets it explicitly with
//! `reInitialize()` when it wants a fresh handshake).
//!
//! [`LinkServer::run`] drives the whole learner side: handshake, then each
//! cycle moves the peer's last experiment into the [`Adapter`], polls the
//! adapter for the next parameter vector, and serves one request. Pipeline
//! exhaustion breaks the loop; the adapter is always shut down on the way
//! out.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::codec;
use super::LinkState;
use crate::adapter::Adapter;
use crate::core::{Header, Series};
use crate::error::{LinkError, LinkResult};
use crate::pipeline::ProbeStream;
use crate::session::{Connection, Session};

/// Strips the `tcp://` scheme from a transport address.
fn socket_addr(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

pub struct LinkServer {
    listener: TcpListener,
    conn: Option<BufReader<TcpStream>>,
    state: LinkState,
}

impl LinkServer {
    pub fn bind(endpoint: &str) -> LinkResult<Self> {
        let listener = TcpListener::bind(socket_addr(endpoint))?;
        info!(%endpoint, "learner listening");
        Ok(LinkServer {
            listener,
            conn: None,
            state: LinkState::new(),
        })
    }

    pub fn local_addr(&self) -> LinkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves exactly one request: blocks for the next inbound line
    /// (re-accepting if the peer is gone), dispatches it, and replies.
    /// Malformed requests are answered with their plain-text error and still
    /// count as served.
    fn solve_request(&mut self) -> LinkResult<()> {
        loop {
            if self.conn.is_none() {
                let (stream, peer) = self.listener.accept()?;
                info!(%peer, "sequencer connected");
                self.conn = Some(BufReader::new(stream));
            }
            let Some(reader) = self.conn.as_mut() else {
                continue;
            };
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    info!("sequencer disconnected");
                    self.conn = None;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "request read failed; dropping connection");
                    self.conn = None;
                    continue;
                }
            }
            let request_line = line.trim_end_matches(['\r', '\n']);
            let reply = match codec::parse_request(request_line) {
                Ok(request) => codec::encode_reply(&self.state.dispatch(request)),
                Err(err) => {
                    warn!(request = request_line, reply = err.reply_text());
                    err.reply_text().to_string()
                }
            };
            debug!(request = request_line, %reply);
            if let Err(err) = send_reply(reader.get_mut(), &reply) {
                warn!(error = %err, "reply write failed; dropping connection");
                self.conn = None;
                continue;
            }
            return Ok(());
        }
    }

    /// Runs the learner protocol to completion. `create_adapter` is called
    /// once, with the wire headers and the peer's first reported parameter
    /// vector, when the first experiment arrives.
    pub fn run<F>(mut self, create_adapter: F) -> LinkResult<()>
    where
        F: FnOnce(&Header, &Header, &[f64]) -> LinkResult<Adapter>,
    {
        let mut adapter = None;
        let result = self.run_loop(&mut adapter, create_adapter);
        if let Some(mut adapter) = adapter {
            let shutdown = adapter.shutdown();
            result?;
            return shutdown;
        }
        result
    }

    fn run_loop<F>(
        &mut self,
        adapter_slot: &mut Option<Adapter>,
        create_adapter: F,
    ) -> LinkResult<()>
    where
        F: FnOnce(&Header, &Header, &[f64]) -> LinkResult<Adapter>,
    {
        self.state.learner_stopped();

        while !self.state.is_header_initialized() {
            self.solve_request()?;
        }
        let param_header = self.state.param_header().clone();
        let result_header = self.state.result_header().clone();
        self.state.learner_running();
        info!(
            params = %param_header.to_wire(),
            results = %result_header.to_wire(),
            "headers initialized; learner running"
        );

        while !self.state.is_sequencer_running() {
            self.solve_request()?;
        }
        info!("sequencer ready; entering steady state");

        let mut create_adapter = Some(create_adapter);
        let mut next_ready = false;
        loop {
            // Move the peer's latest experiment into the pipeline.
            if !next_ready && self.state.is_last_exp_unread() {
                let last_param = self.state.last_param();
                let last_result = self.state.last_result();
                match adapter_slot.as_mut() {
                    Some(adapter) => adapter.write(last_param, last_result)?,
                    None => {
                        let create = create_adapter.take().ok_or_else(|| {
                            LinkError::Wire("adapter factory already consumed".into())
                        })?;
                        *adapter_slot =
                            Some(create(&param_header, &result_header, &last_param)?);
                    }
                }
                next_ready = true;
            }

            // Offer the pipeline's next vector once the outbound slot is free.
            if next_ready && !self.state.is_next_exp_unread() {
                if let Some(adapter) = adapter_slot.as_mut() {
                    let (running, next_param) = adapter.read()?;
                    if !running {
                        info!("pipeline exhausted; stopping");
                        break;
                    }
                    if let Some(next_param) = next_param {
                        self.state.receive_next_exp(next_param);
                        next_ready = false;
                    }
                }
            }

            self.solve_request()?;
        }
        Ok(())
    }
}

fn send_reply(stream: &mut TcpStream, reply: &str) -> std::io::Result<()> {
    stream.write_all(reply.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Wires the full learner stack (sessions over a connection over an
/// adapter) onto a bound server and runs it.
pub fn serve_on<I>(server: LinkServer, on_connection: I) -> LinkResult<()>
where
    I: Iterator<Item = ProbeStream> + Send + 'static,
{
    server.run(move |param_header, result_header, initial_param| {
        let initial = Series::new(param_header.clone(), initial_param.to_vec())?;
        let result_header = result_header.clone();
        Adapter::spawn(Connection::new(on_connection, move |probes| {
            Session::new(probes, result_header.clone(), initial.clone())
        }))
    })
}

/// Binds `endpoint` and serves the given per-session probe streams.
pub fn serve<I>(endpoint: &str, on_connection: I) -> LinkResult<()>
where
    I: Iterator<Item = ProbeStream> + Send + 'static,
{
    serve_on(LinkServer::bind(endpoint)?, on_connection)
}
