//! Learner-side protocol state machine.
//!
//! [`LinkState`] holds everything the wire can observe or mutate: the
//! readiness flags both peers handshake over, the exchanged headers, and the
//! two mailbox slots ("last experiment" inbound, "next experiment"
//! outbound). [`LinkState::dispatch`] executes one parsed request against
//! this state, and is the only place wire commands touch it.
//!
//! The handshake is driven entirely by peer commands, with no timeouts:
//! headers are exchanged until both are present, the learner announces
//! readiness, the sequencer announces readiness, and from then on the two
//! mailbox slots carry the steady-state traffic. Flags are monotone within a
//! connection session; `reInitialize()` is the explicit reset.

pub mod codec;
pub mod server;

pub use codec::{Reply, Request, RequestError};
pub use server::{serve, serve_on, LinkServer};

use crate::core::{decode_values, encode_values, Header, Slot};

pub struct LinkState {
    sequencer_ready: bool,
    learner_ready: bool,
    param_header: Header,
    result_header: Header,
    param_header_received: bool,
    result_header_received: bool,
    /// Inbound: the peer's most recent (parameters, result) pair.
    last_exp: Slot<(Vec<f64>, Vec<f64>)>,
    /// Outbound: the next parameters for the peer to run.
    next_exp: Slot<Vec<f64>>,
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState {
            sequencer_ready: false,
            learner_ready: false,
            param_header: Header::from_wire(""),
            result_header: Header::from_wire(""),
            param_header_received: false,
            result_header_received: false,
            last_exp: Slot::new((vec![0.0], vec![0.0])),
            next_exp: Slot::new(vec![0.0]),
        }
    }
}

impl LinkState {
    pub fn new() -> Self {
        LinkState::default()
    }

    /// Executes one parsed wire request.
    pub fn dispatch(&mut self, request: Request) -> Reply {
        match request {
            Request::ReInitialize => Reply::Text(self.reinitialize()),
            Request::SequencerRunning => {
                self.sequencer_ready = true;
                Reply::Text("Sequencer get ready.".into())
            }
            Request::SequencerStopped => {
                self.sequencer_ready = false;
                Reply::Text("Sequencer stopped.".into())
            }
            Request::IsSequencerRunning => Reply::Bool(self.sequencer_ready),
            Request::LearnerRunning => Reply::Text(self.learner_running()),
            Request::LearnerStopped => Reply::Text(self.learner_stopped()),
            Request::IsLearnerRunning => Reply::Bool(self.learner_ready),
            Request::IsHeaderInitialized => Reply::Bool(self.is_header_initialized()),
            Request::GetParamHeader => {
                Reply::StrArray(self.param_header.names().to_vec())
            }
            Request::GetResultHeader => {
                Reply::StrArray(self.result_header.names().to_vec())
            }
            Request::ReceiveParamHeader(text) => {
                self.param_header = Header::from_wire(&text);
                self.param_header_received = true;
                Reply::Text(self.param_header.to_wire())
            }
            Request::SendParamHeader => Reply::Text(self.param_header.to_wire()),
            Request::ReceiveResultHeader(text) => {
                self.result_header = Header::from_wire(&text);
                self.result_header_received = true;
                Reply::Text(self.result_header.to_wire())
            }
            Request::SendResultHeader => Reply::Text(self.result_header.to_wire()),
            Request::IsLastExpUnread => Reply::Bool(self.last_exp.is_unread()),
            Request::GetLastParam => Reply::FloatArray(self.last_param()),
            Request::GetLastResult => Reply::FloatArray(self.last_result()),
            Request::ReceiveLastExp(param_text, result_text) => {
                let param = decode_values(&param_text);
                let echo = encode_values(&param);
                self.last_exp.store((param, decode_values(&result_text)));
                Reply::Text(echo)
            }
            Request::IsNextExpUnread => Reply::Bool(self.next_exp.is_unread()),
            Request::SendNextExp => Reply::Text(encode_values(self.next_exp.take())),
        }
    }

    /// Clears every flag while keeping header and slot contents, exactly the
    /// state a freshly reconnected peer expects to find.
    fn reinitialize(&mut self) -> String {
        self.sequencer_ready = false;
        self.learner_ready = false;
        self.param_header_received = false;
        self.result_header_received = false;
        self.last_exp.take();
        self.next_exp.take();
        "Re-initialized.".into()
    }

    pub fn learner_running(&mut self) -> String {
        self.learner_ready = true;
        "Learner get ready.".into()
    }

    pub fn learner_stopped(&mut self) -> String {
        self.learner_ready = false;
        "Learner stopped.".into()
    }

    pub fn is_sequencer_running(&self) -> bool {
        self.sequencer_ready
    }

    pub fn is_header_initialized(&self) -> bool {
        self.param_header_received && self.result_header_received
    }

    pub fn param_header(&self) -> &Header {
        &self.param_header
    }

    pub fn result_header(&self) -> &Header {
        &self.result_header
    }

    pub fn is_last_exp_unread(&self) -> bool {
        self.last_exp.is_unread()
    }

    /// The peer's parameters, without consuming the unread flag.
    pub fn last_param(&self) -> Vec<f64> {
        self.last_exp.peek().0.clone()
    }

    /// The peer's result; consumes the unread flag.
    pub fn last_result(&mut self) -> Vec<f64> {
        self.last_exp.take().1.clone()
    }

    pub fn is_next_exp_unread(&self) -> bool {
        self.next_exp.is_unread()
    }

    /// Stores the next outgoing parameters for the peer to pick up.
    pub fn receive_next_exp(&mut self, param: Vec<f64>) {
        self.next_exp.store(param);
    }
}
