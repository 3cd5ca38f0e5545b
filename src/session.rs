//! Request/result matching and connection-lifetime composition.
//!
//! A [`Session`] owns one probe stream's interaction with the wire: it turns
//! each suspended probe into a full outgoing parameter vector and routes
//! results back to the pending probe they belong to. The wire carries no
//! request identifiers, so routing is by numeric closeness
//! ([`Series::all_close`]):
//! pending entries are scanned in insertion order and the first match wins.
//! When two pending vectors sit within tolerance of each other that choice
//! is ambiguous, an inherent limitation of identifier-less matching, kept
//! as-is rather than papered over.
//!
//! A [`Connection`] strings any number of session lifetimes into one
//! continuous reader: when one session's stream is exhausted the next is
//! started, and results are always routed to the most recently started
//! session.

use tracing::{debug, warn};

use crate::adapter::Adaptee;
use crate::core::{Header, Series};
use crate::error::LinkResult;
use crate::exchange::Resume;
use crate::pipeline::{Completion, ProbeStream};

pub struct Session {
    probes: ProbeStream,
    result_header: Header,
    last_param: Series,
    pending: Vec<(Series, Resume<Series, Completion>)>,
}

impl Session {
    /// `initial_param` seeds the carry-forward base: the first outgoing
    /// vector overlays the first probe's columns onto it.
    pub fn new(
        probes: ProbeStream,
        result_header: Header,
        initial_param: Series,
    ) -> Self {
        Session {
            probes,
            result_header,
            last_param: initial_param,
            pending: Vec::new(),
        }
    }

    /// Pending requests currently awaiting a result.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Adaptee for Session {
    fn next_request(&mut self) -> Option<LinkResult<Vec<f64>>> {
        let exchange = match self.probes.next()? {
            Ok(exchange) => exchange,
            Err(err) => return Some(Err(err)),
        };
        let (partial, resume) = exchange.step();
        let full = self.last_param.overlay(&partial);
        self.last_param = full.clone();
        let values = full.values().to_vec();
        self.pending.push((full, resume));
        Some(Ok(values))
    }

    fn write(&mut self, param: &[f64], result: &[f64]) -> LinkResult<()> {
        let matched = self
            .pending
            .iter()
            .position(|(vector, _)| vector.all_close(param));
        match matched {
            Some(index) => {
                let (_, resume) = self.pending.remove(index);
                let result = Series::new(self.result_header.clone(), result.to_vec())?;
                resume.resume(result)
            }
            None => {
                warn!(?param, "no pending request within tolerance; result dropped");
                Ok(())
            }
        }
    }
}

/// Composes successive connection lifetimes over a stream of probe streams.
pub struct Connection<I, F> {
    on_connection: I,
    create_session: F,
    active: Option<Session>,
}

impl<I, F> Connection<I, F>
where
    I: Iterator<Item = ProbeStream> + Send,
    F: FnMut(ProbeStream) -> Session + Send,
{
    pub fn new(on_connection: I, create_session: F) -> Self {
        Connection {
            on_connection,
            create_session,
            active: None,
        }
    }
}

impl<I, F> Adaptee for Connection<I, F>
where
    I: Iterator<Item = ProbeStream> + Send,
    F: FnMut(ProbeStream) -> Session + Send,
{
    fn next_request(&mut self) -> Option<LinkResult<Vec<f64>>> {
        loop {
            if let Some(session) = self.active.as_mut() {
                if let Some(item) = session.next_request() {
                    return Some(item);
                }
            }
            // Current lifetime exhausted (or none yet): start the next one.
            // The last session stays active so late results still route.
            match self.on_connection.next() {
                Some(probes) => self.active = Some((self.create_session)(probes)),
                None => return None,
            }
        }
    }

    fn write(&mut self, param: &[f64], result: &[f64]) -> LinkResult<()> {
        match self.active.as_mut() {
            Some(session) => session.write(param, result),
            None => {
                debug!("result before any session started; dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::pipeline::ProbeExchange;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn probe(
        yielded: Series,
        seen: Arc<Mutex<Vec<Series>>>,
    ) -> LinkResult<ProbeExchange> {
        Ok(Exchange::suspend(yielded, move |result: Series| {
            seen.lock().push(result);
            Ok(())
        }))
    }

    fn session_with(
        probes: Vec<LinkResult<ProbeExchange>>,
        initial: Series,
    ) -> Session {
        Session::new(
            Box::new(probes.into_iter()),
            Header::new(["r"]),
            initial,
        )
    }

    #[test]
    fn test_next_request_overlays_onto_previous_vector() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let initial = Series::from_pairs([("a", 1.0), ("b", 2.0)]);
        let partial = Series::from_pairs([("b", 9.0)]);
        let mut session = session_with(vec![probe(partial, Arc::clone(&seen))], initial);
        let outgoing = session.next_request().expect("item").expect("ok");
        assert_eq!(outgoing, vec![1.0, 9.0]);
    }

    #[test]
    fn test_write_routes_by_tolerance_in_any_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let initial = Series::from_pairs([("a", 0.0)]);
        let first = Series::from_pairs([("a", 1.0)]);
        let second = Series::from_pairs([("a", 2.0)]);
        let mut session = session_with(
            vec![
                probe(first, Arc::clone(&seen)),
                probe(second, Arc::clone(&seen)),
            ],
            initial,
        );
        session.next_request().expect("first").expect("ok");
        session.next_request().expect("second").expect("ok");
        assert_eq!(session.pending_len(), 2);

        // Results arrive out of order; each routes to its own request.
        session.write(&[2.0], &[20.0]).expect("write");
        session.write(&[1.0], &[10.0]).expect("write");
        assert_eq!(session.pending_len(), 0);
        let seen = seen.lock();
        assert_eq!(seen[0].values(), &[20.0]);
        assert_eq!(seen[1].values(), &[10.0]);
    }

    #[test]
    fn test_unmatched_write_is_dropped_non_fatally() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let initial = Series::from_pairs([("a", 0.0)]);
        let first = Series::from_pairs([("a", 1.0)]);
        let mut session = session_with(vec![probe(first, Arc::clone(&seen))], initial);
        session.next_request().expect("item").expect("ok");
        session.write(&[5.0], &[50.0]).expect("non-fatal");
        assert_eq!(session.pending_len(), 1);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_ambiguous_match_resolves_to_insertion_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let initial = Series::from_pairs([("a", 0.0)]);
        let same = Series::from_pairs([("a", 3.0)]);
        let mut session = session_with(
            vec![
                probe(same.clone(), Arc::clone(&seen)),
                probe(same, Arc::clone(&seen)),
            ],
            initial,
        );
        session.next_request().expect("first").expect("ok");
        session.next_request().expect("second").expect("ok");
        session.write(&[3.0], &[1.0]).expect("write");
        assert_eq!(session.pending_len(), 1);
    }

    #[test]
    fn test_connection_chains_session_lifetimes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first_stream: ProbeStream = Box::new(
            vec![probe(Series::from_pairs([("a", 1.0)]), Arc::clone(&seen))].into_iter(),
        );
        let second_stream: ProbeStream = Box::new(
            vec![probe(Series::from_pairs([("a", 2.0)]), Arc::clone(&seen))].into_iter(),
        );
        let mut connection = Connection::new(
            vec![first_stream, second_stream].into_iter(),
            |probes| {
                Session::new(
                    probes,
                    Header::new(["r"]),
                    Series::from_pairs([("a", 0.0)]),
                )
            },
        );
        assert_eq!(
            connection.next_request().expect("s1").expect("ok"),
            vec![1.0]
        );
        assert_eq!(
            connection.next_request().expect("s2").expect("ok"),
            vec![2.0]
        );
        // Late result routes into the most recent session.
        connection.write(&[2.0], &[9.0]).expect("write");
        assert_eq!(seen.lock().len(), 1);
        assert!(connection.next_request().is_none());
        // The last session stays reachable for writes after exhaustion.
        connection.write(&[1.0], &[8.0]).expect("write");
    }
}
