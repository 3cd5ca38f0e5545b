//! Thread-decoupling bridge between the protocol loop and the pipeline.
//!
//! The search pipeline is single-threaded and non-reentrant; the protocol
//! loop must never block on it. The [`Adapter`] runs an [`Adaptee`] on one
//! dedicated worker thread and exposes a non-blocking `read`/`write`/
//! `shutdown` surface to the protocol side.
//!
//! # Hand-off
//!
//! Two bounded channels carry all cross-thread traffic: a FIFO of work items
//! into the worker (reads, result deliveries, shutdown), and a single-slot
//! channel of produced parameter vectors (or the exhaustion sentinel) back
//! out. Work items execute strictly one at a time, so the adaptee is only
//! ever touched by the worker thread. After each successfully consumed
//! vector the adapter immediately queues the next read, for a read-ahead
//! depth of exactly one.
//!
//! # Faults
//!
//! An error escaping the adaptee stops the worker. The captured error is
//! surfaced to the next call into the adapter; the adapter is dead from then
//! on and every later call reports [`LinkError::WorkerGone`].

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use crate::error::{LinkError, LinkResult};

/// Capacity of the work FIFO. The wire protocol is strict request/reply, so
/// in practice at most a handful of items are ever queued.
const WORK_CAPACITY: usize = 64;

/// The single-threaded consumer driven by an [`Adapter`]: a pull side that
/// produces the next outgoing parameter vector and a push side that accepts
/// measured results.
pub trait Adaptee: Send {
    /// Produces the next outgoing parameter vector, `None` once exhausted.
    fn next_request(&mut self) -> Option<LinkResult<Vec<f64>>>;

    /// Delivers one measured result for a previously produced vector.
    fn write(&mut self, param: &[f64], result: &[f64]) -> LinkResult<()>;
}

enum Work {
    Read,
    Write(Vec<f64>, Vec<f64>),
    Shutdown,
}

pub struct Adapter {
    work_tx: Sender<Work>,
    next_rx: Receiver<Option<Vec<f64>>>,
    fault_rx: Receiver<LinkError>,
    worker: Option<JoinHandle<()>>,
    exhausted: bool,
    dead: bool,
}

impl Adapter {
    /// Moves the adaptee onto a fresh worker thread and queues the first
    /// read.
    pub fn spawn<A>(mut adaptee: A) -> LinkResult<Self>
    where
        A: Adaptee + 'static,
    {
        let (work_tx, work_rx) = bounded::<Work>(WORK_CAPACITY);
        let (next_tx, next_rx) = bounded::<Option<Vec<f64>>>(1);
        let (fault_tx, fault_rx) = bounded::<LinkError>(1);
        let worker = std::thread::Builder::new()
            .name("optlink-adapter".into())
            .spawn(move || {
                while let Ok(work) = work_rx.recv() {
                    match work {
                        Work::Read => match adaptee.next_request() {
                            Some(Ok(param)) => {
                                if next_tx.send(Some(param)).is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                let _ = fault_tx.send(err);
                                break;
                            }
                            None => {
                                let _ = next_tx.send(None);
                                break;
                            }
                        },
                        Work::Write(param, result) => {
                            if let Err(err) = adaptee.write(&param, &result) {
                                let _ = fault_tx.send(err);
                                break;
                            }
                        }
                        Work::Shutdown => break,
                    }
                }
            })?;
        let adapter = Adapter {
            work_tx,
            next_rx,
            fault_rx,
            worker: Some(worker),
            exhausted: false,
            dead: false,
        };
        let _ = adapter.work_tx.send(Work::Read);
        Ok(adapter)
    }

    fn check_fault(&mut self) -> LinkResult<()> {
        if self.dead {
            return Err(LinkError::WorkerGone);
        }
        match self.fault_rx.try_recv() {
            Ok(err) => {
                self.dead = true;
                Err(err)
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(()),
        }
    }

    /// Non-blocking poll for the next produced vector.
    ///
    /// Returns `(true, None)` while the worker has nothing new, each
    /// produced vector exactly once, and `(false, None)` once the pipeline
    /// is exhausted.
    pub fn read(&mut self) -> LinkResult<(bool, Option<Vec<f64>>)> {
        self.check_fault()?;
        match self.next_rx.try_recv() {
            Ok(Some(param)) => {
                let _ = self.work_tx.send(Work::Read);
                Ok((true, Some(param)))
            }
            Ok(None) => {
                self.exhausted = true;
                Ok((false, None))
            }
            Err(TryRecvError::Empty) => Ok((true, None)),
            Err(TryRecvError::Disconnected) => {
                if self.exhausted {
                    Ok((true, None))
                } else {
                    self.dead = true;
                    Err(LinkError::WorkerGone)
                }
            }
        }
    }

    /// Hands a measured result to the worker for eventual delivery into the
    /// adaptee. Results queued after exhaustion are silently never
    /// delivered, matching the mailbox-slot loss semantics.
    pub fn write(&mut self, param: Vec<f64>, result: Vec<f64>) -> LinkResult<()> {
        self.check_fault()?;
        let _ = self.work_tx.send(Work::Write(param, result));
        Ok(())
    }

    /// Requests orderly termination: queued work is drained first, then the
    /// worker exits and is joined.
    pub fn shutdown(&mut self) -> LinkResult<()> {
        let pending_fault = self.check_fault();
        let _ = self.work_tx.send(Work::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        pending_fault
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        let _ = self.work_tx.send(Work::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Produces a fixed set of vectors and records written results.
    struct ScriptedAdaptee {
        pending: Vec<Vec<f64>>,
        written: Vec<(Vec<f64>, Vec<f64>)>,
        fail_on_write: bool,
    }

    impl ScriptedAdaptee {
        fn new(items: Vec<Vec<f64>>) -> Self {
            ScriptedAdaptee {
                pending: items,
                written: Vec::new(),
                fail_on_write: false,
            }
        }
    }

    impl Adaptee for ScriptedAdaptee {
        fn next_request(&mut self) -> Option<LinkResult<Vec<f64>>> {
            if self.pending.is_empty() {
                None
            } else {
                Some(Ok(self.pending.remove(0)))
            }
        }

        fn write(&mut self, param: &[f64], result: &[f64]) -> LinkResult<()> {
            if self.fail_on_write {
                return Err(LinkError::Pipeline("scripted write failure".into()));
            }
            self.written.push((param.to_vec(), result.to_vec()));
            Ok(())
        }
    }

    fn read_eventually(adapter: &mut Adapter) -> (bool, Option<Vec<f64>>) {
        for _ in 0..200 {
            let (running, param) = adapter.read().expect("read");
            if param.is_some() || !running {
                return (running, param);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        (true, None)
    }

    #[test]
    fn test_read_delivers_each_item_exactly_once() {
        let mut adapter =
            Adapter::spawn(ScriptedAdaptee::new(vec![vec![1.0], vec![2.0]])).expect("spawn");
        assert_eq!(read_eventually(&mut adapter), (true, Some(vec![1.0])));
        assert_eq!(read_eventually(&mut adapter), (true, Some(vec![2.0])));
        assert_eq!(read_eventually(&mut adapter), (false, None));
        adapter.shutdown().expect("shutdown");
    }

    #[test]
    fn test_read_reports_not_ready_between_items() {
        let mut adapter = Adapter::spawn(ScriptedAdaptee::new(vec![vec![1.0]])).expect("spawn");
        let (_, first) = read_eventually(&mut adapter);
        assert_eq!(first, Some(vec![1.0]));
        adapter.shutdown().expect("shutdown");
    }

    #[test]
    fn test_worker_fault_surfaces_once_then_worker_gone() {
        let mut adaptee = ScriptedAdaptee::new(vec![vec![1.0]]);
        adaptee.fail_on_write = true;
        let mut adapter = Adapter::spawn(adaptee).expect("spawn");
        adapter.write(vec![1.0], vec![2.0]).expect("queued");
        // The fault lands on whichever call observes it first.
        let mut saw_fault = false;
        for _ in 0..200 {
            match adapter.read() {
                Err(LinkError::Pipeline(_)) => {
                    saw_fault = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
                Ok(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        assert!(saw_fault, "captured fault must surface");
        assert!(matches!(adapter.read(), Err(LinkError::WorkerGone)));
        assert!(matches!(
            adapter.write(vec![0.0], vec![0.0]),
            Err(LinkError::WorkerGone)
        ));
    }
}
