//! Relay with one blocking worker thread per direction
//!
//! Workers and a child waiter report to the relaying thread over a channel.
//! The waiter is detached: it only ever blocks on the child, which is either
//! gone or being hung up by the time the relay returns.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Direction, DirectionKind, Directions, Relay, Transfer};
use crate::endpoint::{Interrupter, Interruptible};
use crate::lifecycle::{ExitStatus, Monitor};

/// Portable relay built on blocking reads
#[derive(Debug, Clone, Copy)]
pub struct Threaded {
    drain: Duration,
}

impl Threaded {
    pub fn new(drain: Duration) -> Self {
        Self { drain }
    }
}

enum Event {
    Exited(io::Result<ExitStatus>),
    Retired(DirectionKind, io::Result<()>),
}

struct Worker {
    interrupter: Interrupter,
    // The direction comes back on join so its sink stays open until the
    // relay is finished with the session.
    handle: Option<JoinHandle<Direction<Interruptible>>>,
    retired: bool,
}

impl Worker {
    fn spawn(direction: Direction<Interruptible>, interrupter: Interrupter, events: Sender<Event>) -> io::Result<Self> {
        let name = format!("relay-{}", direction.kind().name());
        let handle = thread::Builder::new().name(name).spawn(move || pump(direction, events))?;
        Ok(Self {
            interrupter,
            handle: Some(handle),
            retired: false,
        })
    }

    fn interrupt(&self) {
        if !self.retired {
            self.interrupter.interrupt();
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("relay worker panicked");
            }
        }
    }
}

fn pump(mut direction: Direction<Interruptible>, events: Sender<Event>) -> Direction<Interruptible> {
    let kind = direction.kind();
    let result = loop {
        match direction.transfer() {
            Ok(Transfer::Forwarded(_)) => {}
            Ok(Transfer::EndOfStream) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    debug!(direction = kind.name(), ok = result.is_ok(), "relay worker retired");
    let _ = events.send(Event::Retired(kind, result));
    direction
}

struct Workers {
    input: Worker,
    output: Worker,
}

impl Workers {
    fn get_mut(&mut self, kind: DirectionKind) -> &mut Worker {
        match kind {
            DirectionKind::Input => &mut self.input,
            DirectionKind::Output => &mut self.output,
        }
    }

    fn interrupt_all(&self) {
        self.input.interrupt();
        self.output.interrupt();
    }

    fn join(&mut self) {
        self.input.join();
        self.output.join();
    }
}

impl Threaded {
    fn start(&self, directions: Directions, events: &Sender<Event>) -> io::Result<Workers> {
        let Directions { input, output } = directions;
        let (input, input_interrupter) = input.interruptible()?;
        let (output, output_interrupter) = output.interruptible()?;

        let mut input = Worker::spawn(input, input_interrupter, events.clone())?;
        match Worker::spawn(output, output_interrupter, events.clone()) {
            Ok(output) => Ok(Workers { input, output }),
            Err(e) => {
                input.interrupt();
                input.join();
                Err(e)
            }
        }
    }

    /// Wind the workers down once a status is recorded
    fn settle(&self, workers: &mut Workers, status: ExitStatus, events: &mpsc::Receiver<Event>) {
        workers.input.interrupt();
        if status == ExitStatus::RelayFailed {
            workers.output.interrupt();
        }

        while !(workers.input.retired && workers.output.retired) {
            match events.recv_timeout(self.drain) {
                Ok(Event::Retired(kind, result)) => {
                    if let Err(e) = result {
                        debug!(direction = kind.name(), "relay worker failed after exit: {e}");
                    }
                    workers.get_mut(kind).retired = true;
                }
                Ok(Event::Exited(_)) => {}
                Err(RecvTimeoutError::Timeout) => {
                    debug!("drain timed out, interrupting pending workers");
                    workers.interrupt_all();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        workers.join();
    }
}

impl Relay for Threaded {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn run(&self, directions: Directions, monitor: &mut Monitor) -> ExitStatus {
        let (events_tx, events) = mpsc::channel();

        let child = monitor.child();
        let waiter_tx = events_tx.clone();
        let waiter = thread::Builder::new()
            .name("relay-waiter".into())
            .spawn(move || {
                let _ = waiter_tx.send(Event::Exited(child.wait()));
            });
        if let Err(e) = waiter {
            return monitor.fail(e);
        }

        let mut workers = match self.start(directions, &events_tx) {
            Ok(workers) => workers,
            Err(e) => return monitor.fail(e),
        };

        let status = loop {
            let event = match events.recv() {
                Ok(event) => event,
                Err(_) => break monitor.wait(),
            };
            match event {
                Event::Exited(Ok(status)) => break monitor.record(status),
                Event::Exited(Err(e)) => break monitor.fail(e),
                Event::Retired(kind, Ok(())) => {
                    debug!(direction = kind.name(), "reached end of stream");
                    workers.get_mut(kind).retired = true;
                }
                Event::Retired(kind, Err(e)) => {
                    workers.get_mut(kind).retired = true;
                    break monitor.fail(e);
                }
            }
        };

        self.settle(&mut workers, status, &events);
        status
    }
}
