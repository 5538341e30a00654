//! The single read loop over the ring buffer.

use log::{debug, info, warn};
use thiserror::Error;

use crate::codec;
use crate::ringbuf::{ReadError, RecordSource};
use crate::sink::EventSink;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    /// The buffer was closed; the loop is winding down normally.
    Draining,
    /// The sink failed; the loop is winding down with an error.
    Faulted,
    Stopped,
}

/// Counters for one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    pub events: u64,
    pub read_errors: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Error)]
#[error("event sink failed after {events} events: {cause:#}")]
pub struct SinkError {
    pub events: u64,
    cause: anyhow::Error,
}

pub struct Consumer<S> {
    source: S,
    state: ConsumerState,
    report: ConsumerReport,
}

impl<S: RecordSource> Consumer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: ConsumerState::Idle,
            report: ConsumerReport::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn report(&self) -> ConsumerReport {
        self.report
    }

    /// Give the source back, e.g. to release the buffer at a chosen point.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Read, decode and forward until the buffer is closed.
    ///
    /// Read and decode failures are counted and skipped. Only a sink failure
    /// ends the loop with an error.
    pub async fn run<K: EventSink>(&mut self, sink: &mut K) -> Result<ConsumerReport, SinkError> {
        self.transition(ConsumerState::Running);
        info!("Waiting for events...");

        let result = loop {
            let raw = match self.source.read().await {
                Ok(raw) => raw,
                Err(ReadError::Closed) => {
                    self.transition(ConsumerState::Draining);
                    info!("Ring buffer closed, exiting...");
                    break Ok(self.report);
                }
                Err(e) => {
                    self.report.read_errors += 1;
                    telemetry::record_read_error();
                    warn!("{}", e);
                    continue;
                }
            };

            let event = match codec::decode(&raw) {
                Ok(event) => event,
                Err(e) => {
                    self.report.decode_errors += 1;
                    telemetry::record_decode_error();
                    warn!("parse event: {}", e);
                    continue;
                }
            };

            if let Err(cause) = sink.emit(&event) {
                self.transition(ConsumerState::Faulted);
                break Err(SinkError {
                    events: self.report.events,
                    cause,
                });
            }
            self.report.events += 1;
            telemetry::record_open_event(&event);
        };

        self.transition(ConsumerState::Stopped);
        result
    }

    fn transition(&mut self, next: ConsumerState) {
        debug!("consumer {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
