//! Progress Relay: turns the synchronous step callback of an inference call
//! into ordered notifications for the request's channel.
//!
//! The inference thread is the producer and the channel-writer task is the
//! single consumer. Progress and the terminal outcome travel through the same
//! queue, so the writer sees them in production order and nothing arrives
//! after the terminal outcome.

use std::sync::{Arc, Mutex};

use arch_types::{ArchError, Payload};
use log::trace;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::RequestTicket;
use crate::slot::lock_recover;

/// Percentage complete for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub percent: u8,
}

#[derive(Debug)]
pub enum RelayEvent {
    Progress(ProgressEvent),
    Finished(Result<Payload, ArchError>),
}

pub type RelayReceiver = mpsc::UnboundedReceiver<RelayEvent>;

struct Gate {
    last_percent: Option<u8>,
    finished: bool,
}

struct Inner {
    ticket: RequestTicket,
    tx: mpsc::UnboundedSender<RelayEvent>,
    gate: Mutex<Gate>,
}

/// Producer side, cloneable and usable from any thread.
#[derive(Clone)]
pub struct ProgressRelay {
    inner: Arc<Inner>,
}

impl ProgressRelay {
    pub fn channel(ticket: RequestTicket) -> (Self, RelayReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Self {
            inner: Arc::new(Inner {
                ticket,
                tx,
                gate: Mutex::new(Gate {
                    last_percent: None,
                    finished: false,
                }),
            }),
        };
        (relay, rx)
    }

    pub fn ticket(&self) -> &RequestTicket {
        &self.inner.ticket
    }

    /// Queue a progress percentage (clamped to 100).
    ///
    /// Values not strictly above the last one sent are dropped, as is
    /// anything reported after `finish` or after the request was abandoned.
    /// The gate lock is held across the send so concurrent callers for the
    /// same request cannot interleave.
    pub fn report_percent(&self, percent: u8) {
        let percent = percent.min(100);
        let mut gate = lock_recover(&self.inner.gate);
        if gate.finished || self.inner.ticket.is_abandoned() {
            return;
        }
        if gate.last_percent.is_some_and(|last| percent <= last) {
            return;
        }
        gate.last_percent = Some(percent);
        trace!("[RELAY] {} -> {}%", self.inner.ticket.id(), percent);
        let _ = self.inner.tx.send(RelayEvent::Progress(ProgressEvent {
            request_id: self.inner.ticket.id(),
            percent,
        }));
    }

    /// Raw step callback for a run of `total_steps` steps
    /// (`step / total_steps * 100`).
    pub fn step_reporter(&self, total_steps: u32) -> impl FnMut(u32) + Send + 'static {
        let relay = self.clone();
        let total = total_steps.max(1);
        move |step: u32| relay.report_percent(step_percent(step, total))
    }

    /// Deliver the terminal outcome. Only the first call has any effect.
    pub fn finish(&self, outcome: Result<Payload, ArchError>) {
        let mut gate = lock_recover(&self.inner.gate);
        if gate.finished {
            return;
        }
        gate.finished = true;
        if self.inner.ticket.is_abandoned() {
            return;
        }
        let _ = self.inner.tx.send(RelayEvent::Finished(outcome));
    }

    pub fn is_finished(&self) -> bool {
        lock_recover(&self.inner.gate).finished
    }
}

pub fn step_percent(step: u32, total_steps: u32) -> u8 {
    let total = u64::from(total_steps.max(1));
    (u64::from(step) * 100 / total).min(100) as u8
}
