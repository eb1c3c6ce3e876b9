//! Network sink handler: owns the outbound framed channel, the
//! next-message-sequence counter, and a pending reconfiguration-event
//! queue piggybacked onto the final EoS (§4.7, §4.8).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::TerminationType;
use crate::error::Result;
use crate::network::channel::FramedSender;
use crate::network::wire::{EventFrame, EventKind, ReconfigurationEvent};

pub struct NetworkSinkHandler {
    sender: FramedSender,
    next_message_sequence: AtomicU64,
    pending_events: Mutex<VecDeque<ReconfigurationEvent>>,
    started: AtomicBool,
    /// The number of producer threads that feed this channel — carried on
    /// the final EoS frame so the downstream `FramedReceiver` knows how
    /// many `EndOfStream` frames to wait for before declaring the channel
    /// drained (e.g. the sink-side `ExecutableQueryPlan::producer_count()`
    /// at the time the channel was wired up).
    num_sending_threads: u16,
}

impl NetworkSinkHandler {
    pub fn new(sender: FramedSender, num_sending_threads: u16) -> Self {
        Self {
            sender,
            next_message_sequence: AtomicU64::new(0),
            pending_events: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            num_sending_threads,
        }
    }

    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes any queued reconfiguration events onto the final EoS frame
    /// before tearing the channel down (§4.8: "reconfiguration events
    /// piggyback on the final EoS").
    pub fn stop(&self, termination: TerminationType) -> Result<()> {
        self.started.store(false, Ordering::Release);
        let events: Vec<_> = self.pending_events.lock().drain(..).collect();
        let frame = EventFrame {
            kind: EventKind::EndOfStream,
            channel_id: self.sender.channel_id(),
            seq: 0, // overwritten by send_event
            termination_type: termination,
            num_sending_threads: self.num_sending_threads,
            reconfiguration_events: events,
        };
        self.sender.send_event(frame)
    }

    pub fn queue_reconfiguration(&self, event: ReconfigurationEvent) {
        self.pending_events.lock().push_back(event);
    }

    pub fn next_message_sequence(&self) -> u64 {
        self.next_message_sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub fn sender(&self) -> &FramedSender {
        &self.sender
    }
}
