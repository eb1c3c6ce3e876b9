//! The network channel itself (§4.8): a one-way, ordered, framed channel
//! between an upstream worker and a downstream worker, with credit-based
//! back-pressure.
//!
//! The transport is an in-process bounded `crossbeam` ring rather than a
//! socket — a channel's sender and receiver may equally be two threads in
//! this process or the two ends of a real TCP stream fed by a transport
//! adapter; the framing, ordering, and back-pressure guarantees this
//! module provides are the same either way (§4.8, §5).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use uuid::Uuid;

use super::wire::{DataFrame, EventFrame, EventKind};
use crate::error::{Result, RuntimeError};
use crate::stop_token::StopToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub enum WireMessage {
    Data(DataFrame),
    Event(EventFrame),
}

impl WireMessage {
    fn seq(&self) -> u64 {
        match self {
            WireMessage::Data(f) => f.seq,
            WireMessage::Event(f) => f.seq,
        }
    }
}

/// Owned exclusively by its sending worker thread (§4.8: "cross-thread
/// sends are disallowed" — enforced here by `FramedSender` not being
/// `Sync`, only `Send`, so it cannot be shared behind a `&` reference
/// across threads, only moved to a single owner).
pub struct FramedSender {
    channel_id: Uuid,
    tx: Sender<WireMessage>,
    next_seq: AtomicU64,
}

impl FramedSender {
    /// Blocks on local allocation back-pressure (the bounded ring standing
    /// in for the local buffer pool) rather than ever failing the send.
    pub fn send_data(&self, stop: &StopToken, mut frame: DataFrame) -> Result<bool> {
        frame.seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let mut message = WireMessage::Data(frame);
        loop {
            match self.tx.try_send(message) {
                Ok(()) => return Ok(true),
                Err(TrySendError::Full(back)) => {
                    message = back;
                    if stop.is_stopped() {
                        return Ok(false);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(RuntimeError::ChannelLost(format!(
                        "channel {} disconnected",
                        self.channel_id
                    )))
                }
            }
        }
    }

    pub fn send_event(&self, mut frame: EventFrame) -> Result<()> {
        frame.seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(WireMessage::Event(frame))
            .map_err(|_| RuntimeError::ChannelLost(format!("channel {} disconnected", self.channel_id)))
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }
}

/// Re-orders frames that arrive out of sequence, only ever yielding them
/// to the consumer in strict `seq` order (§4.8: "the consumer refuses
/// out-of-order seq and waits").
pub struct FramedReceiver {
    channel_id: Uuid,
    rx: Receiver<WireMessage>,
    next_expected_seq: AtomicU64,
    reorder_buffer: Mutex<BTreeMap<u64, WireMessage>>,
    credit: AtomicUsize,
    /// Count of distinct `EndOfStream` frames popped so far, and the
    /// sending-thread count the last one of them carried. A channel isn't
    /// actually drained until every sending thread's EoS has been observed
    /// (§4.8), not just the first one to arrive.
    eos_observed: AtomicUsize,
    eos_required: AtomicUsize,
}

impl FramedReceiver {
    fn pop_ready(&self) -> Option<WireMessage> {
        let mut buffer = self.reorder_buffer.lock();
        let expected = self.next_expected_seq.load(Ordering::Acquire);
        if buffer.contains_key(&expected) {
            let message = buffer.remove(&expected).unwrap();
            self.next_expected_seq.store(expected + 1, Ordering::Release);
            self.credit.fetch_add(1, Ordering::AcqRel);
            drop(buffer);
            if let WireMessage::Event(frame) = &message {
                if frame.kind == EventKind::EndOfStream {
                    self.eos_observed.fetch_add(1, Ordering::AcqRel);
                    self.eos_required.store(frame.num_sending_threads as usize, Ordering::Release);
                }
            }
            return Some(message);
        }
        None
    }

    fn ingest(&self, message: WireMessage) {
        let mut buffer = self.reorder_buffer.lock();
        buffer.insert(message.seq(), message);
    }

    /// Blocks until the next in-order frame is ready or `stop` is
    /// tripped.
    pub fn recv_blocking(&self, stop: &StopToken) -> Option<WireMessage> {
        loop {
            if let Some(m) = self.pop_ready() {
                return Some(m);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(message) => self.ingest(message),
                Err(_) => {
                    if stop.is_stopped() {
                        return self.pop_ready();
                    }
                }
            }
        }
    }

    /// Drains any already-ingested, newly-ready frames without blocking on
    /// the transport.
    pub fn recv_non_blocking(&self) -> Option<WireMessage> {
        if let Some(m) = self.pop_ready() {
            return Some(m);
        }
        match self.rx.try_recv() {
            Ok(message) => {
                self.ingest(message);
                self.pop_ready()
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Local pool credit remaining; exhaustion is the signal a sender's
    /// `send_data` should treat as back-pressure in a transport that
    /// fronts a real socket.
    pub fn available_credit(&self) -> usize {
        self.credit.load(Ordering::Acquire)
    }

    /// True once at least one `EndOfStream` frame has been observed and
    /// the number observed has reached the sending-thread count it
    /// carried. A channel with several concurrent producer threads needs
    /// one EoS per thread before it's actually done; reacting to the
    /// first one would drop whatever the remaining threads still send.
    pub fn is_eos_complete(&self) -> bool {
        let required = self.eos_required.load(Ordering::Acquire);
        required > 0 && self.eos_observed.load(Ordering::Acquire) >= required
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }
}

/// Creates one end-to-end ordered channel. `capacity` bounds both the
/// transport ring and the initial credit granted to the sender.
pub fn framed_channel(channel_id: Uuid, capacity: usize) -> (FramedSender, FramedReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let sender = FramedSender {
        channel_id,
        tx,
        next_seq: AtomicU64::new(0),
    };
    let receiver = FramedReceiver {
        channel_id,
        rx,
        next_expected_seq: AtomicU64::new(0),
        reorder_buffer: Mutex::new(BTreeMap::new()),
        credit: AtomicUsize::new(capacity),
        eos_observed: AtomicUsize::new(0),
        eos_required: AtomicUsize::new(0),
    };
    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::wire::ChannelType;
    use bytes::Bytes;

    fn data_frame(seq_log: u64) -> DataFrame {
        DataFrame {
            channel_type: ChannelType::Data,
            channel_id: Uuid::nil(),
            seq: 0,
            number_of_tuples: 1,
            origin_id: 1,
            watermark_ts: 0,
            sequence_number_log: seq_log,
            chunk_number: 1,
            last_chunk: true,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn out_of_order_arrivals_are_delivered_in_order() {
        let (sender, receiver) = framed_channel(Uuid::nil(), 8);
        let stop = StopToken::new();
        sender.send_data(&stop, data_frame(3)).unwrap();
        sender.send_data(&stop, data_frame(1)).unwrap();
        sender.send_data(&stop, data_frame(2)).unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            match receiver.recv_blocking(&stop).unwrap() {
                WireMessage::Data(f) => order.push(f.sequence_number_log),
                WireMessage::Event(_) => panic!("unexpected event frame"),
            }
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    fn eos_frame(num_sending_threads: u16) -> EventFrame {
        EventFrame {
            kind: EventKind::EndOfStream,
            channel_id: Uuid::nil(),
            seq: 0,
            termination_type: crate::network::wire::TerminationType::Graceful,
            num_sending_threads,
            reconfiguration_events: Vec::new(),
        }
    }

    #[test]
    fn eos_completion_waits_for_every_sending_thread() {
        let (sender, receiver) = framed_channel(Uuid::nil(), 8);
        let stop = StopToken::new();
        sender.send_event(eos_frame(2)).unwrap();
        assert!(receiver.recv_blocking(&stop).is_some());
        assert!(!receiver.is_eos_complete(), "only one of two threads has reported EoS");

        sender.send_event(eos_frame(2)).unwrap();
        assert!(receiver.recv_blocking(&stop).is_some());
        assert!(receiver.is_eos_complete());
    }

    #[test]
    fn non_blocking_recv_reports_nothing_until_gap_fills() {
        let (sender, receiver) = framed_channel(Uuid::nil(), 8);
        let stop = StopToken::new();
        sender.send_data(&stop, data_frame(2)).unwrap();
        assert!(receiver.recv_non_blocking().is_none());
        sender.send_data(&stop, data_frame(1)).unwrap();
        assert!(receiver.recv_non_blocking().is_some());
        assert!(receiver.recv_non_blocking().is_some());
    }
}
