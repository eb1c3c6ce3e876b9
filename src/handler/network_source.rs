//! Network source handler: owns a receive queue bound to a `(channelId,
//! localPort)` pair (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use super::TerminationType;
use crate::error::Result;
use crate::network::channel::FramedReceiver;

pub struct NetworkSourceHandler {
    channel_id: Uuid,
    local_port: u16,
    receiver: FramedReceiver,
    started: AtomicBool,
}

impl NetworkSourceHandler {
    pub fn new(channel_id: Uuid, local_port: u16, receiver: FramedReceiver) -> Self {
        Self {
            channel_id,
            local_port,
            receiver,
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self, _termination: TerminationType) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn receiver(&self) -> &FramedReceiver {
        &self.receiver
    }

    /// True once every sending thread feeding this channel has reported
    /// `EndOfStream` — the gate a source-side driving loop should check
    /// before treating the channel as exhausted, rather than stopping on
    /// the first EoS frame it happens to see.
    pub fn is_terminated(&self) -> bool {
        self.receiver.is_eos_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::framed_channel;
    use crate::network::wire::{EventFrame, EventKind, TerminationType as WireTermination};

    #[test]
    fn not_terminated_until_every_sending_thread_reports_eos() {
        let (sender, receiver) = framed_channel(Uuid::nil(), 8);
        let handler = NetworkSourceHandler::new(Uuid::nil(), 9000, receiver);
        let stop = crate::stop_token::StopToken::new();

        let frame = |n: u16| EventFrame {
            kind: EventKind::EndOfStream,
            channel_id: Uuid::nil(),
            seq: 0,
            termination_type: WireTermination::Graceful,
            num_sending_threads: n,
            reconfiguration_events: Vec::new(),
        };

        sender.send_event(frame(2)).unwrap();
        handler.receiver().recv_blocking(&stop);
        assert!(!handler.is_terminated());

        sender.send_event(frame(2)).unwrap();
        handler.receiver().recv_blocking(&stop);
        assert!(handler.is_terminated());
    }
}
