//! C8 — Network Channel (§4.8): wire framing plus the ordered, credit-
//! backed in-process transport.

pub mod channel;
pub mod wire;

pub use channel::{framed_channel, FramedReceiver, FramedSender, WireMessage};
pub use wire::{ChannelType, DataFrame, EventFrame, EventKind, MetadataType, ReconfigurationEvent, TerminationType};
