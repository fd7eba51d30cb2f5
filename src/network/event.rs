//! Events delivered by a deployment channel and the replies they produce.

use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

/// One discrete event from the deployment link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployEvent {
    /// The radio stack finished initializing.
    Initialized,
    Connected,
    Disconnected { reason: u8 },
    /// A program for slot `slot`; only the first `length` bytes count.
    ProgramReceived {
        slot: u8,
        bytes: Bytes,
        length: usize,
    },
    StatusRequested,
    ReloadRequested,
    RebootRequested,
    Unknown(u8),
}

impl fmt::Display for DeployEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployEvent::Initialized => write!(f, "initialized"),
            DeployEvent::Connected => write!(f, "connected"),
            DeployEvent::Disconnected { reason } => write!(f, "disconnected ({reason:#04x})"),
            DeployEvent::ProgramReceived { slot, length, .. } => {
                write!(f, "program for slot index {slot} ({length} bytes)")
            }
            DeployEvent::StatusRequested => write!(f, "status request"),
            DeployEvent::ReloadRequested => write!(f, "reload request"),
            DeployEvent::RebootRequested => write!(f, "reboot request"),
            DeployEvent::Unknown(code) => write!(f, "unknown event {code:#04x}"),
        }
    }
}

/// Outcome of handling one event, returned to the peer when it asked for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReply {
    Ack,
    Stored { written: usize },
    Status { mtu: u16 },
    Rejected(String),
}

impl EventReply {
    pub fn is_rejected(&self) -> bool {
        matches!(self, EventReply::Rejected(_))
    }
}

impl fmt::Display for EventReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventReply::Ack => write!(f, "ok"),
            EventReply::Stored { written } => write!(f, "stored {written} bytes"),
            EventReply::Status { mtu } => write!(f, "MTU {mtu}"),
            EventReply::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// An event queued for the dispatcher, with an optional reply path.
#[derive(Debug)]
pub struct Envelope {
    pub event: DeployEvent,
    pub reply: Option<oneshot::Sender<EventReply>>,
}

impl Envelope {
    /// Fire-and-forget event.
    pub fn notify(event: DeployEvent) -> Self {
        Self { event, reply: None }
    }

    /// Event whose reply is delivered on the returned receiver.
    pub fn request(event: DeployEvent) -> (Self, oneshot::Receiver<EventReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                reply: Some(tx),
            },
            rx,
        )
    }
}
