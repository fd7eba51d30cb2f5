//! Wire framing for the TCP simulation of the deployment link.
//!
//! Every frame is `[code: u8][len: u32 LE][payload: len bytes]`.
//!
//! | Code | Direction | Payload |
//! |---|---|---|
//! | `0x00` | peer → device | initialized |
//! | `0x01` | peer → device | connected |
//! | `0x02` | peer → device | disconnected, `[reason: u8]` |
//! | `0x10` | peer → device | `[slot: u8][length: u16 LE][bytes]` |
//! | `0x11` | peer → device | status request |
//! | `0x12` | peer → device | reload request |
//! | `0x13` | peer → device | reboot request |
//! | `0x20` | device → peer | UTF-8 status text |
//! | `0x80 \| status` | device → peer | reply, see [`encode_reply`] |
//!
//! Unrecognized request codes decode to [`DeployEvent::Unknown`].

use crate::network::event::{DeployEvent, EventReply};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024;

const HEADER_LEN: usize = 5;

pub const INITIALIZED: u8 = 0x00;
pub const CONNECTED: u8 = 0x01;
pub const DISCONNECTED: u8 = 0x02;
pub const PROGRAM: u8 = 0x10;
pub const STATUS: u8 = 0x11;
pub const RELOAD: u8 = 0x12;
pub const REBOOT: u8 = 0x13;
pub const TEXT: u8 = 0x20;
pub const REPLY: u8 = 0x80;

const REPLY_ACK: u8 = 0;
const REPLY_STORED: u8 = 1;
const REPLY_STATUS: u8 = 2;
const REPLY_REJECTED: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("frame {code:#04x} needs at least {needed} payload bytes, got {got}")]
    Truncated { code: u8, needed: usize, got: usize },

    #[error("frame {0:#04x} is not a reply")]
    NotAReply(u8),

    #[error("unknown reply status {0}")]
    UnknownStatus(u8),

    #[error("text payload is not valid UTF-8")]
    InvalidText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn empty(code: u8) -> Self {
        Self::new(code, Bytes::new())
    }

    pub fn is_reply(&self) -> bool {
        self.code & REPLY != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.code);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Reads one frame, rejecting payloads above [`MAX_FRAME_PAYLOAD`].
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Frame::new(header[0], payload))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }

    /// Payload as text, for [`TEXT`] frames and rejection reasons.
    pub fn text(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.payload).map_err(|_| FrameError::InvalidText)
    }
}

pub fn text_frame(text: &str) -> Frame {
    Frame::new(TEXT, Bytes::copy_from_slice(text.as_bytes()))
}

pub fn encode_event(event: &DeployEvent) -> Frame {
    match event {
        DeployEvent::Initialized => Frame::empty(INITIALIZED),
        DeployEvent::Connected => Frame::empty(CONNECTED),
        DeployEvent::Disconnected { reason } => Frame::new(DISCONNECTED, vec![*reason]),
        DeployEvent::ProgramReceived {
            slot,
            bytes,
            length,
        } => {
            let mut buf = BytesMut::with_capacity(3 + bytes.len());
            buf.put_u8(*slot);
            buf.put_u16_le(u16::try_from(*length).unwrap_or(u16::MAX));
            buf.put_slice(bytes);
            Frame::new(PROGRAM, buf.freeze())
        }
        DeployEvent::StatusRequested => Frame::empty(STATUS),
        DeployEvent::ReloadRequested => Frame::empty(RELOAD),
        DeployEvent::RebootRequested => Frame::empty(REBOOT),
        DeployEvent::Unknown(code) => Frame::empty(*code),
    }
}

pub fn decode_event(frame: &Frame) -> Result<DeployEvent, FrameError> {
    let payload = &frame.payload;
    Ok(match frame.code {
        INITIALIZED => DeployEvent::Initialized,
        CONNECTED => DeployEvent::Connected,
        DISCONNECTED => DeployEvent::Disconnected {
            reason: payload.first().copied().unwrap_or(0),
        },
        PROGRAM => {
            if payload.len() < 3 {
                return Err(FrameError::Truncated {
                    code: PROGRAM,
                    needed: 3,
                    got: payload.len(),
                });
            }
            DeployEvent::ProgramReceived {
                slot: payload[0],
                length: u16::from_le_bytes([payload[1], payload[2]]) as usize,
                bytes: payload.slice(3..),
            }
        }
        STATUS => DeployEvent::StatusRequested,
        RELOAD => DeployEvent::ReloadRequested,
        REBOOT => DeployEvent::RebootRequested,
        other => DeployEvent::Unknown(other),
    })
}

pub fn encode_reply(reply: &EventReply) -> Frame {
    match reply {
        EventReply::Ack => Frame::empty(REPLY | REPLY_ACK),
        EventReply::Stored { written } => Frame::new(
            REPLY | REPLY_STORED,
            (*written as u32).to_le_bytes().to_vec(),
        ),
        EventReply::Status { mtu } => Frame::new(REPLY | REPLY_STATUS, mtu.to_le_bytes().to_vec()),
        EventReply::Rejected(reason) => Frame::new(
            REPLY | REPLY_REJECTED,
            Bytes::copy_from_slice(reason.as_bytes()),
        ),
    }
}

pub fn decode_reply(frame: &Frame) -> Result<EventReply, FrameError> {
    if !frame.is_reply() {
        return Err(FrameError::NotAReply(frame.code));
    }
    let payload = &frame.payload;
    let truncated = |needed: usize| FrameError::Truncated {
        code: frame.code,
        needed,
        got: payload.len(),
    };

    match frame.code & !REPLY {
        REPLY_ACK => Ok(EventReply::Ack),
        REPLY_STORED => {
            let bytes: [u8; 4] = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| truncated(4))?;
            Ok(EventReply::Stored {
                written: u32::from_le_bytes(bytes) as usize,
            })
        }
        REPLY_STATUS => {
            let bytes: [u8; 2] = payload
                .get(..2)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| truncated(2))?;
            Ok(EventReply::Status {
                mtu: u16::from_le_bytes(bytes),
            })
        }
        REPLY_REJECTED => Ok(EventReply::Rejected(frame.text()?.to_string())),
        other => Err(FrameError::UnknownStatus(other)),
    }
}
