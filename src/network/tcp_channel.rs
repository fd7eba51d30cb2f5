//! TCP deployment channel: one peer at a time, framed as in [`frame`](super::frame).
//!
//! # Connection model
//!
//! - Connections are only accepted while advertising and while no other peer
//!   is connected; anything else is closed immediately.
//! - Accepting a peer queues a `Connected` event; the read loop ending (EOF,
//!   I/O error or [`disconnect`](DeploymentChannel::disconnect)) queues a
//!   `Disconnected` event.
//! - Every request frame is answered with exactly one reply frame, written once
//!   the dispatcher has handled the event. Status texts share the same writer.

use crate::network::event::{DeployEvent, Envelope, EventReply};
use crate::network::frame::{self, Frame, FrameError};
use crate::network::transport::{BoxFuture, DeploymentChannel, TransportError, take_receiver};
use crate::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::sync::{Mutex, Notify};

/// Reason reported when the peer closed the connection.
pub const REMOTE_USER_TERMINATED: u8 = 0x13;
/// Reason reported when the device dropped the connection.
pub const LOCAL_HOST_TERMINATED: u8 = 0x16;

/// The connected peer's write half and the signal that ends its read loop.
struct Peer {
    addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    kick: Arc<Notify>,
}

pub struct TcpChannel {
    listen_address: SocketAddr,
    mtu: u16,
    tx: Sender<Envelope>,
    rx: Arc<Mutex<Option<Receiver<Envelope>>>>,
    peer: Mutex<Option<Peer>>,
    advertising: AtomicBool,
}

impl TcpChannel {
    /// Binds `addr` and starts accepting peers in the background.
    ///
    /// Use port 0 to let the OS pick; [`local_addr`](Self::local_addr) returns
    /// the bound address.
    pub async fn start(addr: SocketAddr, mtu: u16, capacity: usize) -> io::Result<Arc<TcpChannel>> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, rx) = channel(capacity);

        let transport = Arc::new(TcpChannel {
            listen_address: listener.local_addr()?,
            mtu,
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            peer: Mutex::new(None),
            advertising: AtomicBool::new(false),
        });
        info!("Deployment channel listening on {}", transport.listen_address);

        let clone = transport.clone();
        tokio::spawn(async move {
            clone.accept_loop(listener).await;
        });
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::Acquire)
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.lock().await.as_ref().map(|peer| peer.addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let self_clone = self.clone();
                    tokio::spawn(async move {
                        self_clone.handle_inbound(stream, addr).await;
                    });
                }
                Err(e) => warn!("Accepting a deployment peer failed: {e}"),
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let kick = Arc::new(Notify::new());

        {
            let mut peer = self.peer.lock().await;
            if peer.is_some() || !self.is_advertising() {
                debug!("Refusing deployment peer {addr}");
                return;
            }
            *peer = Some(Peer {
                addr,
                writer: writer.clone(),
                kick: kick.clone(),
            });
        }
        info!("Deployment peer {addr} connected");

        if self.tx.send(Envelope::notify(DeployEvent::Connected)).await.is_err() {
            return;
        }

        let reason = tokio::select! {
            _ = Self::read_loop(reader, writer, self.tx.clone()) => REMOTE_USER_TERMINATED,
            _ = kick.notified() => LOCAL_HOST_TERMINATED,
        };

        self.peer.lock().await.take();
        info!("Deployment peer {addr} disconnected ({reason:#04x})");
        let _ = self
            .tx
            .send(Envelope::notify(DeployEvent::Disconnected { reason }))
            .await;
    }

    /// Forwards request frames as events and writes back each reply.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        tx: Sender<Envelope>,
    ) {
        loop {
            let request = match Frame::read_from(&mut reader).await {
                Ok(request) => request,
                Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    warn!("Dropping deployment peer: {e}");
                    return;
                }
            };

            let event = match frame::decode_event(&request) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Malformed deployment frame: {e}");
                    let reply = frame::encode_reply(&EventReply::Rejected(e.to_string()));
                    if Self::send_framed(&writer, &reply).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let (envelope, reply) = Envelope::request(event);
            if tx.send(envelope).await.is_err() {
                return;
            }
            let Ok(reply) = reply.await else {
                return;
            };
            if Self::send_framed(&writer, &frame::encode_reply(&reply))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn send_framed(writer: &Mutex<OwnedWriteHalf>, frame: &Frame) -> io::Result<()> {
        let mut guard = writer.lock().await;
        frame.write_to(&mut *guard).await
    }
}

impl DeploymentChannel for TcpChannel {
    fn consume(self: &Arc<Self>) -> BoxFuture<'static, Result<Receiver<Envelope>, TransportError>> {
        take_receiver(self.rx.clone())
    }

    fn negotiated_mtu(self: &Arc<Self>) -> u16 {
        self.mtu
    }

    fn send_text(self: &Arc<Self>, text: String) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            let writer = match this.peer.lock().await.as_ref() {
                Some(peer) => peer.writer.clone(),
                None => return Err(TransportError::NotConnected),
            };
            Self::send_framed(&writer, &frame::text_frame(&text))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn advertise(self: &Arc<Self>, name: String) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.advertising.swap(true, Ordering::AcqRel) {
                info!("Advertising as {name} on {}", this.listen_address);
            }
            Ok(())
        })
    }

    fn stop_advertising(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            this.advertising.store(false, Ordering::Release);
            Ok(())
        })
    }

    fn disconnect(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            match this.peer.lock().await.as_ref() {
                Some(peer) => {
                    peer.kick.notify_one();
                    Ok(())
                }
                None => Err(TransportError::NotConnected),
            }
        })
    }
}
