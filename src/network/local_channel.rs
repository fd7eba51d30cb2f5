//! In-memory deployment channel for tests and single-process simulations.
//!
//! Events are injected with [`LocalChannel::request`] or
//! [`LocalChannel::notify`]; outbound texts and the advertising state are
//! recorded for inspection.

use crate::network::event::{DeployEvent, Envelope, EventReply};
use crate::network::transport::{BoxFuture, DeploymentChannel, TransportError, take_receiver};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Reason code reported when the device drops the link itself.
pub const LOCAL_HOST_TERMINATED: u8 = 0x16;

pub struct LocalChannel {
    tx: Sender<Envelope>,
    rx: Arc<Mutex<Option<Receiver<Envelope>>>>,
    mtu: AtomicU16,
    connected: AtomicBool,
    advertised: SyncMutex<Option<String>>,
    texts: SyncMutex<Vec<String>>,
}

impl LocalChannel {
    pub fn new(capacity: usize, mtu: u16) -> Arc<LocalChannel> {
        let (tx, rx) = channel(capacity);

        Arc::new(LocalChannel {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            mtu: AtomicU16::new(mtu),
            connected: AtomicBool::new(false),
            advertised: SyncMutex::new(None),
            texts: SyncMutex::new(Vec::new()),
        })
    }

    /// Queues `event` and waits for the dispatcher's reply.
    pub async fn request(&self, event: DeployEvent) -> Result<EventReply, TransportError> {
        self.track(&event);
        let (envelope, reply) = Envelope::request(event);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransportError::QueueClosed)?;
        reply.await.map_err(|_| TransportError::NoReply)
    }

    /// Queues `event` without waiting for it to be handled.
    pub async fn notify(&self, event: DeployEvent) -> Result<(), TransportError> {
        self.track(&event);
        self.tx
            .send(Envelope::notify(event))
            .await
            .map_err(|_| TransportError::QueueClosed)
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Name currently advertised, `None` when not advertising.
    pub fn advertised_name(&self) -> Option<String> {
        self.advertised.lock().clone()
    }

    /// Texts sent to the peer so far.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    fn track(&self, event: &DeployEvent) {
        match event {
            DeployEvent::Connected => self.connected.store(true, Ordering::Release),
            DeployEvent::Disconnected { .. } => self.connected.store(false, Ordering::Release),
            _ => {}
        }
    }
}

impl DeploymentChannel for LocalChannel {
    fn consume(self: &Arc<Self>) -> BoxFuture<'static, Result<Receiver<Envelope>, TransportError>> {
        take_receiver(self.rx.clone())
    }

    fn negotiated_mtu(self: &Arc<Self>) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    fn send_text(self: &Arc<Self>, text: String) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.is_connected() {
                return Err(TransportError::NotConnected);
            }
            this.texts.lock().push(text);
            Ok(())
        })
    }

    fn advertise(self: &Arc<Self>, name: String) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            *this.advertised.lock() = Some(name);
            Ok(())
        })
    }

    fn stop_advertising(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            this.advertised.lock().take();
            Ok(())
        })
    }

    fn disconnect(self: &Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.connected.swap(false, Ordering::AcqRel) {
                return Err(TransportError::NotConnected);
            }
            this.tx
                .send(Envelope::notify(DeployEvent::Disconnected {
                    reason: LOCAL_HOST_TERMINATED,
                }))
                .await
                .map_err(|_| TransportError::QueueClosed)
        })
    }
}
