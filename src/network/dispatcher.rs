//! Deployment event dispatcher.
//!
//! The single consumer of a channel's event queue. Events are handled one at a
//! time in arrival order; storage writes, restarts and reboots block, so they
//! run on the blocking pool while the loop awaits them.

use crate::core::reboot::{self, RebootPlatform, RebootPolicy};
use crate::core::supervisor::SupervisorHandle;
use crate::network::event::{DeployEvent, Envelope, EventReply};
use crate::network::link::{ConnectionState, LinkState};
use crate::network::transport::{DeploymentChannel, TransportError};
use crate::storage::bytecode_slots::{Slot, SlotManager};
use crate::{debug, error, info, warn};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::task;

pub struct Dispatcher<C: DeploymentChannel> {
    channel: Arc<C>,
    slots: SlotManager,
    supervisor: SupervisorHandle,
    link: LinkState,
    device_name: String,
    platform: Arc<dyn RebootPlatform>,
    reboot_policy: RebootPolicy,
}

impl<C: DeploymentChannel> Dispatcher<C> {
    pub fn new(
        channel: Arc<C>,
        slots: SlotManager,
        supervisor: SupervisorHandle,
        link: LinkState,
        device_name: String,
        platform: Arc<dyn RebootPlatform>,
    ) -> Self {
        Self {
            channel,
            slots,
            supervisor,
            link,
            device_name,
            platform,
            reboot_policy: RebootPolicy::default(),
        }
    }

    pub fn with_reboot_policy(mut self, policy: RebootPolicy) -> Self {
        self.reboot_policy = policy;
        self
    }

    /// Handles events until `shutdown` resolves or the queue closes.
    ///
    /// Returns the number of events handled.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<usize, TransportError> {
        let mut rx = self.channel.consume().await?;
        tokio::pin!(shutdown);
        let mut handled = 0;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Dispatcher stopping");
                    break;
                }
                envelope = rx.recv() => {
                    let Some(Envelope { event, reply }) = envelope else {
                        info!("Deployment event queue closed");
                        break;
                    };
                    let outcome = self.handle(event).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                    handled += 1;
                }
            }
        }

        Ok(handled)
    }

    /// Applies one event and returns the reply for the peer.
    pub async fn handle(&self, event: DeployEvent) -> EventReply {
        debug!("Deployment event: {event}");
        match event {
            DeployEvent::Initialized => {
                info!("Deployment channel initialized");
                EventReply::Ack
            }
            DeployEvent::Connected => {
                self.link.set(ConnectionState::Connected);
                if let Err(e) = self.channel.stop_advertising().await {
                    warn!("Stopping advertising failed: {e}");
                }
                EventReply::Ack
            }
            DeployEvent::Disconnected { reason } => {
                info!("Peer disconnected (reason {reason:#04x}), advertising again");
                self.link.set(ConnectionState::Advertising);
                if let Err(e) = self.channel.advertise(self.device_name.clone()).await {
                    warn!("Restarting advertising failed: {e}");
                }
                EventReply::Ack
            }
            DeployEvent::ProgramReceived {
                slot,
                bytes,
                length,
            } => self.store_program(slot, bytes, length).await,
            DeployEvent::StatusRequested => EventReply::Status {
                mtu: self.channel.negotiated_mtu(),
            },
            DeployEvent::ReloadRequested => self.reload().await,
            DeployEvent::RebootRequested => self.reboot().await,
            DeployEvent::Unknown(code) => {
                warn!("Ignoring unknown deployment event {code:#04x}");
                EventReply::Ack
            }
        }
    }

    async fn store_program(&self, index: u8, bytes: Bytes, length: usize) -> EventReply {
        let slot = match Slot::from_index(index) {
            Ok(slot) => slot,
            Err(e) => return reject(format!("Program rejected: {e}")),
        };
        if length > bytes.len() {
            return reject(format!(
                "Program for {slot} rejected: length {length} exceeds the {} bytes received",
                bytes.len()
            ));
        }

        let slots = self.slots.clone();
        let result = task::spawn_blocking(move || slots.store(slot, &bytes[..length])).await;
        match result {
            Ok(Ok(written)) => EventReply::Stored { written },
            Ok(Err(e)) => reject(format!("Storing {length} bytes in {slot} failed: {e}")),
            Err(e) => reject(format!("Storing {length} bytes in {slot} failed: {e}")),
        }
    }

    async fn reload(&self) -> EventReply {
        let supervisor = self.supervisor.clone();
        match task::spawn_blocking(move || supervisor.restart()).await {
            Ok(Ok(deleted)) => {
                info!("Reload requested: VM restarting ({deleted} task(s) stopped)");
                EventReply::Ack
            }
            Ok(Err(e)) => {
                warn!("Reload refused: {e}");
                EventReply::Rejected(e.to_string())
            }
            Err(e) => reject(format!("Reload failed: {e}")),
        }
    }

    async fn reboot(&self) -> EventReply {
        let store = self.slots.store_handle().clone();
        let platform = self.platform.clone();
        let policy = self.reboot_policy.clone();
        match task::spawn_blocking(move || reboot::reboot(&store, platform.as_ref(), &policy)).await {
            Ok(outcome) => {
                warn!(
                    "Reboot did not happen after {} attempt(s) ({} warm request(s), cold forced: {})",
                    outcome.attempts, outcome.warm_requests, outcome.forced_cold
                );
                EventReply::Ack
            }
            Err(e) => reject(format!("Reboot failed: {e}")),
        }
    }
}

fn reject(reason: String) -> EventReply {
    error!("{reason}");
    EventReply::Rejected(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HostEnv;
    use crate::core::reboot::RebootKind;
    use crate::core::supervisor::{SupervisorConfig, VmSupervisor};
    use crate::network::local_channel::LocalChannel;
    use crate::storage::bytecode_slots::ProgramSource;
    use crate::storage::memory_store::MemoryStore;
    use crate::storage::shared::SharedStore;
    use crate::utils::test_utils::utils::{
        RecordingReboot, host_env, program_of_len, slot_manager,
    };
    use std::time::Duration;

    const BOOT: Duration = Duration::from_secs(5);

    struct Fixture {
        channel: Arc<LocalChannel>,
        dispatcher: Dispatcher<LocalChannel>,
        supervisor: VmSupervisor,
        slots: SlotManager,
        host: Arc<HostEnv>,
        platform: Arc<RecordingReboot>,
    }

    fn fixture_with(slots: SlotManager) -> Fixture {
        let host = host_env();
        let supervisor =
            VmSupervisor::init(SupervisorConfig::default(), slots.clone(), host.clone(), None)
                .unwrap();
        supervisor.handle().wait_for_boot(0, BOOT).unwrap();

        let channel = LocalChannel::new(8, 185);
        let platform = Arc::new(RecordingReboot::default());
        let dispatcher = Dispatcher::new(
            channel.clone(),
            slots.clone(),
            supervisor.handle(),
            host.link.clone(),
            "SlotVM_51F1".into(),
            platform.clone(),
        )
        .with_reboot_policy(RebootPolicy {
            attempts: 2,
            lock_timeout: Duration::from_millis(5),
            settle: Duration::from_millis(1),
        });

        Fixture {
            channel,
            dispatcher,
            supervisor,
            slots,
            host,
            platform,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(slot_manager())
    }

    fn program(slot: u8, bytes: Vec<u8>) -> DeployEvent {
        let length = bytes.len();
        DeployEvent::ProgramReceived {
            slot,
            bytes: Bytes::from(bytes),
            length,
        }
    }

    #[tokio::test]
    async fn program_for_slot2_survives_a_reload() {
        let f = fixture();
        let code = program_of_len(120);

        assert_eq!(
            f.dispatcher.handle(program(1, code.clone())).await,
            EventReply::Stored { written: 120 }
        );
        assert_eq!(f.slots.length(Slot::Slot2), Ok(120));

        assert_eq!(f.dispatcher.handle(DeployEvent::ReloadRequested).await, EventReply::Ack);
        let handle = f.supervisor.handle();
        let report = task::spawn_blocking(move || handle.wait_for_boot(1, BOOT))
            .await
            .unwrap()
            .unwrap();
        let slot2 = report.slot(Slot::Slot2).unwrap();
        assert_eq!((slot2.length, slot2.source), (120, ProgramSource::Stored));
        assert_eq!(report.slot(Slot::Slot1).unwrap().source, ProgramSource::FactoryDefault);
    }

    #[tokio::test]
    async fn oversized_program_keeps_the_previous_one() {
        let store = SharedStore::new(MemoryStore::new(4096, 256));
        let f = fixture_with(SlotManager::new(store));
        let previous = program_of_len(200);
        assert_eq!(
            f.dispatcher.handle(program(0, previous.clone())).await,
            EventReply::Stored { written: 200 }
        );

        let reply = f.dispatcher.handle(program(0, program_of_len(257))).await;
        assert!(reply.is_rejected());

        let mut buf = vec![0u8; 4096];
        let (len, source) = f.slots.load_traced(Slot::Slot1, &mut buf);
        assert_eq!(source, ProgramSource::Stored);
        assert_eq!(&buf[..len], &previous[..]);
    }

    #[tokio::test]
    async fn reload_while_disconnected_runs_persisted_programs() {
        let f = fixture();
        f.dispatcher.handle(DeployEvent::Connected).await;
        f.dispatcher.handle(program(0, program_of_len(64))).await;
        f.dispatcher.handle(program(1, program_of_len(96))).await;
        f.dispatcher
            .handle(DeployEvent::Disconnected { reason: 0x13 })
            .await;

        assert_eq!(f.dispatcher.handle(DeployEvent::ReloadRequested).await, EventReply::Ack);
        let handle = f.supervisor.handle();
        let report = task::spawn_blocking(move || handle.wait_for_boot(1, BOOT))
            .await
            .unwrap()
            .unwrap();
        for (slot, len) in [(Slot::Slot1, 64), (Slot::Slot2, 96)] {
            let loaded = report.slot(slot).unwrap();
            assert_eq!((loaded.length, loaded.source), (len, ProgramSource::Stored));
            assert!(loaded.task_created);
        }
    }

    #[tokio::test]
    async fn invalid_slot_and_short_payload_are_rejected() {
        let f = fixture();
        assert!(f.dispatcher.handle(program(2, program_of_len(16))).await.is_rejected());

        let short = DeployEvent::ProgramReceived {
            slot: 0,
            bytes: Bytes::from(program_of_len(16)),
            length: 17,
        };
        assert!(f.dispatcher.handle(short).await.is_rejected());
        assert!(f.slots.length(Slot::Slot1).is_err());
    }

    #[tokio::test]
    async fn declared_length_trims_the_payload() {
        let f = fixture();
        let mut bytes = program_of_len(32);
        bytes.extend_from_slice(&[0xEE; 8]);
        let event = DeployEvent::ProgramReceived {
            slot: 0,
            bytes: Bytes::from(bytes),
            length: 32,
        };
        assert_eq!(f.dispatcher.handle(event).await, EventReply::Stored { written: 32 });
        assert_eq!(f.slots.length(Slot::Slot1), Ok(32));
    }

    #[tokio::test]
    async fn empty_program_changes_nothing() {
        let f = fixture();
        let event = DeployEvent::ProgramReceived {
            slot: 1,
            bytes: Bytes::new(),
            length: 0,
        };
        assert_eq!(f.dispatcher.handle(event).await, EventReply::Stored { written: 0 });
        assert!(f.slots.length(Slot::Slot2).is_err());
    }

    #[tokio::test]
    async fn link_events_drive_advertising() {
        let f = fixture();
        f.channel.advertise("SlotVM_51F1".into()).await.unwrap();

        f.dispatcher.handle(DeployEvent::Connected).await;
        assert_eq!(f.host.link.get(), ConnectionState::Connected);
        assert_eq!(f.channel.advertised_name(), None);

        f.dispatcher
            .handle(DeployEvent::Disconnected { reason: 0x08 })
            .await;
        assert_eq!(f.host.link.get(), ConnectionState::Advertising);
        assert_eq!(f.channel.advertised_name().as_deref(), Some("SlotVM_51F1"));
    }

    #[tokio::test]
    async fn status_reports_the_mtu() {
        let f = fixture();
        assert_eq!(
            f.dispatcher.handle(DeployEvent::StatusRequested).await,
            EventReply::Status { mtu: 185 }
        );
    }

    #[tokio::test]
    async fn reload_is_rejected_while_frozen() {
        let f = fixture();
        let frozen = f.supervisor.handle().freeze(Duration::from_millis(100)).unwrap();
        assert!(f.dispatcher.handle(DeployEvent::ReloadRequested).await.is_rejected());
        drop(frozen);
        assert_eq!(f.dispatcher.handle(DeployEvent::ReloadRequested).await, EventReply::Ack);
    }

    #[tokio::test]
    async fn reboot_runs_the_reboot_procedure() {
        let f = fixture();
        assert_eq!(f.dispatcher.handle(DeployEvent::RebootRequested).await, EventReply::Ack);
        assert_eq!(
            f.platform.requests(),
            vec![RebootKind::Warm, RebootKind::Warm, RebootKind::Cold]
        );
    }

    #[tokio::test]
    async fn run_loop_survives_unknown_events() {
        let f = fixture();
        let channel = f.channel.clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            let unknown = channel.request(DeployEvent::Unknown(0x7F)).await.unwrap();
            let status = channel.request(DeployEvent::StatusRequested).await.unwrap();
            let _ = stop_tx.send(());
            (unknown, status)
        });

        let handled = f
            .dispatcher
            .run(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        let (unknown, status) = client.await.unwrap();
        assert_eq!(unknown, EventReply::Ack);
        assert_eq!(status, EventReply::Status { mtu: 185 });
        assert_eq!(handled, 2);
    }
}
