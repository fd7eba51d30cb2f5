//! Device wiring.
//!
//! [`Device::boot`] derives the advertised name, prints the boot banner and
//! starts the VM supervisor; [`Device::run`] then serves the deployment
//! channel until shutdown and stops the VM.

use crate::api::HostEnv;
use crate::config::{DEVICE_NAME_SIZE, DeviceConfig, STATUS_QUEUE_CAPACITY};
use crate::core::identity::{device_name, format_id};
use crate::core::reboot::RebootPlatform;
use crate::core::restart_lock::RestartLock;
use crate::core::supervisor::{
    SupervisorConfig, SupervisorError, SupervisorHandle, SupervisorState, VmSupervisor,
};
use crate::drivers::gpio::GpioBank;
use crate::network::dispatcher::Dispatcher;
use crate::network::link::{ConnectionState, LinkState};
use crate::network::transport::{DeploymentChannel, TransportError};
use crate::storage::bytecode_slots::{SlotError, SlotManager};
use crate::storage::shared::SharedStore;
use crate::{debug, info, warn};
use slotvm_derive::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("VM supervisor failed: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("deployment channel failed: {0}")]
    Channel(#[from] TransportError),

    #[error("slot storage failed: {0}")]
    Storage(#[from] SlotError),

    #[error("VM shutdown did not complete: {0}")]
    Shutdown(String),
}

pub struct Device<C: DeploymentChannel> {
    name: String,
    device_id: [u8; 8],
    channel: Arc<C>,
    slots: SlotManager,
    host: Arc<HostEnv>,
    supervisor: VmSupervisor,
    status: Receiver<String>,
    platform: Arc<dyn RebootPlatform>,
}

impl<C: DeploymentChannel> Device<C> {
    /// Brings the device up: identity, banner, storage and a running VM.
    pub fn boot(
        config: &DeviceConfig,
        store: SharedStore,
        channel: Arc<C>,
        platform: Arc<dyn RebootPlatform>,
    ) -> Result<Self, DeviceError> {
        let name = device_name(&config.base_name, &config.device_id, DEVICE_NAME_SIZE);
        banner(&name, &config.device_id, &store);

        let slots = SlotManager::new(store);
        let host = Arc::new(HostEnv::new(
            Arc::new(GpioBank::new()),
            LinkState::new(),
            RestartLock::new(),
        ));
        let (status_tx, status) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        let supervisor = VmSupervisor::init(
            SupervisorConfig {
                heap_size: config.heap_size,
                idle_backoff: config.idle_backoff,
                ..SupervisorConfig::default()
            },
            slots.clone(),
            host.clone(),
            Some(status_tx),
        )?;

        Ok(Self {
            name,
            device_id: config.device_id,
            channel,
            slots,
            host,
            supervisor,
            status,
            platform,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> [u8; 8] {
        self.device_id
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn host(&self) -> &Arc<HostEnv> {
        &self.host
    }

    pub fn supervisor(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    /// Erases both slots; the defaults run after the next restart.
    pub fn factory_reset(&self) -> Result<(), DeviceError> {
        self.slots.factory_reset()?;
        Ok(())
    }

    /// Advertises, serves deployment events until `shutdown` resolves, then
    /// drops the peer and stops the VM.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<SupervisorState, DeviceError> {
        let Device {
            name,
            channel,
            slots,
            host,
            supervisor,
            mut status,
            platform,
            ..
        } = self;

        if let Err(e) = channel.advertise(name.clone()).await {
            warn!("Advertising failed: {e}");
        }
        host.link.set(ConnectionState::Advertising);

        let forward_to = channel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(text) = status.recv().await {
                if let Err(e) = forward_to.send_text(text).await {
                    debug!("Status text not delivered: {e}");
                }
            }
        });

        let dispatcher = Dispatcher::new(
            channel.clone(),
            slots,
            supervisor.handle(),
            host.link.clone(),
            name.clone(),
            platform,
        );
        let served = dispatcher.run(shutdown).await;

        info!("{name} shutting down");
        if let Err(e) = channel.send_text("Disconnecting...".into()).await {
            debug!("No peer to notify: {e}");
        }
        if channel.disconnect().await.is_ok() {
            debug!("Deployment peer dropped");
        }
        let _ = channel.stop_advertising().await;
        host.link.set(ConnectionState::Disconnected);

        let state = task::spawn_blocking(move || supervisor.shutdown())
            .await
            .map_err(|e| DeviceError::Shutdown(e.to_string()))?;
        forwarder.abort();

        let handled = served?;
        info!("{name} stopped after {handled} deployment event(s)");
        Ok(state)
    }
}

fn banner(name: &str, id: &[u8; 8], store: &SharedStore) {
    info!("Device {name} (id {})", format_id(id));
    match (store.free_space(), store.max_entry_size()) {
        (Ok(free), Ok(max)) => info!("Slot store: {free} bytes free, {max} bytes max per program"),
        (Err(e), _) | (_, Err(e)) => warn!("Slot store unavailable: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::event::{DeployEvent, EventReply};
    use crate::network::local_channel::LocalChannel;
    use crate::storage::bytecode_slots::{ProgramSource, Slot};
    use crate::storage::memory_store::MemoryStore;
    use crate::utils::test_utils::utils::{RecordingReboot, program_of_len};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    fn boot(channel: Arc<LocalChannel>) -> Device<LocalChannel> {
        let config = DeviceConfig {
            device_id: [0; 8],
            ..DeviceConfig::default()
        };
        let store = SharedStore::new(MemoryStore::new(8192, 4096));
        Device::boot(&config, store, channel, Arc::new(RecordingReboot::default())).unwrap()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[test]
    fn boot_derives_the_advertised_name() {
        let device = boot(LocalChannel::new(8, 247));
        assert_eq!(device.name(), "SlotVM_51F1");
        assert_eq!(device.device_id(), [0; 8]);
    }

    #[tokio::test]
    async fn run_serves_the_channel_until_shutdown() {
        let channel = LocalChannel::new(8, 247);
        let device = boot(channel.clone());
        let handle = device.supervisor();
        let link = device.host().link.clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let running = tokio::spawn(device.run(async move {
            let _ = stopped.await;
        }));
        assert!(eventually(|| channel.advertised_name().as_deref() == Some("SlotVM_51F1")).await);

        channel.notify(DeployEvent::Connected).await.unwrap();
        let reply = channel
            .request(DeployEvent::ProgramReceived {
                slot: 1,
                bytes: Bytes::from(program_of_len(120)),
                length: 120,
            })
            .await
            .unwrap();
        assert_eq!(reply, EventReply::Stored { written: 120 });
        assert_eq!(link.get(), ConnectionState::Connected);

        let first = handle.clone();
        let generation = task::spawn_blocking(move || first.wait_for_boot(0, WAIT))
            .await
            .unwrap()
            .unwrap()
            .generation;
        assert_eq!(channel.request(DeployEvent::ReloadRequested).await.unwrap(), EventReply::Ack);
        let report = task::spawn_blocking(move || handle.wait_for_boot(generation, WAIT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.slot(Slot::Slot2).unwrap().source, ProgramSource::Stored);

        assert!(
            eventually(|| {
                let texts = channel.texts();
                texts.iter().any(|t| t.starts_with("VM stopped (uptime: "))
                    && texts.iter().any(|t| t.starts_with("Blinked ("))
            })
            .await
        );

        stop.send(()).unwrap();
        let state = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        assert_eq!(state, SupervisorState::ShuttingDown);
        assert_eq!(link.get(), ConnectionState::Disconnected);
        assert!(channel.texts().iter().any(|t| t == "Disconnecting..."));
    }

    #[test]
    fn factory_reset_restores_the_defaults() {
        let device = boot(LocalChannel::new(8, 247));
        for slot in Slot::ALL {
            device.slots().store(slot, &program_of_len(48)).unwrap();
        }

        device.factory_reset().unwrap();
        device.factory_reset().unwrap();

        let handle = device.supervisor();
        let generation = handle.wait_for_boot(0, WAIT).unwrap().generation;
        handle.restart().unwrap();
        let report = handle.wait_for_boot(generation, WAIT).unwrap();
        for slot in Slot::ALL {
            assert_eq!(report.slot(slot).unwrap().source, ProgramSource::FactoryDefault);
        }
    }
}
