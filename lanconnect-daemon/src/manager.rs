//! Device Manager
//!
//! Owns the channel service and the known devices. Every channel the service
//! opens is handed to the device with the peer's id, creating that device on
//! first contact. Devices are kept across disconnects so a reconnecting peer
//! finds its pairing state and plugins where it left them.

use anyhow::{Context, Result};
use futures::future::join_all;
use lanconnect_protocol::{ChannelService, Device, DeviceOptions, LocalContext, ServiceEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct DeviceManager {
    service: Arc<dyn ChannelService>,
    local: LocalContext,
    options: DeviceOptions,
    devices: Arc<RwLock<HashMap<String, Device>>>,
    event_task: Option<JoinHandle<()>>,
}

impl DeviceManager {
    pub fn new(service: Arc<dyn ChannelService>, local: LocalContext, options: DeviceOptions) -> Self {
        Self {
            service,
            local,
            options,
            devices: Arc::new(RwLock::new(HashMap::new())),
            event_task: None,
        }
    }

    /// Start the channel service and begin adopting its channels
    pub async fn start(&mut self) -> Result<()> {
        if self.event_task.is_some() {
            return Ok(());
        }

        // Subscribe first so no channel opened during startup is missed
        let events = self.service.subscribe();
        self.service
            .start()
            .await
            .with_context(|| format!("Failed to start {} channel service", self.service.name()))?;

        self.event_task = Some(tokio::spawn(run_events(
            events,
            self.devices.clone(),
            self.local.clone(),
            self.options,
        )));

        info!("Device manager started ({} backend)", self.service.name());
        Ok(())
    }

    /// Stop the service and forget every device
    pub async fn stop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.service.stop().await;

        let devices: Vec<Device> = self.devices.write().await.drain().map(|(_, d)| d).collect();
        join_all(devices.iter().map(|device| device.destroy())).await;

        info!("Device manager stopped");
    }

    /// Every known device
    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Unpair and forget a device
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let device = self
            .devices
            .write()
            .await
            .remove(id)
            .with_context(|| format!("Unknown device {}", id))?;

        if let Err(e) = device.unpair().await {
            warn!("Failed to unpair {} before removal: {}", id, e);
        }
        device.destroy().await;

        info!("Removed device {}", id);
        Ok(())
    }

    /// Announce ourselves on the network now
    pub async fn refresh(&self) -> Result<()> {
        self.service
            .broadcast(None)
            .await
            .context("Failed to broadcast identity")
    }
}

async fn run_events(
    mut events: broadcast::Receiver<ServiceEvent>,
    devices: Arc<RwLock<HashMap<String, Device>>>,
    local: LocalContext,
    options: DeviceOptions,
) {
    loop {
        match events.recv().await {
            Ok(ServiceEvent::ChannelOpened(channel)) => {
                let device_id = channel.device_id().to_string();
                let device = {
                    let mut devices = devices.write().await;
                    devices
                        .entry(device_id.clone())
                        .or_insert_with(|| {
                            info!("New device {} ({})", channel.identity().device_name, device_id);
                            Device::new(channel.identity().clone(), local.clone(), options)
                        })
                        .clone()
                };

                if let Err(e) = device.attach_channel(channel).await {
                    warn!("Failed to attach channel to {}: {}", device_id, e);
                }
            }
            Ok(ServiceEvent::ChannelClosed { device_id }) => {
                debug!("Channel to {} closed", device_id);
            }
            Ok(ServiceEvent::Started) | Ok(ServiceEvent::Stopped) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Device manager missed {} service events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Device manager event loop ended");
}
