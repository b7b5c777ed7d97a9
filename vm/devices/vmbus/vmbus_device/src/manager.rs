// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Keeps a [`Device`] for every channel the host offers.

use crate::Device;
use crate::DeviceConfig;
use crate::DeviceError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use vmbus_client::OfferObserver;
use vmbus_client::VmbusClient;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::OfferChannel;

/// Creates a device when a channel is offered and terminates it when the
/// channel is rescinded.
pub struct DeviceManager {
    this: Weak<DeviceManager>,
    client: Arc<VmbusClient>,
    config: DeviceConfig,
    devices: Mutex<BTreeMap<u32, Arc<Device>>>,
    rescinded: Mutex<Vec<ChannelId>>,
}

struct Observer(Weak<DeviceManager>);

impl OfferObserver for Observer {
    fn on_offer(&self, offer: &OfferChannel) {
        if let Some(manager) = self.0.upgrade() {
            manager.attach(offer.channel_id);
        }
    }

    fn on_rescind(&self, channel_id: ChannelId) {
        if let Some(manager) = self.0.upgrade() {
            manager.detach(channel_id);
        }
    }
}

impl DeviceManager {
    pub fn new(client: Arc<VmbusClient>, config: DeviceConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            config,
            devices: Mutex::new(BTreeMap::new()),
            rescinded: Mutex::new(Vec::new()),
        })
    }

    /// Attaches a device to every current offer and follows later offers
    /// and rescinds.
    pub fn start(&self) {
        self.client
            .set_offer_observer(Some(Arc::new(Observer(self.this.clone()))));
        for offer in self.client.offers() {
            self.attach(offer.channel_id);
        }
    }

    /// Stops following offers and drops every device, closing open channels.
    pub fn stop(&self) {
        self.client.set_offer_observer(None);
        let devices = std::mem::take(&mut *self.devices.lock());
        drop(devices);
    }

    pub fn device(&self, channel_id: ChannelId) -> Option<Arc<Device>> {
        self.devices.lock().get(&channel_id.0).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    fn attach(&self, channel_id: ChannelId) {
        if self.devices.lock().contains_key(&channel_id.0) {
            return;
        }
        match Device::new(self.client.clone(), channel_id, self.config.clone()) {
            Ok(device) => {
                self.devices.lock().entry(channel_id.0).or_insert(device);
            }
            Err(err) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to attach device"
                );
            }
        }
    }

    /// Runs on the interrupt path, so it only forgets the device. The
    /// channel ID is returned to the host by [`Self::free_rescinded`].
    fn detach(&self, channel_id: ChannelId) {
        let device = self.devices.lock().remove(&channel_id.0);
        if let Some(device) = device {
            device.terminate();
        }
        self.rescinded.lock().push(channel_id);
    }

    /// Releases the IDs of rescinded channels to the host.
    pub fn free_rescinded(&self) -> Result<Vec<ChannelId>, DeviceError> {
        let rescinded = std::mem::take(&mut *self.rescinded.lock());
        for (i, &channel_id) in rescinded.iter().enumerate() {
            if let Err(err) = self.client.free_channel(channel_id) {
                self.rescinded.lock().extend_from_slice(&rescinded[i..]);
                return Err(err.into());
            }
        }
        Ok(rescinded)
    }
}
