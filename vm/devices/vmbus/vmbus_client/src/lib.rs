// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side client for the Hyper-V Virtual Machine Bus (VmBus) control
//! plane.
//!
//! [`VmbusClient`] negotiates a protocol version with the host, enumerates
//! channel offers, registers GPADLs, and opens and closes channels. Control
//! requests are serialized by a command gate and each waits for its response
//! with a deadline. Offers, rescinds and channel interrupts arrive on the
//! platform interrupt and are dispatched to registered handlers.

#![forbid(unsafe_code)]

pub mod event_flags;

pub use event_flags::EventFlagStrategy;
pub use event_flags::LegacyEventFlagStrategy;
pub use event_flags::PerChannelBitStrategy;

use hv1_guest::HypervisorInfo;
use hv1_guest::Hypercalls;
use hv1_guest::Synic;
use hv1_guest::SynicConfig;
use hv1_guest::detect::DetectError;
use hv1_guest::hypercall::HypercallInitError;
use hv1_guest::memory::MemoryBlock;
use hv1_guest::memory::PAGE_SIZE;
use hv1_guest::memory::PAGE_SIZE64;
use hv1_guest::platform::GuestPlatform;
use hv1_guest::platform::InterruptSink;
use hv1_guest::report_guest_os_id;
use hv1_guest::synic::EventFlags;
use hv1_guest::synic::SynicError;
use hv1_guest::synic::SynicHandler;
use hvdef::GuestOsId;
use hvdef::GuestOsType;
use hvdef::HvError;
use hvdef::HvMessage;
use hvdef::HvMessageType;
use hvdef::HvResult;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use vmbus_core::OutgoingMessage;
use vmbus_core::gpadl::BuildError;
use vmbus_core::gpadl::GpadlMessages;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::Version;
use vmbus_core::protocol::VmbusMessage;
use vmbus_ring::MemoryBlockRingBuffer;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;

/// How often, and how patiently, to retry a post message hypercall that
/// failed because the hypervisor was short of message buffers.
#[derive(Debug, Copy, Clone)]
pub struct RetryStrategy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            attempts: 100,
            delay: Duration::from_micros(10),
        }
    }
}

impl RetryStrategy {
    /// Calls `f` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    pub fn run<T>(&self, mut f: impl FnMut() -> HvResult<T>) -> HvResult<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    tracing::trace!(attempt, %err, "retrying hypercall");
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                result => break result,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmbusConfig {
    /// Versions to request, in order of preference.
    pub versions: Vec<Version>,
    pub synic: SynicConfig,
    /// Reported to the hypervisor before the hypercall page is enabled.
    pub guest_os_id: GuestOsId,
    /// How long to wait for each control response.
    pub response_timeout: Duration,
    pub retry: RetryStrategy,
    /// One past the highest channel ID accepted from the host.
    pub max_channels: u32,
}

impl Default for VmbusConfig {
    fn default() -> Self {
        Self {
            versions: vec![Version::Win7, Version::V1],
            synic: SynicConfig::default(),
            guest_os_id: GuestOsId::new()
                .with_os_type(GuestOsType::DARWIN.0)
                .with_open_source(true),
            response_timeout: Duration::from_secs(10),
            retry: RetryStrategy::default(),
            max_channels: protocol::MAX_CHANNELS as u32,
        }
    }
}

/// The local state of a channel table entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    NotPresent,
    Closed,
    GpadlConfigured,
    Opening,
    Open,
}

/// Receives the interrupts of one channel.
pub trait ChannelHandler: Send + Sync {
    /// The host signaled the channel. Called in interrupt context.
    fn on_event(&self);

    /// The host revoked the channel. Its rings are no longer shared.
    fn on_rescind(&self) {}
}

/// Observes channels arriving and leaving after enumeration.
pub trait OfferObserver: Send + Sync {
    fn on_offer(&self, offer: &OfferChannel);
    fn on_rescind(&self, channel_id: ChannelId);
}

/// The ring buffer memory of an open channel.
#[derive(Debug, Clone)]
pub struct ChannelBuffers {
    pub gpadl_id: GpadlId,
    /// Guest to host.
    pub outgoing: MemoryBlockRingBuffer,
    /// Host to guest.
    pub incoming: MemoryBlockRingBuffer,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("hypervisor not usable")]
    Detect(#[from] DetectError),
    #[error("failed to enable hypercalls")]
    Hypercall(#[from] HypercallInitError),
    #[error("failed to enable the synic")]
    Synic(#[from] SynicError),
    #[error("failed to register the interrupt handler")]
    Interrupt(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("failed to allocate connection pages")]
    Allocation(#[source] anyhow::Error),
    #[error("no supported protocol versions")]
    NoSupportedVersions,
    #[error("host failed the connection: {0:?}")]
    ConnectionState(ConnectionState),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("invalid channel id {0}")]
    InvalidChannel(u32),
    #[error("channel {0} not present")]
    NotPresent(u32),
    #[error("channel {id} is {status:?}")]
    InvalidState { id: u32, status: ChannelStatus },
    #[error("post message failed")]
    PostMessage(#[source] HvError),
    #[error("signal event failed")]
    SignalEvent(#[source] HvError),
    #[error("timed out waiting for {0:?}")]
    Timeout(MessageType),
    #[error("wait for {0:?} abandoned")]
    WaitAbandoned(MessageType),
    #[error("malformed {0:?} response")]
    MalformedResponse(MessageType),
}

#[derive(Debug, Error)]
pub enum GpadlError {
    #[error("buffer is not page aligned")]
    NotAligned,
    #[error("failed to build gpadl")]
    Build(#[from] BuildError),
    #[error("host rejected gpadl with status {0:#x}")]
    Rejected(i32),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid channel id {0}")]
    InvalidChannel(u32),
    #[error("ring sizes must be non-zero multiples of the page size")]
    InvalidSize,
    #[error("failed to allocate ring buffers")]
    Allocation(#[source] anyhow::Error),
    #[error("failed to create ring buffer gpadl")]
    Gpadl(#[source] GpadlError),
    #[error("host rejected open with status {0:#x}")]
    Rejected(u32),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Proof that the caller holds the command gate.
type Gate<'a> = MutexGuard<'a, ()>;

enum WaitOutcome {
    Response(Vec<u8>),
    Abandoned,
}

struct PendingWait {
    expected: MessageType,
    channel_id: Option<ChannelId>,
    outcome: Option<WaitOutcome>,
}

struct Connection {
    version: Version,
    connection_id: u32,
    strategy: Arc<dyn EventFlagStrategy>,
    _pages: MemoryBlock,
}

struct RingAllocation {
    buffer: MemoryBlock,
    gpadl_id: GpadlId,
}

#[derive(Default)]
struct ChannelSlot {
    offer: Option<OfferChannel>,
    status: ChannelStatus,
    rescinded: bool,
    ring: Option<RingAllocation>,
    handler: Option<Arc<dyn ChannelHandler>>,
}

struct ClientInner {
    platform: GuestPlatform,
    hypercalls: Hypercalls,
    synic: Synic,
    config: VmbusConfig,
    gate: Mutex<()>,
    wait: Mutex<Option<PendingWait>>,
    wait_done: Condvar,
    connection: RwLock<Option<Connection>>,
    channels: Mutex<Vec<ChannelSlot>>,
    next_gpadl_id: AtomicU32,
    observer: RwLock<Option<Arc<dyn OfferObserver>>>,
}

/// The guest end of the VmBus control plane.
pub struct VmbusClient {
    inner: Arc<ClientInner>,
}

struct InterruptHandler(Weak<ClientInner>);

impl InterruptSink for InterruptHandler {
    fn interrupt(&self) {
        if let Some(inner) = self.0.upgrade() {
            let cpu = inner.platform.per_cpu.current_cpu();
            inner.synic.handle_interrupt(cpu, &*inner);
        }
    }
}

impl VmbusClient {
    /// Enables hypercalls and the SynIC on every processor and installs the
    /// interrupt handler. The client is not connected yet.
    pub fn new(platform: GuestPlatform, config: VmbusConfig) -> Result<Self, InitError> {
        let info = HypervisorInfo::detect(&*platform.cpuid)?;
        if !info.can_post_messages() {
            return Err(DetectError::MissingFeature("post messages").into());
        }
        report_guest_os_id(&*platform.msr, config.guest_os_id);
        let hypercalls = Hypercalls::new(&platform)?;
        let synic = match Synic::new(&platform, config.synic) {
            Ok(synic) => synic,
            Err(err) => {
                hypercalls.disable();
                return Err(err.into());
            }
        };

        let inner = Arc::new(ClientInner {
            channels: Mutex::new(
                (0..protocol::MAX_CHANNELS)
                    .map(|_| ChannelSlot::default())
                    .collect(),
            ),
            platform,
            hypercalls,
            synic,
            config,
            gate: Mutex::new(()),
            wait: Mutex::new(None),
            wait_done: Condvar::new(),
            connection: RwLock::new(None),
            next_gpadl_id: AtomicU32::new(protocol::FIRST_GPADL_ID),
            observer: RwLock::new(None),
        });

        let sink = Arc::new(InterruptHandler(Arc::downgrade(&inner)));
        if let Err(err) = inner.platform.interrupt.register(sink) {
            inner.synic.shutdown();
            inner.hypercalls.disable();
            return Err(InitError::Interrupt(err));
        }
        tracing::info!(cpus = inner.synic.cpu_count(), "vmbus client initialized");
        Ok(Self { inner })
    }

    /// Negotiates a protocol version, trying each configured version in
    /// order.
    pub fn connect(&self) -> Result<Version, ConnectError> {
        self.inner.connect()
    }

    /// Asks the host for its offers and waits until all are delivered.
    ///
    /// Open channels and their GPADLs are kept across a rescan.
    pub fn scan(&self) -> Result<Vec<OfferChannel>, ClientError> {
        self.inner.scan()
    }

    /// Unloads the connection. Every channel is forgotten.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.disconnect()
    }

    /// The negotiated version.
    pub fn version(&self) -> Option<Version> {
        self.inner.connection.read().as_ref().map(|c| c.version)
    }

    /// The offers of every present, unrevoked channel.
    pub fn offers(&self) -> Vec<OfferChannel> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|slot| !slot.rescinded)
            .filter_map(|slot| slot.offer)
            .collect()
    }

    pub fn offer(&self, channel_id: ChannelId) -> Option<OfferChannel> {
        self.inner
            .channels
            .lock()
            .get(channel_id.0 as usize)
            .and_then(|slot| slot.offer)
    }

    /// `NotPresent` for IDs outside the table.
    pub fn channel_status(&self, channel_id: ChannelId) -> ChannelStatus {
        self.inner
            .channels
            .lock()
            .get(channel_id.0 as usize)
            .map_or(ChannelStatus::NotPresent, |slot| slot.status)
    }

    /// Whether the host has revoked the channel and is waiting for it to be
    /// freed.
    pub fn is_rescinded(&self, channel_id: ChannelId) -> bool {
        self.inner
            .channels
            .lock()
            .get(channel_id.0 as usize)
            .is_some_and(|slot| slot.rescinded)
    }

    pub fn set_offer_observer(&self, observer: Option<Arc<dyn OfferObserver>>) {
        *self.inner.observer.write() = observer;
    }

    pub fn set_channel_handler(
        &self,
        channel_id: ChannelId,
        handler: Option<Arc<dyn ChannelHandler>>,
    ) -> Result<(), ClientError> {
        let mut channels = self.inner.channels.lock();
        let slot = self.inner.slot_mut(&mut channels, channel_id)?;
        slot.handler = handler;
        Ok(())
    }

    /// Describes `buffer` to the host, returning the handle to refer to it
    /// by.
    pub fn create_gpadl(
        &self,
        channel_id: ChannelId,
        buffer: &MemoryBlock,
    ) -> Result<GpadlId, GpadlError> {
        let gate = self.inner.gate.lock();
        self.inner.create_gpadl(&gate, channel_id, buffer)
    }

    pub fn teardown_gpadl(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
    ) -> Result<(), ClientError> {
        let gate = self.inner.gate.lock();
        self.inner.teardown_gpadl(&gate, channel_id, gpadl_id)
    }

    /// Allocates ring buffers of `tx_size` and `rx_size` data bytes and opens
    /// the channel on them.
    pub fn open_channel(
        &self,
        channel_id: ChannelId,
        tx_size: usize,
        rx_size: usize,
    ) -> Result<ChannelBuffers, OpenError> {
        self.inner.open_channel(channel_id, tx_size, rx_size)
    }

    /// Closes an open channel and releases its ring buffers. Closing a
    /// closed channel succeeds.
    pub fn close_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.inner.close_channel(channel_id)
    }

    /// Returns a revoked channel's ID to the host.
    pub fn free_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.inner.free_channel(channel_id)
    }

    /// Interrupts the host for an open channel.
    pub fn signal_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.inner.signal_channel(channel_id)
    }

    /// Allocates zeroed, page aligned memory that can be described to the
    /// host with [`Self::create_gpadl`].
    pub fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        self.inner.platform.dma.allocate_dma_buffer(len)
    }

    /// Sends a control message without waiting for a response.
    pub fn send_message(&self, message: &OutgoingMessage) -> Result<(), ClientError> {
        let _gate = self.inner.gate.lock();
        let connection_id = self.inner.message_connection_id()?;
        self.inner.post(connection_id, message)
    }

    /// Sends a control message and waits for a message of type `expected`,
    /// returning it without its header.
    pub fn send_message_and_wait(
        &self,
        message: &OutgoingMessage,
        expected: MessageType,
    ) -> Result<Vec<u8>, ClientError> {
        let gate = self.inner.gate.lock();
        let connection_id = self.inner.message_connection_id()?;
        let mut data = self
            .inner
            .send_and_wait(&gate, connection_id, message, expected, None)?;
        data.drain(..protocol::HEADER_SIZE.min(data.len()));
        Ok(data)
    }
}

impl Drop for VmbusClient {
    fn drop(&mut self) {
        self.inner.abandon_wait(None);
        self.inner.platform.interrupt.disable();
        self.inner.platform.interrupt.unregister();
        self.inner.synic.shutdown();
        self.inner.hypercalls.disable();
    }
}

impl ClientInner {
    fn slot_mut<'a>(
        &self,
        channels: &'a mut [ChannelSlot],
        channel_id: ChannelId,
    ) -> Result<&'a mut ChannelSlot, ClientError> {
        if !channel_id.is_valid() || channel_id.0 >= self.config.max_channels {
            return Err(ClientError::InvalidChannel(channel_id.0));
        }
        channels
            .get_mut(channel_id.0 as usize)
            .ok_or(ClientError::InvalidChannel(channel_id.0))
    }

    fn set_status(&self, channel_id: ChannelId, status: ChannelStatus) {
        let mut channels = self.channels.lock();
        if let Ok(slot) = self.slot_mut(&mut channels, channel_id) {
            if slot.status != ChannelStatus::NotPresent {
                slot.status = status;
            }
        }
    }

    fn message_connection_id(&self) -> Result<u32, ClientError> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.connection_id)
            .ok_or(ClientError::NotConnected)
    }

    fn post(&self, connection_id: u32, message: &OutgoingMessage) -> Result<(), ClientError> {
        tracing::trace!(typ = ?message.message_type(), connection_id, "sending message");
        self.config
            .retry
            .run(|| {
                self.hypercalls.post_message(
                    connection_id,
                    protocol::VMBUS_MESSAGE_TYPE,
                    message.data(),
                )
            })
            .map_err(|err| {
                tracing::warn!(typ = ?message.message_type(), %err, "failed to post message");
                ClientError::PostMessage(err)
            })
    }

    /// Posts `message` and waits for the response of type `expected`. The
    /// wait is registered before posting so the response cannot be missed.
    fn send_and_wait(
        &self,
        _gate: &Gate<'_>,
        connection_id: u32,
        message: &OutgoingMessage,
        expected: MessageType,
        channel_id: Option<ChannelId>,
    ) -> Result<Vec<u8>, ClientError> {
        *self.wait.lock() = Some(PendingWait {
            expected,
            channel_id,
            outcome: None,
        });
        if let Err(err) = self.post(connection_id, message) {
            *self.wait.lock() = None;
            return Err(err);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        let mut wait = self.wait.lock();
        loop {
            if let Some(outcome) = wait.as_mut().and_then(|w| w.outcome.take()) {
                *wait = None;
                return match outcome {
                    WaitOutcome::Response(data) => Ok(data),
                    WaitOutcome::Abandoned => Err(ClientError::WaitAbandoned(expected)),
                };
            }
            if wait.is_none() {
                return Err(ClientError::WaitAbandoned(expected));
            }
            if self.wait_done.wait_until(&mut wait, deadline).timed_out() {
                let outcome = wait.take().and_then(|w| w.outcome);
                return match outcome {
                    Some(WaitOutcome::Response(data)) => Ok(data),
                    Some(WaitOutcome::Abandoned) => Err(ClientError::WaitAbandoned(expected)),
                    None => {
                        tracing::warn!(?expected, "timed out waiting for host response");
                        Err(ClientError::Timeout(expected))
                    }
                };
            }
        }
    }

    fn request<T: VmbusMessage + FromBytes + Immutable + KnownLayout>(
        &self,
        gate: &Gate<'_>,
        connection_id: u32,
        message: &OutgoingMessage,
        channel_id: Option<ChannelId>,
    ) -> Result<T, ClientError> {
        let data = self.send_and_wait(gate, connection_id, message, T::MESSAGE_TYPE, channel_id)?;
        data.get(protocol::HEADER_SIZE..)
            .and_then(|body| T::read_from_prefix(body).ok())
            .map(|(response, _)| response)
            .ok_or(ClientError::MalformedResponse(T::MESSAGE_TYPE))
    }

    fn complete_wait(&self, typ: MessageType, data: &[u8]) {
        let mut wait = self.wait.lock();
        match wait.as_mut() {
            Some(pending) if pending.expected == typ && pending.outcome.is_none() => {
                pending.outcome = Some(WaitOutcome::Response(data.to_vec()));
                self.wait_done.notify_all();
            }
            _ => tracing::warn!(?typ, "unexpected message from host"),
        }
    }

    /// Fails the outstanding wait, or only one for `channel_id`.
    fn abandon_wait(&self, channel_id: Option<ChannelId>) {
        let mut wait = self.wait.lock();
        if let Some(pending) = wait.as_mut() {
            if pending.outcome.is_none()
                && (channel_id.is_none() || pending.channel_id == channel_id)
            {
                tracing::debug!(expected = ?pending.expected, "abandoning wait");
                pending.outcome = Some(WaitOutcome::Abandoned);
                self.wait_done.notify_all();
            }
        }
    }

    fn reset_channels(&self) {
        self.channels
            .lock()
            .iter_mut()
            .for_each(|slot| *slot = ChannelSlot::default());
        self.next_gpadl_id
            .store(protocol::FIRST_GPADL_ID, Ordering::Relaxed);
    }

    fn connect(&self) -> Result<Version, ConnectError> {
        let gate = self.gate.lock();
        if self.connection.read().is_some() {
            return Err(ConnectError::AlreadyConnected);
        }

        // The legacy interrupt page, then the two monitor pages.
        let pages = self
            .platform
            .dma
            .allocate_dma_buffer(3 * PAGE_SIZE)
            .map_err(ConnectError::Allocation)?;
        let interrupt_page = pages.subblock(0, PAGE_SIZE);

        self.platform.interrupt.enable();
        let result = self.negotiate(&gate, &pages, interrupt_page);
        if result.is_err() {
            self.platform.interrupt.disable();
        }
        result
    }

    fn negotiate(
        &self,
        gate: &Gate<'_>,
        pages: &MemoryBlock,
        interrupt_page: MemoryBlock,
    ) -> Result<Version, ConnectError> {
        for &version in &self.config.versions {
            let (connection_id, interrupt_page_or_target_info) = if version.uses_target_info() {
                let target = protocol::TargetInfo::new()
                    .with_sint(self.config.synic.message_sint)
                    .with_vtl(0);
                (protocol::VMBUS_MESSAGE_CONNECTION_ID_4, target.into())
            } else {
                (protocol::VMBUS_MESSAGE_CONNECTION_ID, interrupt_page.gpa())
            };
            let message = OutgoingMessage::new(&protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp: 0,
                interrupt_page_or_target_info,
                parent_to_child_monitor_page_gpa: pages.gpa() + PAGE_SIZE64,
                child_to_parent_monitor_page_gpa: pages.gpa() + 2 * PAGE_SIZE64,
            });

            tracing::debug!(?version, "requesting version");
            let response: protocol::VersionResponse =
                self.request(gate, connection_id, &message, None)?;
            if response.version_supported == 0 {
                tracing::debug!(?version, "version not supported by host");
                continue;
            }
            if response.connection_state != ConnectionState::SUCCESSFUL {
                return Err(ConnectError::ConnectionState(response.connection_state));
            }

            let connection_id = if version.uses_target_info() {
                response.selected_version_or_connection_id
            } else {
                protocol::VMBUS_MESSAGE_CONNECTION_ID
            };
            let strategy: Arc<dyn EventFlagStrategy> = if version.uses_legacy_event_flags() {
                Arc::new(LegacyEventFlagStrategy::new(interrupt_page))
            } else {
                Arc::new(PerChannelBitStrategy)
            };
            *self.connection.write() = Some(Connection {
                version,
                connection_id,
                strategy,
                _pages: pages.clone(),
            });
            tracing::info!(?version, connection_id, "vmbus connected");
            return Ok(version);
        }
        Err(ConnectError::NoSupportedVersions)
    }

    fn scan(&self) -> Result<Vec<OfferChannel>, ClientError> {
        let gate = self.gate.lock();
        let connection_id = self.message_connection_id()?;
        // Channels with a ring or an open in flight keep their state; the
        // host's repeated offer for them is dropped as a duplicate.
        self.channels
            .lock()
            .iter_mut()
            .filter(|slot| slot.ring.is_none() && slot.status == ChannelStatus::Closed)
            .for_each(|slot| *slot = ChannelSlot::default());
        self.request::<protocol::AllOffersDelivered>(
            &gate,
            connection_id,
            &OutgoingMessage::new(&protocol::RequestOffers {}),
            None,
        )?;
        let offers: Vec<_> = self
            .channels
            .lock()
            .iter()
            .filter_map(|slot| slot.offer)
            .collect();
        tracing::info!(count = offers.len(), "offers delivered");
        Ok(offers)
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        let gate = self.gate.lock();
        let connection_id = self.message_connection_id()?;
        let result = self
            .request::<protocol::UnloadComplete>(
                &gate,
                connection_id,
                &OutgoingMessage::new(&protocol::Unload {}),
                None,
            )
            .map(drop);
        *self.connection.write() = None;
        self.platform.interrupt.disable();
        self.reset_channels();
        tracing::info!("vmbus disconnected");
        result
    }

    fn create_gpadl(
        &self,
        gate: &Gate<'_>,
        channel_id: ChannelId,
        buffer: &MemoryBlock,
    ) -> Result<GpadlId, GpadlError> {
        if buffer.is_empty() || buffer.len() % PAGE_SIZE != 0 || buffer.offset_in_page() != 0 {
            return Err(GpadlError::NotAligned);
        }
        let byte_count = u32::try_from(buffer.len())
            .map_err(|_| BuildError::TooManyPages(buffer.len() / PAGE_SIZE))?;
        let connection_id = self.message_connection_id()?;
        let gpadl_id = GpadlId(self.next_gpadl_id.fetch_add(1, Ordering::Relaxed));
        let gpadl = GpadlMessages::new(channel_id, gpadl_id, byte_count, buffer.pfns())?;
        let (last, rest) = gpadl
            .messages()
            .split_last()
            .ok_or(BuildError::Empty)?;

        // Only the final message is acknowledged.
        for (i, message) in rest.iter().enumerate() {
            if let Err(err) = self.post(connection_id, message) {
                if i > 0 {
                    self.teardown_after_failure(gate, channel_id, gpadl_id);
                }
                return Err(err.into());
            }
        }

        let created = match self.request::<protocol::GpadlCreated>(
            gate,
            connection_id,
            last,
            Some(channel_id),
        ) {
            Ok(created) => created,
            Err(err) => {
                let header_sent = !rest.is_empty() || !matches!(err, ClientError::PostMessage(_));
                if header_sent && !matches!(err, ClientError::WaitAbandoned(_)) {
                    self.teardown_after_failure(gate, channel_id, gpadl_id);
                }
                return Err(err.into());
            }
        };
        if created.status != protocol::STATUS_SUCCESS {
            tracing::warn!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                status = created.status,
                "host rejected gpadl"
            );
            self.teardown_after_failure(gate, channel_id, gpadl_id);
            return Err(GpadlError::Rejected(created.status));
        }

        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            pages = buffer.pfns().len(),
            messages = gpadl.messages().len(),
            "gpadl created"
        );
        Ok(gpadl_id)
    }

    fn teardown_gpadl(
        &self,
        gate: &Gate<'_>,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
    ) -> Result<(), ClientError> {
        let connection_id = self.message_connection_id()?;
        let torndown = self.request::<protocol::GpadlTorndown>(
            gate,
            connection_id,
            &OutgoingMessage::new(&protocol::GpadlTeardown {
                channel_id,
                gpadl_id,
            }),
            Some(channel_id),
        )?;
        if torndown.gpadl_id != gpadl_id {
            tracing::warn!(
                expected = gpadl_id.0,
                actual = torndown.gpadl_id.0,
                "torndown for another gpadl"
            );
        }
        tracing::debug!(channel_id = channel_id.0, gpadl_id = gpadl_id.0, "gpadl torn down");
        Ok(())
    }

    fn teardown_after_failure(&self, gate: &Gate<'_>, channel_id: ChannelId, gpadl_id: GpadlId) {
        if let Err(err) = self.teardown_gpadl(gate, channel_id, gpadl_id) {
            tracing::warn!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                error = &err as &dyn std::error::Error,
                "failed to tear down gpadl"
            );
        }
    }

    fn open_channel(
        &self,
        channel_id: ChannelId,
        tx_size: usize,
        rx_size: usize,
    ) -> Result<ChannelBuffers, OpenError> {
        if !channel_id.is_valid() || channel_id.0 >= self.config.max_channels {
            return Err(OpenError::InvalidChannel(channel_id.0));
        }
        if tx_size == 0 || rx_size == 0 || tx_size % PAGE_SIZE != 0 || rx_size % PAGE_SIZE != 0 {
            return Err(OpenError::InvalidSize);
        }

        let gate = self.gate.lock();
        let connection_id = self.message_connection_id()?;
        {
            let mut channels = self.channels.lock();
            let slot = self.slot_mut(&mut channels, channel_id)?;
            match slot.status {
                ChannelStatus::NotPresent => {
                    return Err(ClientError::NotPresent(channel_id.0).into());
                }
                ChannelStatus::Closed if !slot.rescinded => {}
                status => {
                    return Err(ClientError::InvalidState {
                        id: channel_id.0,
                        status,
                    }
                    .into());
                }
            }
        }

        // Each ring gets a control page ahead of its data.
        let tx_pages = tx_size / PAGE_SIZE + 1;
        let rx_pages = rx_size / PAGE_SIZE + 1;
        let buffer = self
            .platform
            .dma
            .allocate_dma_buffer((tx_pages + rx_pages) * PAGE_SIZE)
            .map_err(OpenError::Allocation)?;
        let gpadl_id = self
            .create_gpadl(&gate, channel_id, &buffer)
            .map_err(OpenError::Gpadl)?;
        self.set_status(channel_id, ChannelStatus::GpadlConfigured);

        tracing::info!(channel_id = channel_id.0, gpadl_id = gpadl_id.0, "opening channel");
        self.set_status(channel_id, ChannelStatus::Opening);
        let request = protocol::OpenChannel {
            channel_id,
            open_id: channel_id.0,
            ring_buffer_gpadl_id: gpadl_id,
            target_vp: 0,
            downstream_ring_buffer_page_offset: tx_pages as u32,
            user_data: Default::default(),
        };
        let result = self.request::<protocol::OpenResult>(
            &gate,
            connection_id,
            &OutgoingMessage::new(&request),
            Some(channel_id),
        );

        let err = match result {
            Ok(response) if response.status == 0 => {
                let mut channels = self.channels.lock();
                let slot = self.slot_mut(&mut channels, channel_id)?;
                if !slot.rescinded {
                    slot.status = ChannelStatus::Open;
                    slot.ring = Some(RingAllocation {
                        buffer: buffer.clone(),
                        gpadl_id,
                    });
                    tracing::info!(channel_id = channel_id.0, "channel open");
                    return Ok(ChannelBuffers {
                        gpadl_id,
                        outgoing: MemoryBlockRingBuffer::new(
                            buffer.subblock(0, tx_pages * PAGE_SIZE),
                        ),
                        incoming: MemoryBlockRingBuffer::new(
                            buffer.subblock(tx_pages * PAGE_SIZE, rx_pages * PAGE_SIZE),
                        ),
                    });
                }
                OpenError::Client(ClientError::WaitAbandoned(MessageType::OPEN_CHANNEL_RESULT))
            }
            Ok(response) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    status = response.status,
                    "host failed to open channel"
                );
                OpenError::Rejected(response.status)
            }
            Err(err) => OpenError::Client(err),
        };

        if !matches!(err, OpenError::Client(ClientError::WaitAbandoned(_))) {
            self.teardown_after_failure(&gate, channel_id, gpadl_id);
        }
        self.set_status(channel_id, ChannelStatus::Closed);
        Err(err)
    }

    fn close_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        let gate = self.gate.lock();
        let connection_id = self.message_connection_id()?;
        let ring = {
            let mut channels = self.channels.lock();
            let slot = self.slot_mut(&mut channels, channel_id)?;
            match slot.status {
                ChannelStatus::NotPresent => return Err(ClientError::NotPresent(channel_id.0)),
                ChannelStatus::Closed => return Ok(()),
                ChannelStatus::Open => slot.ring.take(),
                status => {
                    return Err(ClientError::InvalidState {
                        id: channel_id.0,
                        status,
                    });
                }
            }
        };

        tracing::info!(channel_id = channel_id.0, "closing channel");
        // Teardown proceeds even if the host never saw the close.
        if let Err(err) = self.post(
            connection_id,
            &OutgoingMessage::new(&protocol::CloseChannel { channel_id }),
        ) {
            tracing::warn!(
                channel_id = channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to send close channel"
            );
        }

        let result = match &ring {
            Some(ring) => self.teardown_gpadl(&gate, channel_id, ring.gpadl_id),
            None => Ok(()),
        };
        self.set_status(channel_id, ChannelStatus::Closed);
        if result.is_err() {
            // The host may still be using the pages.
            std::mem::forget(ring);
        }
        result
    }

    fn free_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        let _gate = self.gate.lock();
        let connection_id = self.message_connection_id()?;
        {
            let mut channels = self.channels.lock();
            let slot = self.slot_mut(&mut channels, channel_id)?;
            if !slot.rescinded {
                return Err(ClientError::InvalidState {
                    id: channel_id.0,
                    status: slot.status,
                });
            }
            *slot = ChannelSlot::default();
        }
        tracing::info!(channel_id = channel_id.0, "releasing channel id");
        self.post(
            connection_id,
            &OutgoingMessage::new(&protocol::RelIdReleased { channel_id }),
        )
    }

    fn signal_channel(&self, channel_id: ChannelId) -> Result<(), ClientError> {
        let strategy = self
            .connection
            .read()
            .as_ref()
            .map(|c| c.strategy.clone())
            .ok_or(ClientError::NotConnected)?;
        let connection_id = {
            let mut channels = self.channels.lock();
            let slot = self.slot_mut(&mut channels, channel_id)?;
            match (slot.status, &slot.offer) {
                (ChannelStatus::Open, Some(offer)) => offer.connection_id,
                (status, _) => {
                    return Err(ClientError::InvalidState {
                        id: channel_id.0,
                        status,
                    });
                }
            }
        };
        strategy.prepare_signal(channel_id);
        tracing::trace!(channel_id = channel_id.0, connection_id, "signaling host");
        self.hypercalls
            .signal_event(connection_id)
            .map_err(ClientError::SignalEvent)
    }

    fn channel_event(&self, channel_id: ChannelId) {
        let handler = self
            .channels
            .lock()
            .get(channel_id.0 as usize)
            .and_then(|slot| slot.handler.clone());
        match handler {
            Some(handler) => handler.on_event(),
            None => {
                tracing::trace!(channel_id = channel_id.0, "event for channel without handler")
            }
        }
    }

    fn handle_offer(&self, offer: OfferChannel) {
        let channel_id = offer.channel_id;
        {
            let mut channels = self.channels.lock();
            let slot = match self.slot_mut(&mut channels, channel_id) {
                Ok(slot) => slot,
                Err(err) => {
                    tracing::warn!(error = &err as &dyn std::error::Error, "dropping offer");
                    return;
                }
            };
            if slot.status != ChannelStatus::NotPresent {
                tracing::warn!(channel_id = channel_id.0, "duplicate offer");
                return;
            }
            *slot = ChannelSlot {
                offer: Some(offer),
                status: ChannelStatus::Closed,
                ..Default::default()
            };
        }
        tracing::info!(
            channel_id = channel_id.0,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            "received offer"
        );
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_offer(&offer);
        }
    }

    fn handle_rescind(&self, channel_id: ChannelId) {
        let (handler, ring) = {
            let mut channels = self.channels.lock();
            let slot = match self.slot_mut(&mut channels, channel_id) {
                Ok(slot) if slot.status != ChannelStatus::NotPresent && !slot.rescinded => slot,
                _ => {
                    tracing::warn!(channel_id = channel_id.0, "rescind for unknown channel");
                    return;
                }
            };
            slot.rescinded = true;
            slot.status = ChannelStatus::Closed;
            (slot.handler.take(), slot.ring.take())
        };
        tracing::info!(channel_id = channel_id.0, "received rescind");
        self.abandon_wait(Some(channel_id));
        drop(ring);
        if let Some(handler) = handler {
            handler.on_rescind();
        }
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_rescind(channel_id);
        }
    }
}

impl SynicHandler for ClientInner {
    fn on_events(&self, _cpu: u32, flags: EventFlags<'_>) {
        let Some(strategy) = self.connection.read().as_ref().map(|c| c.strategy.clone()) else {
            return;
        };
        strategy.scan(flags, self.config.max_channels, &mut |channel_id| {
            self.channel_event(channel_id)
        });
    }

    fn on_message(&self, cpu: u32, message: &HvMessage) {
        if message.header.typ != HvMessageType::HvMessageTypeChannel {
            tracing::warn!(cpu, typ = ?message.header.typ, "unexpected message type");
            return;
        }
        let data = message.payload();
        let version = self.connection.read().as_ref().map(|c| c.version);
        let parsed = match Message::parse(data, version) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "dropping malformed message"
                );
                return;
            }
        };
        tracing::debug!(typ = ?parsed.message_type(), "received message");
        match parsed {
            Message::OfferChannel(offer, _) => self.handle_offer(offer),
            Message::RescindChannelOffer(rescind, _) => self.handle_rescind(rescind.channel_id),
            parsed => self.complete_wait(parsed.message_type(), data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guid::Guid;
    use hv1_guest::emulated::EmulatedHypervisor;
    use std::sync::atomic::AtomicUsize;
    use test_with_tracing::test;
    use vmbus_emulated_host::EmulatedHost;
    use vmbus_emulated_host::HostConfig;
    use vmbus_emulated_host::make_offer;

    const INTERFACE: Guid = guid::guid!("57164f39-9115-4e78-ab55-382f3bd5422d");

    fn instance(n: u32) -> Guid {
        Guid {
            data1: n,
            ..Guid::ZERO
        }
    }

    fn wait_for(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct TestEnv {
        hv: Arc<EmulatedHypervisor>,
        host: Arc<EmulatedHost>,
        client: VmbusClient,
    }

    impl TestEnv {
        fn new(host_config: HostConfig, config: VmbusConfig) -> Self {
            let hv = EmulatedHypervisor::new(1, 256);
            let host = EmulatedHost::attach(&hv, host_config);
            host.add_offer(make_offer(1, INTERFACE, instance(1)));
            let client = VmbusClient::new(hv.platform(), config).unwrap();
            Self { hv, host, client }
        }

        fn connected() -> Self {
            let env = Self::new(
                HostConfig::default(),
                VmbusConfig {
                    response_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            );
            env.client.connect().unwrap();
            env.client.scan().unwrap();
            env
        }

        fn posted_types(&self) -> Vec<MessageType> {
            self.host
                .posted_messages()
                .iter()
                .map(|m| m.message_type())
                .collect()
        }
    }

    #[test]
    fn negotiation_stops_at_first_accepted_version() {
        let candidates = [Version::Win10, Version::Win8_1, Version::Win8, Version::Win7];
        for n in 1..=candidates.len() {
            let env = TestEnv::new(
                HostConfig {
                    versions: vec![candidates[n - 1]],
                    ..Default::default()
                },
                VmbusConfig {
                    versions: candidates.to_vec(),
                    ..Default::default()
                },
            );
            assert_eq!(env.client.connect().unwrap(), candidates[n - 1]);
            let requested: Vec<u32> = env
                .host
                .posted_messages()
                .iter()
                .map(|m| {
                    let body = &m.data()[protocol::HEADER_SIZE..];
                    protocol::InitiateContact::read_from_prefix(body)
                        .unwrap()
                        .0
                        .version_requested
                })
                .collect();
            let expected: Vec<u32> = candidates[..n].iter().map(|&v| v as u32).collect();
            assert_eq!(requested, expected);
            assert_eq!(env.client.version(), Some(candidates[n - 1]));
        }
    }

    #[test]
    fn no_common_version() {
        let env = TestEnv::new(
            HostConfig {
                versions: vec![Version::Copper],
                ..Default::default()
            },
            VmbusConfig::default(),
        );
        assert!(matches!(
            env.client.connect(),
            Err(ConnectError::NoSupportedVersions)
        ));
        assert_eq!(env.client.version(), None);
        assert!(matches!(env.client.scan(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn target_info_versions_use_host_connection_id() {
        let env = TestEnv::new(
            HostConfig {
                versions: vec![Version::Win10Rs5],
                message_connection_id: 0x7,
                ..Default::default()
            },
            VmbusConfig {
                versions: vec![Version::Win10Rs5],
                ..Default::default()
            },
        );
        env.client.connect().unwrap();
        env.client.scan().unwrap();
        let connections: Vec<u32> = env.host.posted().iter().map(|(id, _)| *id).collect();
        assert_eq!(connections, [protocol::VMBUS_MESSAGE_CONNECTION_ID_4, 0x7]);
    }

    #[test]
    fn scan_populates_channel_table() {
        let env = TestEnv::new(HostConfig::default(), VmbusConfig::default());
        env.host.add_offer(make_offer(5, INTERFACE, instance(5)));
        env.client.connect().unwrap();
        let offers = env.client.scan().unwrap();
        let ids: Vec<u32> = offers.iter().map(|o| o.channel_id.0).collect();
        assert_eq!(ids, [1, 5]);
        assert_eq!(env.client.channel_status(ChannelId(5)), ChannelStatus::Closed);
        assert_eq!(env.client.channel_status(ChannelId(7)), ChannelStatus::NotPresent);
        assert_eq!(env.client.channel_status(ChannelId(0)), ChannelStatus::NotPresent);
        assert_eq!(env.client.channel_status(ChannelId(300)), ChannelStatus::NotPresent);
        assert_eq!(
            env.posted_types(),
            [MessageType::INITIATE_CONTACT, MessageType::REQUEST_OFFERS]
        );
    }

    #[test]
    fn channel_lifecycle() {
        let env = TestEnv::connected();
        let baseline = env.hv.memory().allocated_pages();
        let channel_id = ChannelId(1);

        let buffers = env.client.open_channel(channel_id, 4096, 4096).unwrap();
        assert_eq!(env.client.channel_status(channel_id), ChannelStatus::Open);
        assert!(env.host.is_open(channel_id));
        assert_eq!(env.host.gpadl_pfns(buffers.gpadl_id).unwrap().len(), 4);
        assert_eq!(buffers.outgoing.memory().len(), 2 * PAGE_SIZE);
        assert_eq!(buffers.incoming.memory().len(), 2 * PAGE_SIZE);

        // A second open is refused.
        assert!(matches!(
            env.client.open_channel(channel_id, 4096, 4096),
            Err(OpenError::Client(ClientError::InvalidState {
                status: ChannelStatus::Open,
                ..
            }))
        ));

        env.client.close_channel(channel_id).unwrap();
        assert_eq!(env.client.channel_status(channel_id), ChannelStatus::Closed);
        assert!(!env.host.is_open(channel_id));
        assert_eq!(env.host.gpadl_count(), 0);
        drop(buffers);
        assert_eq!(env.hv.memory().allocated_pages(), baseline);

        // Closing again is fine; unknown channels are not.
        env.client.close_channel(channel_id).unwrap();
        assert!(matches!(
            env.client.close_channel(ChannelId(9)),
            Err(ClientError::NotPresent(9))
        ));

        let types = env.posted_types();
        assert_eq!(
            types[types.len() - 4..],
            [
                MessageType::GPADL_HEADER,
                MessageType::OPEN_CHANNEL,
                MessageType::CLOSE_CHANNEL,
                MessageType::GPADL_TEARDOWN,
            ]
        );
    }

    #[test]
    fn open_validates_arguments() {
        let env = TestEnv::connected();
        assert!(matches!(
            env.client.open_channel(ChannelId(0), 4096, 4096),
            Err(OpenError::InvalidChannel(0))
        ));
        assert!(matches!(
            env.client.open_channel(ChannelId(1), 4095, 4096),
            Err(OpenError::InvalidSize)
        ));
        assert!(matches!(
            env.client.open_channel(ChannelId(1), 4096, 0),
            Err(OpenError::InvalidSize)
        ));
        assert!(matches!(
            env.client.open_channel(ChannelId(2), 4096, 4096),
            Err(OpenError::Client(ClientError::NotPresent(2)))
        ));
    }

    #[test]
    fn rejected_open_tears_down_gpadl() {
        let env = TestEnv::connected();
        env.host.set_open_status(0xc000_0001);
        assert!(matches!(
            env.client.open_channel(ChannelId(1), 4096, 4096),
            Err(OpenError::Rejected(0xc000_0001))
        ));
        assert_eq!(env.client.channel_status(ChannelId(1)), ChannelStatus::Closed);
        assert_eq!(env.host.gpadl_count(), 0);
        assert_eq!(
            env.posted_types().last(),
            Some(&MessageType::GPADL_TEARDOWN)
        );

        env.host.set_open_status(0);
        env.client.open_channel(ChannelId(1), 4096, 4096).unwrap();
    }

    #[test]
    fn gpadl_messages_match_buffer() {
        let env = TestEnv::connected();
        for pages in [1, 26, 27, 54, 55, 100] {
            env.host.clear_posted();
            let buffer = env
                .hv
                .platform()
                .dma
                .allocate_dma_buffer(pages * PAGE_SIZE)
                .unwrap();
            let gpadl_id = env.client.create_gpadl(ChannelId(1), &buffer).unwrap();
            assert_eq!(env.host.gpadl_pfns(gpadl_id).unwrap(), buffer.pfns());

            let bodies = pages.saturating_sub(26).div_ceil(28);
            let types = env.posted_types();
            assert_eq!(types.len(), 1 + bodies, "pages = {pages}");
            assert_eq!(types[0], MessageType::GPADL_HEADER);
            assert!(types[1..].iter().all(|&t| t == MessageType::GPADL_BODY));

            env.client.teardown_gpadl(ChannelId(1), gpadl_id).unwrap();
            assert_eq!(env.host.gpadl_count(), 0);
        }
    }

    #[test]
    fn gpadl_ids_are_unique() {
        let env = TestEnv::connected();
        let dma = env.hv.platform().dma;
        let a = dma.allocate_dma_buffer(PAGE_SIZE).unwrap();
        let b = dma.allocate_dma_buffer(PAGE_SIZE).unwrap();
        let id_a = env.client.create_gpadl(ChannelId(1), &a).unwrap();
        let id_b = env.client.create_gpadl(ChannelId(1), &b).unwrap();
        assert_eq!(id_a, GpadlId(protocol::FIRST_GPADL_ID));
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn rescan_keeps_open_channels() {
        let env = TestEnv::connected();
        env.host.add_offer(make_offer(2, INTERFACE, instance(2)));
        let buffers = env.client.open_channel(ChannelId(1), 4096, 4096).unwrap();
        let offers = env.client.scan().unwrap();
        let ids: Vec<u32> = offers.iter().map(|o| o.channel_id.0).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(env.client.channel_status(ChannelId(1)), ChannelStatus::Open);
        assert_eq!(env.client.channel_status(ChannelId(2)), ChannelStatus::Closed);
        assert!(env.host.is_open(ChannelId(1)));

        let buffer = env.hv.platform().dma.allocate_dma_buffer(PAGE_SIZE).unwrap();
        let gpadl_id = env.client.create_gpadl(ChannelId(1), &buffer).unwrap();
        assert_ne!(gpadl_id, buffers.gpadl_id);
        assert_eq!(env.host.gpadl_count(), 2);

        env.client.close_channel(ChannelId(1)).unwrap();
        assert!(!env.host.is_open(ChannelId(1)));
    }

    #[test]
    fn rejected_gpadl_is_torn_down() {
        let env = TestEnv::connected();
        env.host.set_gpadl_status(protocol::STATUS_UNSUCCESSFUL);
        let buffer = env.hv.platform().dma.allocate_dma_buffer(PAGE_SIZE).unwrap();
        assert!(matches!(
            env.client.create_gpadl(ChannelId(1), &buffer),
            Err(GpadlError::Rejected(protocol::STATUS_UNSUCCESSFUL))
        ));
        assert_eq!(
            env.posted_types().last(),
            Some(&MessageType::GPADL_TEARDOWN)
        );
    }

    #[test]
    fn failed_body_tears_down_gpadl() {
        let env = TestEnv::connected();
        env.host.clear_posted();
        let buffer = env
            .hv
            .platform()
            .dma
            .allocate_dma_buffer(60 * PAGE_SIZE)
            .unwrap();
        // The header and first body go through; the second body fails.
        env.host.fail_posts(2, [HvError::InvalidParameter]);
        assert!(matches!(
            env.client.create_gpadl(ChannelId(1), &buffer),
            Err(GpadlError::Client(ClientError::PostMessage(
                HvError::InvalidParameter
            )))
        ));
        assert_eq!(
            env.posted_types(),
            [
                MessageType::GPADL_HEADER,
                MessageType::GPADL_BODY,
                MessageType::GPADL_TEARDOWN
            ]
        );
        assert_eq!(env.host.gpadl_count(), 0);
    }

    #[test]
    fn failed_header_sends_nothing_else() {
        let env = TestEnv::connected();
        env.host.clear_posted();
        let buffer = env.hv.platform().dma.allocate_dma_buffer(PAGE_SIZE).unwrap();
        env.host.fail_posts(0, [HvError::AccessDenied]);
        assert!(env.client.create_gpadl(ChannelId(1), &buffer).is_err());
        assert!(env.host.posted().is_empty());
    }

    #[test]
    fn timeout_releases_wait_slot() {
        let env = TestEnv::new(
            HostConfig::default(),
            VmbusConfig {
                response_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        env.client.connect().unwrap();
        env.client.scan().unwrap();

        env.host.set_silent(MessageType::OPEN_CHANNEL, true);
        assert!(matches!(
            env.client.open_channel(ChannelId(1), 4096, 4096),
            Err(OpenError::Client(ClientError::Timeout(
                MessageType::OPEN_CHANNEL_RESULT
            )))
        ));
        assert_eq!(env.client.channel_status(ChannelId(1)), ChannelStatus::Closed);
        assert_eq!(env.host.gpadl_count(), 0);

        env.host.set_silent(MessageType::OPEN_CHANNEL, false);
        env.client.open_channel(ChannelId(1), 4096, 4096).unwrap();
    }

    #[test]
    fn transient_post_failures_are_retried() {
        let env = TestEnv::new(
            HostConfig::default(),
            VmbusConfig {
                retry: RetryStrategy {
                    attempts: 4,
                    delay: Duration::ZERO,
                },
                ..Default::default()
            },
        );
        env.host.fail_posts(0, [HvError::InsufficientBuffers; 3]);
        env.client.connect().unwrap();

        env.host.fail_posts(
            0,
            [
                HvError::InsufficientMemory,
                HvError::InsufficientBuffers,
                HvError::InsufficientMemory,
                HvError::InsufficientBuffers,
            ],
        );
        assert!(matches!(
            env.client.scan(),
            Err(ClientError::PostMessage(HvError::InsufficientBuffers))
        ));

        // Other failures are not retried.
        env.host
            .fail_posts(0, [HvError::InvalidConnectionId, HvError::InvalidConnectionId]);
        assert!(matches!(
            env.client.scan(),
            Err(ClientError::PostMessage(HvError::InvalidConnectionId))
        ));
        env.host.fail_posts(0, []);
        env.client.scan().unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        offers: Mutex<Vec<u32>>,
        rescinds: Mutex<Vec<u32>>,
        events: AtomicUsize,
        rescinded: AtomicUsize,
    }

    impl OfferObserver for Recorder {
        fn on_offer(&self, offer: &OfferChannel) {
            self.offers.lock().push(offer.channel_id.0);
        }

        fn on_rescind(&self, channel_id: ChannelId) {
            self.rescinds.lock().push(channel_id.0);
        }
    }

    impl ChannelHandler for Recorder {
        fn on_event(&self) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_rescind(&self) {
            self.rescinded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hot_add_and_rescind() {
        let env = TestEnv::connected();
        let recorder = Arc::new(Recorder::default());
        env.client.set_offer_observer(Some(recorder.clone()));

        let channel_id = ChannelId(5);
        env.host
            .offer_channel(make_offer(5, INTERFACE, instance(5)));
        wait_for(|| *recorder.offers.lock() == [5]);
        assert_eq!(env.client.channel_status(channel_id), ChannelStatus::Closed);

        let _buffers = env.client.open_channel(channel_id, 4096, 4096).unwrap();
        env.client
            .set_channel_handler(channel_id, Some(recorder.clone()))
            .unwrap();

        env.host.rescind_channel(channel_id);
        wait_for(|| *recorder.rescinds.lock() == [5]);
        assert_eq!(recorder.rescinded.load(Ordering::SeqCst), 1);
        assert!(env.client.is_rescinded(channel_id));
        assert_eq!(env.client.channel_status(channel_id), ChannelStatus::Closed);
        assert!(env.client.offers().iter().all(|o| o.channel_id != channel_id));
        assert!(matches!(
            env.client.open_channel(channel_id, 4096, 4096),
            Err(OpenError::Client(ClientError::InvalidState { .. }))
        ));

        // Freeing is only for revoked channels.
        assert!(env.client.free_channel(ChannelId(1)).is_err());
        env.client.free_channel(channel_id).unwrap();
        assert_eq!(env.host.released(), [channel_id]);
        assert_eq!(env.client.channel_status(channel_id), ChannelStatus::NotPresent);
    }

    fn check_signaling(version: Version) {
        let env = TestEnv::new(
            HostConfig {
                versions: vec![version],
                ..Default::default()
            },
            VmbusConfig {
                versions: vec![version],
                ..Default::default()
            },
        );
        env.client.connect().unwrap();
        env.client.scan().unwrap();
        let channel_id = ChannelId(1);
        let recorder = Arc::new(Recorder::default());
        env.client
            .set_channel_handler(channel_id, Some(recorder.clone()))
            .unwrap();

        assert!(matches!(
            env.client.signal_channel(channel_id),
            Err(ClientError::InvalidState { .. })
        ));
        let _buffers = env.client.open_channel(channel_id, 4096, 4096).unwrap();

        env.host.signal_guest(channel_id);
        wait_for(|| recorder.events.load(Ordering::SeqCst) == 1);

        env.client.signal_channel(channel_id).unwrap();
        let offer = env.client.offer(channel_id).unwrap();
        assert_eq!(env.host.signals(), [offer.connection_id]);
    }

    #[test]
    fn legacy_signaling() {
        check_signaling(Version::Win7);
    }

    #[test]
    fn per_channel_signaling() {
        check_signaling(Version::Win8);
    }

    #[test]
    fn disconnect_forgets_channels() {
        let env = TestEnv::connected();
        let _buffers = env.client.open_channel(ChannelId(1), 4096, 4096).unwrap();
        env.client.disconnect().unwrap();
        assert_eq!(env.client.version(), None);
        assert_eq!(env.client.channel_status(ChannelId(1)), ChannelStatus::NotPresent);
        assert_eq!(env.posted_types().last(), Some(&MessageType::UNLOAD));
        assert!(matches!(env.client.scan(), Err(ClientError::NotConnected)));
        env.client.connect().unwrap();
    }

    #[test]
    fn raw_messages() {
        let env = TestEnv::connected();
        let data = env
            .client
            .send_message_and_wait(
                &OutgoingMessage::new(&protocol::RequestOffers {}),
                MessageType::ALL_OFFERS_DELIVERED,
            )
            .unwrap();
        assert!(data.is_empty());
        env.client
            .send_message(&OutgoingMessage::new(&protocol::CloseChannel {
                channel_id: ChannelId(1),
            }))
            .unwrap();
    }
}
