// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-channel device object that sits between a [`VmbusClient`] and a
//! device specific driver.
//!
//! A [`Device`] owns the rings of one open channel. It writes and reads
//! packets, hands out transaction IDs, and correlates responses with the
//! requests waiting for them. Drivers receive channel interrupts through an
//! installed [`PacketHandler`]. [`DeviceManager`] keeps one device for every
//! offered channel.

#![forbid(unsafe_code)]

mod manager;

pub use manager::DeviceManager;

use hv1_guest::memory::MemoryBlock;
use hv1_guest::memory::PAGE_SIZE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use vmbus_client::ChannelBuffers;
use vmbus_client::ChannelHandler;
use vmbus_client::ClientError;
use vmbus_client::GpadlError;
use vmbus_client::OpenError;
use vmbus_client::VmbusClient;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::OfferChannel;
use vmbus_ring::AccessError;
use vmbus_ring::IncomingPacket;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::MemoryBlockRingBuffer;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::ReadError;
use vmbus_ring::WriteError;
use vmbus_ring::gparange::PagedRange;

/// The most ranges a single page GPA direct packet may carry.
pub const MAX_PAGE_BUFFER_COUNT: usize = 32;

/// Packet flag asking the receiver for a completion.
pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The highest transaction ID handed out before wrapping back to 1.
    pub max_transaction_id: u64,
    /// How long a request waits for its response.
    pub request_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_transaction_id: u64::MAX,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel is already open")]
    AlreadyOpen,
    #[error("a packet handler is already installed")]
    ExclusiveAccess,
    #[error("transaction id 0 is reserved")]
    ZeroTransactionId,
    #[error("transaction {0} already has a waiter")]
    TransactionInUse(u64),
    #[error("no waiter for transaction {0}")]
    NotPending(u64),
    #[error("buffer of {len} bytes cannot hold {needed} bytes")]
    BufferTooSmall { len: usize, needed: usize },
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(PacketKind),
    #[error("{0} page ranges exceed the limit")]
    TooManyRanges(usize),
    #[error("page range does not match its pages")]
    InvalidRange,
    #[error("ring buffer is full")]
    RingFull,
    #[error("ring buffer is corrupt")]
    Ring(#[source] vmbus_ring::Error),
    #[error("packet access out of bounds")]
    Access(#[from] AccessError),
    #[error("timed out waiting for transaction {0}")]
    Timeout(u64),
    #[error("wait for transaction {0} abandoned")]
    Abandoned(u64),
    #[error("failed to open channel")]
    Open(#[source] OpenError),
    #[error("failed to create gpadl")]
    Gpadl(#[source] GpadlError),
    #[error("failed to allocate buffer")]
    Allocation(#[source] anyhow::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl From<WriteError> for DeviceError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Full(_) => Self::RingFull,
            WriteError::Corrupt(err) => Self::Ring(err),
        }
    }
}

/// The type of an incoming packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketKind {
    InBand,
    Completion,
    GpaDirect,
    TransferPages,
}

impl From<&IncomingPacketType> for PacketKind {
    fn from(typ: &IncomingPacketType) -> Self {
        match typ {
            IncomingPacketType::InBand => Self::InBand,
            IncomingPacketType::Completion => Self::Completion,
            IncomingPacketType::GpaDirect(..) => Self::GpaDirect,
            IncomingPacketType::TransferPages(..) => Self::TransferPages,
        }
    }
}

/// The shape of the next incoming packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub kind: PacketKind,
    /// Descriptor and type specific header, in bytes.
    pub header_len: usize,
    /// Header plus payload, in bytes.
    pub total_len: usize,
}

impl PacketInfo {
    pub fn payload_len(&self) -> usize {
        self.total_len - self.header_len
    }
}

/// A packet read from the incoming ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub flags: u16,
    pub transaction_id: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn completion_requested(&self) -> bool {
        self.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0
    }
}

/// One range of a single page GPA direct packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageBuffer {
    pub pfn: u64,
    pub offset: u32,
    pub len: u32,
}

/// Receives the packets of a device.
pub trait PacketHandler: Send + Sync {
    /// The host signaled the channel. Implementations read packets until
    /// the ring is empty, typically with [`Device::drain_packets`].
    fn packet_ready(&self, device: &Device);

    /// Whether `packet` completes the request waiting on its transaction
    /// ID.
    fn wake_predicate(&self, _packet: &Packet) -> bool {
        true
    }
}

/// The response buffer of a waiting request.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,
    len: usize,
}

impl ResponseBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Copies as much of `data` as fits, returning the bytes copied.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.len = len;
        len
    }

    /// The full buffer. Writing through it marks all of it as filled.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.len = self.data.len();
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn into_filled(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }
}

enum Outcome {
    Completed,
    Abandoned,
}

struct RequestState {
    response: Option<ResponseBuffer>,
    outcome: Option<Outcome>,
}

struct Request {
    state: Mutex<RequestState>,
    done: Condvar,
}

impl Request {
    fn new(response_len: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RequestState {
                response: Some(ResponseBuffer::new(response_len)),
                outcome: None,
            }),
            done: Condvar::new(),
        })
    }

    fn finish(&self, outcome: Outcome) {
        self.state.lock().outcome = Some(outcome);
        self.done.notify_all();
    }
}

struct Rings {
    buffers: ChannelBuffers,
    outgoing: Mutex<OutgoingRing<MemoryBlockRingBuffer>>,
    incoming: Mutex<IncomingRing<MemoryBlockRingBuffer>>,
}

/// One VmBus channel bound to its driver.
pub struct Device {
    this: Weak<Device>,
    client: Arc<VmbusClient>,
    channel_id: ChannelId,
    offer: OfferChannel,
    config: DeviceConfig,
    rings: RwLock<Option<Arc<Rings>>>,
    handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    next_transaction_id: Mutex<u64>,
    requests: Mutex<HashMap<u64, Arc<Request>>>,
    thread_zero: Mutex<Option<Arc<Request>>>,
}

struct InterruptForwarder(Weak<Device>);

impl ChannelHandler for InterruptForwarder {
    fn on_event(&self) {
        if let Some(device) = self.0.upgrade() {
            device.on_interrupt();
        }
    }

    fn on_rescind(&self) {
        if let Some(device) = self.0.upgrade() {
            device.terminate();
        }
    }
}

impl Device {
    /// Creates the device for an offered channel. The channel stays closed.
    pub fn new(
        client: Arc<VmbusClient>,
        channel_id: ChannelId,
        config: DeviceConfig,
    ) -> Result<Arc<Self>, DeviceError> {
        let offer = client
            .offer(channel_id)
            .ok_or(ClientError::NotPresent(channel_id.0))?;
        tracing::debug!(
            channel_id = channel_id.0,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            "device attached"
        );
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            channel_id,
            offer,
            config,
            rings: RwLock::new(None),
            handler: RwLock::new(None),
            next_transaction_id: Mutex::new(1),
            requests: Mutex::new(HashMap::new()),
            thread_zero: Mutex::new(None),
        }))
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn offer(&self) -> &OfferChannel {
        &self.offer
    }

    pub fn is_open(&self) -> bool {
        self.rings.read().is_some()
    }

    /// The GPADL describing the rings of the open channel.
    pub fn ring_gpadl_id(&self) -> Option<GpadlId> {
        self.rings.read().as_ref().map(|rings| rings.buffers.gpadl_id)
    }

    /// Installs the driver's packet handler. With `register_interrupt`,
    /// channel interrupts invoke it; otherwise the driver polls with
    /// [`Self::on_interrupt`].
    pub fn install_packet_actions(
        &self,
        handler: Arc<dyn PacketHandler>,
        register_interrupt: bool,
    ) -> Result<(), DeviceError> {
        {
            let mut current = self.handler.write();
            if current.is_some() {
                return Err(DeviceError::ExclusiveAccess);
            }
            *current = Some(handler);
        }
        if register_interrupt {
            if let Err(err) = self.client.set_channel_handler(
                self.channel_id,
                Some(Arc::new(InterruptForwarder(self.this.clone()))),
            ) {
                *self.handler.write() = None;
                return Err(err.into());
            }
        }
        tracing::debug!(
            channel_id = self.channel_id.0,
            register_interrupt,
            "packet handler installed"
        );
        Ok(())
    }

    /// Opens the channel with rings of `tx_size` and `rx_size` data bytes.
    pub fn open(&self, tx_size: usize, rx_size: usize) -> Result<(), DeviceError> {
        if self.is_open() {
            return Err(DeviceError::AlreadyOpen);
        }
        let buffers = self
            .client
            .open_channel(self.channel_id, tx_size, rx_size)
            .map_err(DeviceError::Open)?;
        let rings = (|| -> Result<Rings, vmbus_ring::Error> {
            let outgoing = OutgoingRing::new(buffers.outgoing.clone())?;
            let incoming = IncomingRing::new(buffers.incoming.clone())?;
            incoming.set_interrupt_mask(false);
            Ok(Rings {
                buffers,
                outgoing: Mutex::new(outgoing),
                incoming: Mutex::new(incoming),
            })
        })();
        let rings = match rings {
            Ok(rings) => rings,
            Err(err) => {
                if let Err(close_err) = self.client.close_channel(self.channel_id) {
                    tracing::warn!(
                        channel_id = self.channel_id.0,
                        error = &close_err as &dyn std::error::Error,
                        "failed to close channel after ring setup failure"
                    );
                }
                return Err(DeviceError::Ring(err));
            }
        };
        *self.rings.write() = Some(Arc::new(rings));
        tracing::info!(
            channel_id = self.channel_id.0,
            tx_size,
            rx_size,
            "device channel open"
        );
        // The host may have written before the rings were attached.
        self.on_interrupt();
        Ok(())
    }

    /// Closes the channel. Waiting requests are abandoned.
    pub fn close(&self) -> Result<(), DeviceError> {
        let Some(_rings) = self.rings.write().take() else {
            return Ok(());
        };
        self.abandon_requests();
        self.client.close_channel(self.channel_id)?;
        tracing::info!(channel_id = self.channel_id.0, "device channel closed");
        Ok(())
    }

    /// The host revoked the channel; its rings are gone.
    fn terminate(&self) {
        self.rings.write().take();
        self.abandon_requests();
        tracing::info!(channel_id = self.channel_id.0, "device terminated");
    }

    fn abandon_requests(&self) {
        let requests: Vec<_> = self.requests.lock().drain().collect();
        for (id, request) in requests {
            tracing::debug!(channel_id = self.channel_id.0, id, "abandoning request");
            request.finish(Outcome::Abandoned);
        }
    }

    /// Allocates a zeroed buffer of at least `len` bytes and describes it to
    /// the host.
    pub fn create_gpadl_buffer(&self, len: usize) -> Result<(GpadlId, MemoryBlock), DeviceError> {
        let len = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let buffer = self
            .client
            .allocate_dma_buffer(len)
            .map_err(DeviceError::Allocation)?;
        let gpadl_id = self
            .client
            .create_gpadl(self.channel_id, &buffer)
            .map_err(DeviceError::Gpadl)?;
        Ok((gpadl_id, buffer))
    }

    pub fn teardown_gpadl_buffer(&self, gpadl_id: GpadlId) -> Result<(), DeviceError> {
        Ok(self.client.teardown_gpadl(self.channel_id, gpadl_id)?)
    }

    /// Returns the next transaction ID, skipping 0.
    pub fn next_transaction_id(&self) -> u64 {
        let mut next = self.next_transaction_id.lock();
        let id = *next;
        *next = if id >= self.config.max_transaction_id.max(1) {
            1
        } else {
            id + 1
        };
        id
    }

    /// Dispatches a channel interrupt to the packet handler. Without a
    /// handler the packets stay in the ring.
    pub fn on_interrupt(&self) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.packet_ready(self),
            None => tracing::trace!(channel_id = self.channel_id.0, "no packet handler"),
        }
    }

    fn rings(&self) -> Result<Arc<Rings>, DeviceError> {
        self.rings.read().clone().ok_or(DeviceError::NotOpen)
    }

    fn signal(&self) -> Result<(), DeviceError> {
        Ok(self.client.signal_channel(self.channel_id)?)
    }

    fn write_to_ring(
        &self,
        typ: OutgoingPacketType<'_>,
        transaction_id: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let rings = self.rings()?;
        let signal = {
            let ring = rings.outgoing.lock();
            let mut cursor = ring.outgoing().map_err(DeviceError::Ring)?;
            let range = ring.write(
                &mut cursor,
                &OutgoingPacket {
                    transaction_id,
                    size: data.len(),
                    typ,
                },
            )?;
            range.write(&*ring, data)?;
            ring.commit_write(&mut cursor)
        };
        tracing::trace!(
            channel_id = self.channel_id.0,
            transaction_id,
            len = data.len(),
            signal,
            "packet written"
        );
        if signal {
            self.signal()?;
        }
        Ok(())
    }

    /// Writes a packet and, with `response_len`, waits for the response to
    /// `transaction_id`.
    fn write_packet(
        &self,
        typ: OutgoingPacketType<'_>,
        transaction_id: u64,
        data: &[u8],
        response_len: Option<usize>,
    ) -> Result<Option<Vec<u8>>, DeviceError> {
        if transaction_id == 0 {
            return Err(DeviceError::ZeroTransactionId);
        }
        let Some(response_len) = response_len else {
            self.write_to_ring(typ, transaction_id, data)?;
            return Ok(None);
        };
        let request = self.register(transaction_id, response_len)?;
        if let Err(err) = self.write_to_ring(typ, transaction_id, data) {
            self.unregister(transaction_id, &request);
            return Err(err);
        }
        self.wait(transaction_id, &request, self.config.request_timeout)
            .map(Some)
    }

    /// Writes an inband packet with the next transaction ID and returns the
    /// ID used.
    pub fn write_inband(&self, data: &[u8], response_required: bool) -> Result<u64, DeviceError> {
        let transaction_id = self.next_transaction_id();
        self.write_inband_with_transaction_id(data, transaction_id, response_required)?;
        Ok(transaction_id)
    }

    pub fn write_inband_with_transaction_id(
        &self,
        data: &[u8],
        transaction_id: u64,
        response_required: bool,
    ) -> Result<(), DeviceError> {
        let typ = if response_required {
            OutgoingPacketType::InBandWithCompletion
        } else {
            OutgoingPacketType::InBandNoCompletion
        };
        self.write_packet(typ, transaction_id, data, None)?;
        Ok(())
    }

    /// Writes an inband request and waits for its response, returning the
    /// number of bytes copied to `response`.
    pub fn write_inband_and_wait(
        &self,
        data: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DeviceError> {
        let transaction_id = self.next_transaction_id();
        let filled = self
            .write_packet(
                OutgoingPacketType::InBandWithCompletion,
                transaction_id,
                data,
                Some(response.len()),
            )?
            .unwrap_or_default();
        response[..filled.len()].copy_from_slice(&filled);
        Ok(filled.len())
    }

    /// Completes a host request.
    pub fn write_completion(&self, transaction_id: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.write_packet(OutgoingPacketType::Completion, transaction_id, data, None)?;
        Ok(())
    }

    /// Writes a packet referencing up to [`MAX_PAGE_BUFFER_COUNT`] ranges,
    /// each within one page. With `response`, waits for the completion and
    /// returns the bytes copied to it.
    pub fn write_gpa_direct_single_page(
        &self,
        data: &[u8],
        pages: &[PageBuffer],
        response: Option<&mut [u8]>,
    ) -> Result<usize, DeviceError> {
        if pages.len() > MAX_PAGE_BUFFER_COUNT {
            return Err(DeviceError::TooManyRanges(pages.len()));
        }
        let ranges = pages
            .iter()
            .map(|page| {
                PagedRange::new(
                    page.offset as usize,
                    page.len as usize,
                    std::slice::from_ref(&page.pfn),
                )
                .ok_or(DeviceError::InvalidRange)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.write_gpa_direct(&ranges, data, response)
    }

    /// Writes a packet referencing `len` bytes starting `offset` bytes into
    /// the first of `pfns`.
    pub fn write_gpa_direct_multi_page(
        &self,
        data: &[u8],
        offset: usize,
        len: usize,
        pfns: &[u64],
        response: Option<&mut [u8]>,
    ) -> Result<usize, DeviceError> {
        let range = PagedRange::new(offset, len, pfns).ok_or(DeviceError::InvalidRange)?;
        self.write_gpa_direct(&[range], data, response)
    }

    fn write_gpa_direct(
        &self,
        ranges: &[PagedRange<'_>],
        data: &[u8],
        response: Option<&mut [u8]>,
    ) -> Result<usize, DeviceError> {
        let transaction_id = self.next_transaction_id();
        let filled = self.write_packet(
            OutgoingPacketType::GpaDirect(ranges),
            transaction_id,
            data,
            response.as_ref().map(|r| r.len()),
        )?;
        match (response, filled) {
            (Some(response), Some(filled)) => {
                response[..filled.len()].copy_from_slice(&filled);
                Ok(filled.len())
            }
            _ => Ok(0),
        }
    }

    /// Looks at the next incoming packet and, if `f` asks for it, consumes
    /// it.
    fn with_next_packet<R>(
        &self,
        f: impl FnOnce(
            &IncomingRing<MemoryBlockRingBuffer>,
            &IncomingPacket,
        ) -> Result<(R, bool), DeviceError>,
    ) -> Result<Option<R>, DeviceError> {
        let rings = self.rings()?;
        let (result, signal) = {
            let ring = rings.incoming.lock();
            let mut cursor = ring.incoming().map_err(DeviceError::Ring)?;
            let packet = match ring.read(&mut cursor) {
                Ok(packet) => packet,
                Err(ReadError::Empty) => return Ok(None),
                Err(ReadError::Corrupt(err)) => return Err(DeviceError::Ring(err)),
            };
            let (result, consume) = f(&*ring, &packet)?;
            let signal = if consume {
                ring.commit_read(&mut cursor)
            } else {
                cursor.revert();
                false
            };
            (result, signal)
        };
        if signal {
            self.signal()?;
        }
        Ok(Some(result))
    }

    /// The shape of the next packet, or `None` if the ring is empty.
    pub fn next_packet_available(&self) -> Result<Option<PacketInfo>, DeviceError> {
        self.with_next_packet(|_, packet| {
            let info = PacketInfo {
                kind: (&packet.typ).into(),
                header_len: packet.header.len(),
                total_len: packet.header.len() + packet.payload.len(),
            };
            Ok((info, false))
        })
    }

    /// The payload length of the next packet if it is inband.
    pub fn next_inband_packet_available(&self) -> Result<Option<usize>, DeviceError> {
        Ok(self
            .next_packet_available()?
            .filter(|info| info.kind == PacketKind::InBand)
            .map(|info| info.payload_len()))
    }

    /// Copies the next packet, descriptor included, into `buf` and returns
    /// its length. A packet larger than `buf` is left in the ring unless
    /// `truncate` is set.
    pub fn read_raw(&self, buf: &mut [u8], truncate: bool) -> Result<Option<usize>, DeviceError> {
        self.with_next_packet(|ring, packet| {
            let total = packet.header.len() + packet.payload.len();
            if total > buf.len() && !truncate {
                return Err(DeviceError::BufferTooSmall {
                    len: buf.len(),
                    needed: total,
                });
            }
            let header_len = packet.header.len().min(buf.len());
            let payload_len = packet.payload.len().min(buf.len() - header_len);
            packet.header.read(ring, &mut buf[..header_len])?;
            packet
                .payload
                .read(ring, &mut buf[header_len..header_len + payload_len])?;
            Ok((header_len + payload_len, true))
        })
    }

    /// Copies the payload of the next inband or completion packet into
    /// `buf`, returning the bytes copied and the packet's transaction ID.
    /// Other packet types are consumed and reported as unexpected.
    pub fn read_inband_completion(
        &self,
        buf: &mut [u8],
        truncate: bool,
    ) -> Result<Option<(usize, u64)>, DeviceError> {
        let result = self.with_next_packet(|ring, packet| {
            let kind = PacketKind::from(&packet.typ);
            if !matches!(kind, PacketKind::InBand | PacketKind::Completion) {
                return Ok((Err(DeviceError::UnexpectedPacket(kind)), true));
            }
            let len = packet.payload.len();
            if len > buf.len() && !truncate {
                return Err(DeviceError::BufferTooSmall {
                    len: buf.len(),
                    needed: len,
                });
            }
            let len = len.min(buf.len());
            packet.payload.read(ring, &mut buf[..len])?;
            Ok((Ok((len, packet.descriptor.transaction_id)), true))
        })?;
        result.transpose()
    }

    /// Reads the next packet.
    pub fn read_packet(&self) -> Result<Option<Packet>, DeviceError> {
        self.with_next_packet(|ring, packet| {
            let packet = Packet {
                kind: (&packet.typ).into(),
                flags: packet.descriptor.flags,
                transaction_id: packet.descriptor.transaction_id,
                payload: packet.payload.read_all(ring),
            };
            Ok((packet, true))
        })
    }

    /// Reads every available packet, completing waiting requests and
    /// passing the rest to `f`.
    pub fn drain_packets(&self, mut f: impl FnMut(Packet)) -> Result<(), DeviceError> {
        while let Some(packet) = self.read_packet()? {
            if !self.complete_transaction(&packet) {
                f(packet);
            }
        }
        Ok(())
    }

    /// Completes the request waiting on `packet`'s transaction ID if the
    /// packet handler agrees. Returns whether a request was woken.
    pub fn complete_transaction(&self, packet: &Packet) -> bool {
        let handler = self.handler.read().clone();
        if handler.is_some_and(|handler| !handler.wake_predicate(packet)) {
            return false;
        }
        self.get_pending_transaction(packet.transaction_id, |response| {
            response.fill(&packet.payload);
        })
        .is_some()
            && self.wake_transaction(packet.transaction_id)
    }

    /// Runs `f` on the response buffer of the request waiting on
    /// `transaction_id`.
    pub fn get_pending_transaction<R>(
        &self,
        transaction_id: u64,
        f: impl FnOnce(&mut ResponseBuffer) -> R,
    ) -> Option<R> {
        let request = self.requests.lock().get(&transaction_id).cloned()?;
        let mut state = request.state.lock();
        state.response.as_mut().map(f)
    }

    /// Wakes the request waiting on `transaction_id`. Returns false if there
    /// is none.
    pub fn wake_transaction(&self, transaction_id: u64) -> bool {
        let Some(request) = self.requests.lock().remove(&transaction_id) else {
            tracing::debug!(
                channel_id = self.channel_id.0,
                transaction_id,
                "no waiter to wake"
            );
            return false;
        };
        request.finish(Outcome::Completed);
        true
    }

    /// Registers a wait on transaction 0 without sending anything, for
    /// messages the host pushes unprompted.
    pub fn prepare_thread_zero(&self, response_len: usize) -> Result<(), DeviceError> {
        let request = self.register(0, response_len)?;
        *self.thread_zero.lock() = Some(request);
        Ok(())
    }

    /// Waits for the push prepared by [`Self::prepare_thread_zero`] and
    /// returns its payload.
    pub fn wait_thread_zero(&self, timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let request = self
            .thread_zero
            .lock()
            .take()
            .ok_or(DeviceError::NotPending(0))?;
        self.wait(0, &request, timeout)
    }

    fn register(
        &self,
        transaction_id: u64,
        response_len: usize,
    ) -> Result<Arc<Request>, DeviceError> {
        let mut requests = self.requests.lock();
        if requests.contains_key(&transaction_id) {
            return Err(DeviceError::TransactionInUse(transaction_id));
        }
        let request = Request::new(response_len);
        requests.insert(transaction_id, request.clone());
        Ok(request)
    }

    /// Removes `request` if it is still registered. Returns whether it was.
    fn unregister(&self, transaction_id: u64, request: &Arc<Request>) -> bool {
        let mut requests = self.requests.lock();
        if requests
            .get(&transaction_id)
            .is_some_and(|r| Arc::ptr_eq(r, request))
        {
            requests.remove(&transaction_id);
            true
        } else {
            false
        }
    }

    fn wait(
        &self,
        transaction_id: u64,
        request: &Arc<Request>,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = request.state.lock();
        while state.outcome.is_none() {
            if request.done.wait_until(&mut state, deadline).timed_out() && state.outcome.is_none()
            {
                drop(state);
                if self.unregister(transaction_id, request) {
                    tracing::warn!(
                        channel_id = self.channel_id.0,
                        transaction_id,
                        "request timed out"
                    );
                    return Err(DeviceError::Timeout(transaction_id));
                }
                // Already removed by a waker that is about to finish it.
                state = request.state.lock();
                while state.outcome.is_none() {
                    request.done.wait(&mut state);
                }
            }
        }
        if !matches!(state.outcome, Some(Outcome::Completed)) {
            return Err(DeviceError::Abandoned(transaction_id));
        }
        Ok(state
            .response
            .take()
            .map(ResponseBuffer::into_filled)
            .unwrap_or_default())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(rings) = self.rings.get_mut().take() {
            drop(rings);
            if let Err(err) = self.client.close_channel(self.channel_id) {
                tracing::warn!(
                    channel_id = self.channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to close channel"
                );
            }
        }
    }
}
