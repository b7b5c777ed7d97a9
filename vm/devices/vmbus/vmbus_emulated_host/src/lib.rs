// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A VMBus host for tests.
//!
//! [`EmulatedHost`] is the [`HostHandler`] of an [`EmulatedHypervisor`]. It
//! answers the guest's control messages the way a Hyper-V host does, records
//! everything the guest posts, and gives tests the host end of every opened
//! channel's ring buffers.

#![forbid(unsafe_code)]

use anyhow::Context;
use guid::Guid;
use hv1_guest::emulated::EmulatedHypervisor;
use hv1_guest::emulated::HostHandler;
use hvdef::HvError;
use hvdef::HvMessageType;
use hvdef::HvResult;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use vmbus_core::OutgoingMessage;
use vmbus_core::gpadl::GpadlAssembler;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::Version;
use vmbus_core::protocol::VmbusMessage;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::MemoryBlockRingBuffer;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::ReadError;
use vmbus_ring::gparange;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The processor the host targets for every message and event.
const TARGET_CPU: u32 = 0;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// The versions the host accepts.
    pub versions: Vec<Version>,
    /// The message connection ID returned to guests that negotiate 5.0 or
    /// newer.
    pub message_connection_id: u32,
    /// The SINT messages are delivered to until the guest names one.
    pub message_sint: u8,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            versions: vec![Version::V1, Version::Win7],
            message_connection_id: protocol::VMBUS_MESSAGE_CONNECTION_ID_4,
            message_sint: 2,
        }
    }
}

/// Builds an offer for `channel_id` with a connection ID derived from it.
pub fn make_offer(channel_id: u32, interface_id: Guid, instance_id: Guid) -> OfferChannel {
    OfferChannel {
        interface_id,
        instance_id,
        rsvd: [0; 4],
        flags: 0,
        mmio_megabytes: 0,
        user_defined: protocol::UserDefinedData::default(),
        subchannel_index: 0,
        mmio_megabytes_optional: 0,
        channel_id: ChannelId(channel_id),
        monitor_id: 0xff,
        monitor_allocated: 0,
        is_dedicated: 1,
        connection_id: 0x2000 + channel_id,
    }
}

/// A packet the guest wrote to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPacket {
    pub kind: PacketKind,
    pub transaction_id: Option<u64>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    InBand,
    Completion,
    GpaDirect(Vec<HostRange>),
    TransferPages { set_id: u16, count: u32 },
}

/// One range of a GPA direct packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRange {
    pub offset: usize,
    pub len: usize,
    pub gpns: Vec<u64>,
}

/// Called when the guest signals a channel, from within the guest's
/// hypercall.
pub type PacketHandler = Arc<dyn Fn(&EmulatedHost, ChannelId) + Send + Sync>;

struct HostRings {
    incoming: IncomingRing<MemoryBlockRingBuffer>,
    outgoing: OutgoingRing<MemoryBlockRingBuffer>,
}

struct HostChannel {
    offer: OfferChannel,
    rings: Option<HostRings>,
    handler: Option<PacketHandler>,
}

struct HostState {
    version: Option<Version>,
    connection_id: Option<u32>,
    message_sint: u8,
    interrupt_page: Option<u64>,
    channels: BTreeMap<u32, HostChannel>,
    gpadl_in_progress: Option<GpadlAssembler>,
    gpadls: HashMap<GpadlId, Vec<u64>>,
    posted: Vec<(u32, OutgoingMessage)>,
    signals: Vec<u32>,
    released: Vec<ChannelId>,
    silent: HashSet<MessageType>,
    gpadl_status: i32,
    open_status: u32,
    post_failures: VecDeque<HvError>,
    posts_before_failure: usize,
}

/// The host end of the emulated VMBus.
pub struct EmulatedHost {
    hv: Weak<EmulatedHypervisor>,
    config: HostConfig,
    state: Mutex<HostState>,
    posted: Condvar,
}

fn reply<T: VmbusMessage + IntoBytes + Immutable + KnownLayout>(message: &T) -> Vec<u8> {
    OutgoingMessage::new(message).data().to_vec()
}

impl EmulatedHost {
    /// Creates a host and installs it as `hv`'s message and event handler.
    pub fn attach(hv: &Arc<EmulatedHypervisor>, config: HostConfig) -> Arc<Self> {
        let host = Arc::new(Self {
            hv: Arc::downgrade(hv),
            state: Mutex::new(HostState {
                version: None,
                connection_id: None,
                message_sint: config.message_sint,
                interrupt_page: None,
                channels: BTreeMap::new(),
                gpadl_in_progress: None,
                gpadls: HashMap::new(),
                posted: Vec::new(),
                signals: Vec::new(),
                released: Vec::new(),
                silent: HashSet::new(),
                gpadl_status: protocol::STATUS_SUCCESS,
                open_status: 0,
                post_failures: VecDeque::new(),
                posts_before_failure: 0,
            }),
            config,
            posted: Condvar::new(),
        });
        hv.set_host(host.clone());
        host
    }

    /// Adds a channel that is offered when the guest requests offers.
    pub fn add_offer(&self, offer: OfferChannel) {
        self.state.lock().channels.insert(
            offer.channel_id.0,
            HostChannel {
                offer,
                rings: None,
                handler: None,
            },
        );
    }

    /// Offers a channel to a connected guest.
    pub fn offer_channel(&self, offer: OfferChannel) {
        self.add_offer(offer);
        self.send(reply(&offer));
    }

    /// Revokes a channel. The channel ID stays in use until the guest
    /// releases it.
    pub fn rescind_channel(&self, channel_id: ChannelId) {
        if let Some(channel) = self.state.lock().channels.get_mut(&channel_id.0) {
            channel.rings = None;
        }
        self.send(reply(&protocol::RescindChannelOffer { channel_id }));
    }

    /// The negotiated version, if connected.
    pub fn version(&self) -> Option<Version> {
        self.state.lock().version
    }

    /// Every control message the guest posted, with its connection ID.
    pub fn posted(&self) -> Vec<(u32, OutgoingMessage)> {
        self.state.lock().posted.clone()
    }

    /// The posted control messages, without connection IDs.
    pub fn posted_messages(&self) -> Vec<OutgoingMessage> {
        self.state
            .lock()
            .posted
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn clear_posted(&self) {
        self.state.lock().posted.clear();
    }

    /// Waits until at least `count` messages have been posted.
    pub fn wait_for_posted(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.posted.len() < count {
            if self.posted.wait_until(&mut state, deadline).timed_out() {
                return state.posted.len() >= count;
            }
        }
        true
    }

    /// The connection IDs the guest signaled, in order.
    pub fn signals(&self) -> Vec<u32> {
        self.state.lock().signals.clone()
    }

    /// The channels the guest released after a rescind.
    pub fn released(&self) -> Vec<ChannelId> {
        self.state.lock().released.clone()
    }

    /// Stops (or resumes) answering messages of type `typ`.
    pub fn set_silent(&self, typ: MessageType, silent: bool) {
        let mut state = self.state.lock();
        if silent {
            state.silent.insert(typ);
        } else {
            state.silent.remove(&typ);
        }
    }

    /// The status returned in `GpadlCreated`.
    pub fn set_gpadl_status(&self, status: i32) {
        self.state.lock().gpadl_status = status;
    }

    /// The status returned in `OpenResult`.
    pub fn set_open_status(&self, status: u32) {
        self.state.lock().open_status = status;
    }

    /// Lets `after` more post message hypercalls through, then fails the
    /// following ones with `errors`, in order.
    pub fn fail_posts(&self, after: usize, errors: impl IntoIterator<Item = HvError>) {
        let mut state = self.state.lock();
        state.posts_before_failure = after;
        state.post_failures = errors.into_iter().collect();
    }

    pub fn set_packet_handler(&self, channel_id: ChannelId, handler: PacketHandler) {
        if let Some(channel) = self.state.lock().channels.get_mut(&channel_id.0) {
            channel.handler = Some(handler);
        }
    }

    pub fn is_open(&self, channel_id: ChannelId) -> bool {
        self.state
            .lock()
            .channels
            .get(&channel_id.0)
            .is_some_and(|channel| channel.rings.is_some())
    }

    /// The pages of a registered GPADL.
    pub fn gpadl_pfns(&self, gpadl_id: GpadlId) -> Option<Vec<u64>> {
        self.state.lock().gpadls.get(&gpadl_id).cloned()
    }

    pub fn gpadl_count(&self) -> usize {
        self.state.lock().gpadls.len()
    }

    /// Reads every packet the guest has written to `channel_id`.
    pub fn read_packets(&self, channel_id: ChannelId) -> Vec<HostPacket> {
        let mut packets = Vec::new();
        let signal = {
            let state = self.state.lock();
            let Some(rings) = state
                .channels
                .get(&channel_id.0)
                .and_then(|channel| channel.rings.as_ref())
            else {
                return packets;
            };
            let ring = &rings.incoming;
            let Ok(mut cursor) = ring.incoming() else {
                return packets;
            };
            let mut signal = false;
            loop {
                let packet = match ring.read(&mut cursor) {
                    Ok(packet) => packet,
                    Err(ReadError::Empty) => {
                        // A write that raced with the commit did not signal.
                        signal |= ring.commit_read(&mut cursor);
                        if ring.can_read(&mut cursor).unwrap_or(false) {
                            continue;
                        }
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            channel_id = channel_id.0,
                            error = &err as &dyn std::error::Error,
                            "corrupt guest ring"
                        );
                        break;
                    }
                };
                let kind = match packet.typ {
                    IncomingPacketType::InBand => PacketKind::InBand,
                    IncomingPacketType::Completion => PacketKind::Completion,
                    IncomingPacketType::GpaDirect(count, range) => {
                        let values: Vec<u64> = range
                            .read_all(ring)
                            .chunks_exact(8)
                            .map(|v| u64::from_le_bytes(v.try_into().unwrap_or_default()))
                            .collect();
                        let ranges = gparange::parse_ranges(count as usize, &values)
                            .unwrap_or_default()
                            .iter()
                            .map(|range| HostRange {
                                offset: range.offset(),
                                len: range.len(),
                                gpns: range.gpns().to_vec(),
                            })
                            .collect();
                        PacketKind::GpaDirect(ranges)
                    }
                    IncomingPacketType::TransferPages(set_id, count, _) => {
                        PacketKind::TransferPages { set_id, count }
                    }
                };
                packets.push(HostPacket {
                    kind,
                    transaction_id: packet.transaction_id,
                    payload: packet.payload.read_all(ring),
                });
            }
            signal | ring.commit_read(&mut cursor)
        };
        if signal {
            self.signal_guest(channel_id);
        }
        packets
    }

    /// Writes a packet to the guest and signals it if needed.
    pub fn write_packet(
        &self,
        channel_id: ChannelId,
        typ: OutgoingPacketType<'_>,
        transaction_id: u64,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let signal = {
            let state = self.state.lock();
            let rings = state
                .channels
                .get(&channel_id.0)
                .and_then(|channel| channel.rings.as_ref())
                .with_context(|| format!("channel {} is not open", channel_id.0))?;
            let ring = &rings.outgoing;
            let mut cursor = ring.outgoing()?;
            ring.write(
                &mut cursor,
                &OutgoingPacket {
                    transaction_id,
                    size: payload.len(),
                    typ,
                },
            )?
            .write(ring, payload)?;
            ring.commit_write(&mut cursor)
        };
        if signal {
            self.signal_guest(channel_id);
        }
        Ok(())
    }

    /// Interrupts the guest for `channel_id` the way the negotiated version
    /// expects.
    pub fn signal_guest(&self, channel_id: ChannelId) {
        let Some(hv) = self.hv.upgrade() else {
            return;
        };
        let (legacy_page, sint) = {
            let state = self.state.lock();
            let legacy = state
                .version
                .is_some_and(|version| version.uses_legacy_event_flags());
            (
                state.interrupt_page.filter(|_| legacy),
                state.message_sint,
            )
        };
        match legacy_page {
            Some(page) => {
                let gpa = page + (channel_id.0 / 32 * 4) as u64;
                if let Some(word) = hv.memory().atomic_u32(gpa) {
                    word.fetch_or(1 << (channel_id.0 % 32), Ordering::SeqCst);
                }
                hv.signal_guest_event(TARGET_CPU, sint, 0);
            }
            None => hv.signal_guest_event(TARGET_CPU, sint, channel_id.0),
        }
    }

    fn send(&self, data: Vec<u8>) {
        let sint = self.state.lock().message_sint;
        if let Some(hv) = self.hv.upgrade() {
            hv.inject_message(TARGET_CPU, sint, HvMessageType::HvMessageTypeChannel, &data);
        }
    }

    fn handle_message(&self, state: &mut HostState, data: &[u8]) -> Vec<Vec<u8>> {
        let message = match Message::parse(data, state.version) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "host dropped guest message"
                );
                return Vec::new();
            }
        };
        if state.silent.contains(&message.message_type()) {
            tracing::debug!(typ = ?message.message_type(), "host not answering");
            return Vec::new();
        }

        match message {
            Message::InitiateContact(request, _) => {
                vec![reply(&self.initiate_contact(state, &request))]
            }
            Message::RequestOffers(..) => {
                let mut replies: Vec<_> = state
                    .channels
                    .values()
                    .map(|channel| reply(&channel.offer))
                    .collect();
                replies.push(reply(&protocol::AllOffersDelivered {}));
                replies
            }
            Message::GpadlHeader(header, data) => match GpadlAssembler::new(&header, data) {
                Ok(assembler) if assembler.is_complete() => {
                    vec![Self::finish_gpadl(state, assembler)]
                }
                Ok(assembler) => {
                    state.gpadl_in_progress = Some(assembler);
                    Vec::new()
                }
                Err(err) => {
                    tracing::warn!(error = &err as &dyn std::error::Error, "bad gpadl header");
                    vec![reply(&protocol::GpadlCreated {
                        channel_id: header.channel_id,
                        gpadl_id: header.gpadl_id,
                        status: protocol::STATUS_UNSUCCESSFUL,
                    })]
                }
            },
            Message::GpadlBody(body, data) => {
                let Some(mut assembler) = state
                    .gpadl_in_progress
                    .take()
                    .filter(|assembler| assembler.gpadl_id == body.gpadl_id)
                else {
                    tracing::warn!(gpadl_id = body.gpadl_id.0, "gpadl body without header");
                    return Vec::new();
                };
                if let Err(err) = assembler.add_body(data) {
                    tracing::warn!(error = &err as &dyn std::error::Error, "bad gpadl body");
                    return vec![reply(&protocol::GpadlCreated {
                        channel_id: assembler.channel_id,
                        gpadl_id: assembler.gpadl_id,
                        status: protocol::STATUS_UNSUCCESSFUL,
                    })];
                }
                if assembler.is_complete() {
                    vec![Self::finish_gpadl(state, assembler)]
                } else {
                    state.gpadl_in_progress = Some(assembler);
                    Vec::new()
                }
            }
            Message::GpadlTeardown(request, _) => {
                state.gpadls.remove(&request.gpadl_id);
                if state
                    .gpadl_in_progress
                    .as_ref()
                    .is_some_and(|assembler| assembler.gpadl_id == request.gpadl_id)
                {
                    state.gpadl_in_progress = None;
                }
                vec![reply(&protocol::GpadlTorndown {
                    gpadl_id: request.gpadl_id,
                })]
            }
            Message::OpenChannel(request, _) => {
                let status = if state.open_status != 0 {
                    state.open_status
                } else {
                    match self.map_rings(state, &request) {
                        Some(rings) => {
                            if let Some(channel) = state.channels.get_mut(&request.channel_id.0) {
                                channel.rings = Some(rings);
                            }
                            0
                        }
                        None => protocol::STATUS_UNSUCCESSFUL as u32,
                    }
                };
                vec![reply(&protocol::OpenResult {
                    channel_id: request.channel_id,
                    open_id: request.open_id,
                    status,
                })]
            }
            Message::CloseChannel(request, _) => {
                if let Some(channel) = state.channels.get_mut(&request.channel_id.0) {
                    channel.rings = None;
                }
                Vec::new()
            }
            Message::RelIdReleased(request, _) => {
                state.channels.remove(&request.channel_id.0);
                state.released.push(request.channel_id);
                Vec::new()
            }
            Message::Unload(..) => {
                state.version = None;
                state.connection_id = None;
                state.channels.values_mut().for_each(|channel| channel.rings = None);
                vec![reply(&protocol::UnloadComplete {})]
            }
            message => {
                tracing::warn!(typ = ?message.message_type(), "unexpected guest message");
                Vec::new()
            }
        }
    }

    fn initiate_contact(
        &self,
        state: &mut HostState,
        request: &protocol::InitiateContact,
    ) -> protocol::VersionResponse {
        let accepted = Version::try_from(request.version_requested)
            .ok()
            .filter(|version| self.config.versions.contains(version));
        let Some(version) = accepted else {
            tracing::debug!(
                version = request.version_requested,
                "host rejected version"
            );
            return protocol::VersionResponse {
                version_supported: 0,
                connection_state: protocol::ConnectionState::SUCCESSFUL,
                padding: 0,
                selected_version_or_connection_id: 0,
            };
        };

        state.version = Some(version);
        let selected = if version.uses_target_info() {
            let target = protocol::TargetInfo::from(request.interrupt_page_or_target_info);
            state.message_sint = target.sint();
            state.interrupt_page = None;
            state.connection_id = Some(self.config.message_connection_id);
            self.config.message_connection_id
        } else {
            state.interrupt_page = Some(request.interrupt_page_or_target_info);
            state.connection_id = Some(protocol::VMBUS_MESSAGE_CONNECTION_ID);
            0
        };
        tracing::debug!(?version, "host accepted version");
        protocol::VersionResponse {
            version_supported: 1,
            connection_state: protocol::ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: selected,
        }
    }

    fn finish_gpadl(state: &mut HostState, assembler: GpadlAssembler) -> Vec<u8> {
        let mut status = state.gpadl_status;
        if status == protocol::STATUS_SUCCESS {
            match assembler.ranges().as_deref() {
                Ok([range]) => {
                    state.gpadls.insert(assembler.gpadl_id, range.pfns.clone());
                }
                _ => status = protocol::STATUS_UNSUCCESSFUL,
            }
        }
        reply(&protocol::GpadlCreated {
            channel_id: assembler.channel_id,
            gpadl_id: assembler.gpadl_id,
            status,
        })
    }

    fn map_rings(&self, state: &HostState, request: &protocol::OpenChannel) -> Option<HostRings> {
        let hv = self.hv.upgrade()?;
        let pfns = state.gpadls.get(&request.ring_buffer_gpadl_id)?;
        let split = request.downstream_ring_buffer_page_offset as usize;
        if split < 2 || pfns.len() < split + 2 {
            return None;
        }
        // The guest's outgoing ring comes first.
        let incoming =
            IncomingRing::new(MemoryBlockRingBuffer::new(hv.memory().map_pfns(&pfns[..split])?))
                .ok()?;
        incoming.set_interrupt_mask(false);
        let outgoing =
            OutgoingRing::new(MemoryBlockRingBuffer::new(hv.memory().map_pfns(&pfns[split..])?))
                .ok()?;
        Some(HostRings { incoming, outgoing })
    }
}

impl HostHandler for EmulatedHost {
    fn post_message(&self, connection_id: u32, message_type: u32, data: &[u8]) -> HvResult<()> {
        let replies = {
            let mut state = self.state.lock();
            if state.posts_before_failure > 0 {
                state.posts_before_failure -= 1;
            } else if let Some(err) = state.post_failures.pop_front() {
                return Err(err);
            }
            if message_type != protocol::VMBUS_MESSAGE_TYPE {
                return Err(HvError::InvalidParameter);
            }
            let message = OutgoingMessage::from_message(data);
            let initiate = message.message_type() == MessageType::INITIATE_CONTACT;
            if !initiate && state.connection_id.is_some_and(|id| id != connection_id) {
                return Err(HvError::InvalidConnectionId);
            }
            state.posted.push((connection_id, message));
            self.posted.notify_all();
            self.handle_message(&mut state, data)
        };
        for reply in replies {
            self.send(reply);
        }
        Ok(())
    }

    fn signal_event(&self, connection_id: u32, _flag_number: u16) -> HvResult<()> {
        let target = {
            let mut state = self.state.lock();
            state.signals.push(connection_id);
            state
                .channels
                .values()
                .find(|channel| channel.offer.connection_id == connection_id)
                .map(|channel| (channel.offer.channel_id, channel.handler.clone()))
        };
        match target {
            Some((channel_id, Some(handler))) => handler(self, channel_id),
            Some((_, None)) => {}
            None => return Err(HvError::InvalidConnectionId),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;
    use zerocopy::FromBytes;

    fn initiate(version: Version, interrupt_page: u64) -> OutgoingMessage {
        OutgoingMessage::new(&protocol::InitiateContact {
            version_requested: version as u32,
            target_message_vp: 0,
            interrupt_page_or_target_info: interrupt_page,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        })
    }

    #[test]
    fn negotiates_configured_versions_only() {
        let hv = EmulatedHypervisor::new(1, 16);
        let host = EmulatedHost::attach(&hv, HostConfig::default());

        let win8 = initiate(Version::Win8, 0x1000);
        host.post_message(1, 1, win8.data()).unwrap();
        assert_eq!(host.version(), None);

        let win7 = initiate(Version::Win7, 0x1000);
        host.post_message(1, 1, win7.data()).unwrap();
        assert_eq!(host.version(), Some(Version::Win7));
        assert_eq!(host.posted().len(), 2);

        // Control traffic must now use the negotiated connection.
        let request = OutgoingMessage::new(&protocol::RequestOffers {});
        assert_eq!(
            host.post_message(4, 1, request.data()),
            Err(HvError::InvalidConnectionId)
        );
        host.post_message(1, 1, request.data()).unwrap();
    }

    #[test]
    fn gpadl_pages_are_reassembled() {
        let hv = EmulatedHypervisor::new(1, 16);
        let host = EmulatedHost::attach(&hv, HostConfig::default());
        host.post_message(1, 1, initiate(Version::Win7, 0).data())
            .unwrap();

        let pfns: Vec<u64> = (0x100..0x100 + 40).collect();
        let gpadl = vmbus_core::gpadl::GpadlMessages::new(
            ChannelId(3),
            GpadlId(9),
            40 * 4096,
            &pfns,
        )
        .unwrap();
        for message in gpadl.messages() {
            host.post_message(1, 1, message.data()).unwrap();
        }
        assert_eq!(host.gpadl_pfns(GpadlId(9)), Some(pfns));

        let teardown = OutgoingMessage::new(&protocol::GpadlTeardown {
            channel_id: ChannelId(3),
            gpadl_id: GpadlId(9),
        });
        host.post_message(1, 1, teardown.data()).unwrap();
        assert_eq!(host.gpadl_count(), 0);
        let (_, last) = host.posted().pop().unwrap();
        let (_, rest) = protocol::MessageHeader::read_from_prefix(last.data()).unwrap();
        assert_eq!(
            protocol::GpadlTeardown::read_from_prefix(rest).unwrap().0.gpadl_id,
            GpadlId(9)
        );
    }

    #[test]
    fn injected_failures_come_first() {
        let hv = EmulatedHypervisor::new(1, 16);
        let host = EmulatedHost::attach(&hv, HostConfig::default());
        host.fail_posts(0, [HvError::InsufficientBuffers]);
        let win7 = initiate(Version::Win7, 0);
        assert_eq!(
            host.post_message(1, 1, win7.data()),
            Err(HvError::InsufficientBuffers)
        );
        host.post_message(1, 1, win7.data()).unwrap();
        assert!(host.wait_for_posted(1, Duration::from_secs(1)));
    }
}
