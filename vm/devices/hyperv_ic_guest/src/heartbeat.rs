// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The heartbeat IC.

use crate::negotiate::negotiate_response;
use hyperv_ic_protocol::HEADER_SIZE;
use hyperv_ic_protocol::Header;
use hyperv_ic_protocol::HeaderFlags;
use hyperv_ic_protocol::MAX_MESSAGE_SIZE;
use hyperv_ic_protocol::MessageType;
use hyperv_ic_protocol::PipeHeader;
use hyperv_ic_protocol::STATUS_FAIL;
use hyperv_ic_protocol::Version;
use hyperv_ic_protocol::heartbeat::FRAMEWORK_VERSIONS;
use hyperv_ic_protocol::heartbeat::HEARTBEAT_VERSIONS;
use hyperv_ic_protocol::heartbeat::SEQUENCE_OFFSET;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use vmbus_device::Device;
use vmbus_device::DeviceError;
use vmbus_device::Packet;
use vmbus_device::PacketHandler;
use vmbus_device::PacketKind;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Size of each of the channel's rings.
pub const RING_SIZE: usize = 4096;

#[derive(Debug, Error)]
enum Error {
    #[error("message of {0} bytes is too short for the IC headers")]
    Truncated(usize),
    #[error("message of {0} bytes is too large")]
    TooLarge(usize),
}

/// What the heartbeat IC has seen from the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatState {
    /// The negotiated framework and message versions.
    pub versions: Option<(Version, Version)>,
    /// The sequence number of the last heartbeat response.
    pub sequence: Option<u64>,
}

/// Answers the host's version negotiation and heartbeat requests.
#[derive(Debug, Default)]
pub struct HeartbeatService {
    state: Mutex<HeartbeatState>,
}

impl HeartbeatService {
    /// Installs a heartbeat service on `device` and opens its channel.
    pub fn start(device: &Device) -> Result<Arc<Self>, DeviceError> {
        let service = Arc::new(Self::default());
        device.install_packet_actions(service.clone(), true)?;
        device.open(RING_SIZE, RING_SIZE)?;
        Ok(service)
    }

    /// Returns what the service has seen so far.
    pub fn state(&self) -> HeartbeatState {
        *self.state.lock()
    }

    fn handle_packet(&self, device: &Device, mut packet: Packet) {
        if packet.kind != PacketKind::InBand {
            tracing::debug!(kind = ?packet.kind, "ignoring heartbeat packet");
            return;
        }
        if let Err(err) = self.respond(&mut packet.payload) {
            tracing::warn!(
                channel_id = device.channel_id().0,
                error = &err as &dyn std::error::Error,
                "dropping heartbeat message"
            );
            return;
        }
        let result = if packet.transaction_id != 0 {
            device.write_inband_with_transaction_id(&packet.payload, packet.transaction_id, false)
        } else {
            device.write_inband(&packet.payload, false).map(drop)
        };
        if let Err(err) = result {
            tracing::error!(
                channel_id = device.channel_id().0,
                error = &err as &dyn std::error::Error,
                "failed to send heartbeat response"
            );
        }
    }

    /// Rewrites the request in `message` into its response.
    fn respond(&self, message: &mut [u8]) -> Result<(), Error> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(message.len()));
        }
        let header_bytes = message
            .get(size_of::<PipeHeader>()..HEADER_SIZE)
            .ok_or(Error::Truncated(message.len()))?;
        let mut header =
            Header::read_from_bytes(header_bytes).map_err(|_| Error::Truncated(message.len()))?;

        match header.message_type {
            MessageType::VERSION_NEGOTIATION => {
                match negotiate_response(message, FRAMEWORK_VERSIONS, HEARTBEAT_VERSIONS) {
                    Ok((framework_version, message_version)) => {
                        tracing::info!(%framework_version, %message_version, "version negotiated");
                        *self.state.lock() = HeartbeatState {
                            versions: Some((framework_version, message_version)),
                            sequence: None,
                        };
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed version negotiation"
                        );
                    }
                }
            }
            MessageType::HEARTBEAT => {
                match u64::read_from_prefix(&message[SEQUENCE_OFFSET..]) {
                    Ok((sequence, _)) => {
                        // The host increments it again before the next request.
                        let sequence = sequence.wrapping_add(1);
                        let len = message.len();
                        sequence
                            .write_to_prefix(&mut message[SEQUENCE_OFFSET..])
                            .map_err(|_| Error::Truncated(len))?;
                        let mut state = self.state.lock();
                        if state.sequence.is_none() {
                            tracing::info!(sequence, "first heartbeat");
                        } else {
                            tracing::trace!(sequence, "heartbeat");
                        }
                        state.sequence = Some(sequence);
                    }
                    Err(_) => {
                        tracing::debug!(len = message.len(), "heartbeat without a sequence");
                        header.status = STATUS_FAIL;
                    }
                }
            }
            message_type => {
                tracing::debug!(?message_type, "unknown heartbeat message type");
                header.status = STATUS_FAIL;
            }
        }

        header.flags = HeaderFlags::new().with_transaction(true).with_response(true);
        message[size_of::<PipeHeader>()..HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }
}

impl PacketHandler for HeartbeatService {
    fn packet_ready(&self, device: &Device) {
        if let Err(err) = device.drain_packets(|packet| self.handle_packet(device, packet)) {
            tracing::error!(
                channel_id = device.channel_id().0,
                error = &err as &dyn std::error::Error,
                "failed to read heartbeat packets"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::negotiate_request;
    use hyperv_ic_protocol::NEGOTIATE_VERSIONS_OFFSET;
    use hyperv_ic_protocol::NegotiateMessage;
    use hyperv_ic_protocol::heartbeat::HeartbeatMessage;
    use hyperv_ic_protocol::interface;
    use hv1_guest::emulated::EmulatedHypervisor;
    use parking_lot::Condvar;
    use std::time::Duration;
    use test_with_tracing::test;
    use vmbus_client::VmbusClient;
    use vmbus_client::VmbusConfig;
    use vmbus_core::protocol::ChannelId;
    use vmbus_emulated_host::EmulatedHost;
    use vmbus_emulated_host::HostConfig;
    use vmbus_emulated_host::HostPacket;
    use vmbus_emulated_host::make_offer;
    use vmbus_ring::OutgoingPacketType;
    use zerocopy::FromZeros;

    const CHANNEL: ChannelId = ChannelId(3);
    const INSTANCE: guid::Guid = guid::guid!("6c5cb3d8-2f4a-4b61-9a3e-0d52a1c7e9b4");

    #[derive(Default)]
    struct Responses {
        packets: Mutex<Vec<HostPacket>>,
        arrived: Condvar,
    }

    impl Responses {
        fn next(&self) -> HostPacket {
            let mut packets = self.packets.lock();
            while packets.is_empty() {
                assert!(
                    !self
                        .arrived
                        .wait_for(&mut packets, Duration::from_secs(5))
                        .timed_out(),
                    "no response"
                );
            }
            packets.remove(0)
        }
    }

    struct TestEnv {
        _hv: Arc<EmulatedHypervisor>,
        host: Arc<EmulatedHost>,
        _device: Arc<Device>,
        service: Arc<HeartbeatService>,
        responses: Arc<Responses>,
    }

    impl TestEnv {
        fn new() -> Self {
            let hv = EmulatedHypervisor::new(1, 256);
            let host = EmulatedHost::attach(&hv, HostConfig::default());
            host.add_offer(make_offer(CHANNEL.0, interface::HEARTBEAT, INSTANCE));
            let client = Arc::new(VmbusClient::new(hv.platform(), VmbusConfig::default()).unwrap());
            client.connect().unwrap();
            client.scan().unwrap();

            let responses = Arc::new(Responses::default());
            host.set_packet_handler(CHANNEL, {
                let responses = responses.clone();
                Arc::new(move |host, channel_id| {
                    let packets = host.read_packets(channel_id);
                    if !packets.is_empty() {
                        responses.packets.lock().extend(packets);
                        responses.arrived.notify_all();
                    }
                })
            });

            let device = Device::new(client, CHANNEL, Default::default()).unwrap();
            let service = HeartbeatService::start(&device).unwrap();
            assert!(host.is_open(CHANNEL));
            Self {
                _hv: hv,
                host,
                _device: device,
                service,
                responses,
            }
        }

        fn request(&self, transaction_id: u64, message: &[u8]) -> HostPacket {
            self.host
                .write_packet(
                    CHANNEL,
                    OutgoingPacketType::InBandWithCompletion,
                    transaction_id,
                    message,
                )
                .unwrap();
            self.responses.next()
        }
    }

    fn header(message: &[u8]) -> Header {
        Header::read_from_bytes(&message[size_of::<PipeHeader>()..HEADER_SIZE]).unwrap()
    }

    fn heartbeat_request(message_type: MessageType, sequence: u64) -> Vec<u8> {
        let header = Header {
            framework_version: Version::new(3, 0),
            message_type,
            message_version: Version::new(3, 0),
            message_size: size_of::<HeartbeatMessage>() as u16,
            flags: HeaderFlags::new().with_transaction(true).with_request(true),
            ..FromZeros::new_zeroed()
        };
        let heartbeat = HeartbeatMessage {
            sequence_number: sequence,
            reserved: [0; 8],
        };
        [
            PipeHeader::new_zeroed().as_bytes(),
            header.as_bytes(),
            heartbeat.as_bytes(),
        ]
        .concat()
    }

    #[test]
    fn negotiates_then_answers_heartbeats() {
        let env = TestEnv::new();

        let request = negotiate_request(
            &[Version::new(1, 0), Version::new(3, 0)],
            &[Version::new(1, 0), Version::new(3, 0), Version::new(4, 0)],
        );
        let response = env.request(7, &request);
        assert_eq!(response.payload.len(), request.len().next_multiple_of(8));
        let flags = header(&response.payload).flags;
        assert!(flags.transaction() && flags.response() && !flags.request());
        let negotiate = NegotiateMessage::read_from_bytes(
            &response.payload[HEADER_SIZE..NEGOTIATE_VERSIONS_OFFSET],
        )
        .unwrap();
        assert_eq!(negotiate.framework_version_count, 1);
        assert_eq!(negotiate.message_version_count, 1);
        assert_eq!(
            env.service.state().versions,
            Some((Version::new(3, 0), Version::new(3, 0)))
        );

        for sequence in [41, 99] {
            let response = env.request(8, &heartbeat_request(MessageType::HEARTBEAT, sequence));
            let (answered, _) =
                u64::read_from_prefix(&response.payload[SEQUENCE_OFFSET..]).unwrap();
            assert_eq!(answered, sequence + 1);
            assert_eq!(header(&response.payload).status, 0);
        }
        assert_eq!(env.service.state().sequence, Some(100));
    }

    #[test]
    fn unknown_messages_fail() {
        let env = TestEnv::new();
        let response = env.request(1, &heartbeat_request(MessageType::SHUTDOWN, 5));
        let header = header(&response.payload);
        assert_eq!(header.status, STATUS_FAIL);
        assert!(header.flags.response());
        // The message body comes back unchanged.
        let (sequence, _) = u64::read_from_prefix(&response.payload[SEQUENCE_OFFSET..]).unwrap();
        assert_eq!(sequence, 5);
        assert_eq!(env.service.state(), HeartbeatState::default());
    }

    #[test]
    fn failed_negotiation_is_still_answered() {
        let env = TestEnv::new();
        let response = env.request(
            2,
            &negotiate_request(&[Version::new(9, 0)], &[Version::new(3, 0)]),
        );
        let negotiate = NegotiateMessage::read_from_bytes(
            &response.payload[HEADER_SIZE..NEGOTIATE_VERSIONS_OFFSET],
        )
        .unwrap();
        assert_eq!(negotiate.framework_version_count, 0);
        assert_eq!(negotiate.message_version_count, 0);
        assert_eq!(env.service.state().versions, None);
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let env = TestEnv::new();
        env.host
            .write_packet(CHANNEL, OutgoingPacketType::InBandWithCompletion, 3, &[0; 12])
            .unwrap();
        // The short message got no answer; the next one does.
        let response = env.request(4, &heartbeat_request(MessageType::HEARTBEAT, 1));
        let (sequence, _) = u64::read_from_prefix(&response.payload[SEQUENCE_OFFSET..]).unwrap();
        assert_eq!(sequence, 2);
        assert!(env.responses.packets.lock().is_empty());
    }
}
