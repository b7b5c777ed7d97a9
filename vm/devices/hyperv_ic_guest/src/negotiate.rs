// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! IC framework and message version negotiation.

use hyperv_ic_protocol::HEADER_SIZE;
use hyperv_ic_protocol::Header;
use hyperv_ic_protocol::NEGOTIATE_VERSIONS_OFFSET;
use hyperv_ic_protocol::NegotiateMessage;
use hyperv_ic_protocol::PipeHeader;
use hyperv_ic_protocol::Version;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Error returned by [`negotiate_response`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiateError {
    /// The message is too short for the versions it advertises.
    #[error("message needs {needed} bytes but only {available} are present")]
    Truncated {
        /// Bytes needed to hold the advertised versions.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
    /// A version count is zero.
    #[error("the host offered no framework or no message versions")]
    NoVersions,
    /// None of the offered framework versions is supported.
    #[error("no supported framework version offered")]
    NoFrameworkVersion,
    /// None of the offered message versions is supported.
    #[error("no supported message version offered")]
    NoMessageVersion,
}

/// Turns the negotiate request in `message` into its response.
///
/// `message` holds the whole packet starting at the pipe header. The highest
/// offered framework and message versions that are also in
/// `framework_versions` and `message_versions` are written to the first two
/// version slots and both counts become 1. If nothing matches, both counts
/// become 0. Malformed requests are left untouched.
pub fn negotiate_response(
    message: &mut [u8],
    framework_versions: &[Version],
    message_versions: &[Version],
) -> Result<(Version, Version), NegotiateError> {
    let headers = message
        .get(..NEGOTIATE_VERSIONS_OFFSET)
        .ok_or(NegotiateError::Truncated {
            needed: NEGOTIATE_VERSIONS_OFFSET,
            available: message.len(),
        })?;
    let (header, negotiate) = headers[size_of::<PipeHeader>()..].split_at(size_of::<Header>());
    let header = Header::read_from_bytes(header).map_err(|_| NegotiateError::Truncated {
        needed: HEADER_SIZE,
        available: message.len(),
    })?;
    let mut negotiate =
        NegotiateMessage::read_from_bytes(negotiate).map_err(|_| NegotiateError::Truncated {
            needed: NEGOTIATE_VERSIONS_OFFSET,
            available: message.len(),
        })?;

    let framework_count = negotiate.framework_version_count as usize;
    let message_count = negotiate.message_version_count as usize;
    if framework_count == 0 || message_count == 0 {
        return Err(NegotiateError::NoVersions);
    }

    let needed =
        NEGOTIATE_VERSIONS_OFFSET + (framework_count + message_count) * size_of::<Version>();
    let available = message.len().min(HEADER_SIZE + header.message_size as usize);
    if needed > available {
        return Err(NegotiateError::Truncated { needed, available });
    }

    let offered: Vec<Version> = message[NEGOTIATE_VERSIONS_OFFSET..needed]
        .chunks_exact(size_of::<Version>())
        .filter_map(|v| Version::read_from_bytes(v).ok())
        .collect();
    let (offered_framework, offered_message) = offered.split_at(framework_count);
    let framework = highest_common(offered_framework, framework_versions);
    let msg = highest_common(offered_message, message_versions);

    let result = match (framework, msg) {
        (Some(framework), Some(msg)) => {
            negotiate.framework_version_count = 1;
            negotiate.message_version_count = 1;
            let slots = &mut message[NEGOTIATE_VERSIONS_OFFSET..];
            slots[..4].copy_from_slice(framework.as_bytes());
            slots[4..8].copy_from_slice(msg.as_bytes());
            Ok((framework, msg))
        }
        (None, _) => Err(NegotiateError::NoFrameworkVersion),
        (_, None) => Err(NegotiateError::NoMessageVersion),
    };
    if result.is_err() {
        negotiate.framework_version_count = 0;
        negotiate.message_version_count = 0;
    }
    message[HEADER_SIZE..NEGOTIATE_VERSIONS_OFFSET].copy_from_slice(negotiate.as_bytes());
    result
}

fn highest_common(offered: &[Version], supported: &[Version]) -> Option<Version> {
    offered
        .iter()
        .filter(|version| supported.contains(version))
        .max()
        .copied()
}

/// Builds a negotiate request the way the host sends it.
#[cfg(test)]
pub(crate) fn negotiate_request(framework: &[Version], message: &[Version]) -> Vec<u8> {
    use hyperv_ic_protocol::HeaderFlags;
    use hyperv_ic_protocol::MessageType;
    use zerocopy::FromZeros;

    let versions: Vec<u8> = framework
        .iter()
        .chain(message)
        .flat_map(|v| v.as_bytes().to_vec())
        .collect();
    let header = Header {
        framework_version: Version::new(1, 0),
        message_type: MessageType::VERSION_NEGOTIATION,
        message_version: Version::new(1, 0),
        message_size: (size_of::<NegotiateMessage>() + versions.len()) as u16,
        flags: HeaderFlags::new().with_transaction(true).with_request(true),
        ..FromZeros::new_zeroed()
    };
    let negotiate = NegotiateMessage {
        framework_version_count: framework.len() as u16,
        message_version_count: message.len() as u16,
        reserved: 0,
    };
    [
        PipeHeader::new_zeroed().as_bytes(),
        header.as_bytes(),
        negotiate.as_bytes(),
        versions.as_slice(),
    ]
    .concat()
}
