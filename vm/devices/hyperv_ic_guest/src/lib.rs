// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of Hyper-V guest ICs (Integration Components).
//!
//! These are simple devices used to receive simple requests from the host or
//! otherwise provide some degree of integration between the guest and host.
//! Each IC runs on a [`vmbus_device::Device`] and answers host requests in
//! place.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod heartbeat;
mod negotiate;

pub use heartbeat::HeartbeatService;
pub use negotiate::NegotiateError;
pub use negotiate::negotiate_response;
