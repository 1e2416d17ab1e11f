// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddrV4;

use crate::ids::Sid;

/// Where a bundle advertisement came from.  A peer always has an overlay
/// identity; a direct IPv4 stream address is present only when the peer
/// advertised one (no address means the fetch starts on the datagram
/// transport straight away).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPeer {
    pub addr: Option<SocketAddrV4>,
    pub sid: Sid,
}

impl FetchPeer {
    pub fn new(addr: Option<SocketAddrV4>, sid: Sid) -> Self {
        Self { addr, sid }
    }
}
