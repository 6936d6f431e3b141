// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed mapping from a pairwise GPU link classification to an ordinal quality weight.
//!
//! The weights are monotonic in physical proximity and bandwidth: two GPUs that only reach each other
//! across CPU sockets score lowest, GPUs behind the same PCIe switch or on the same board score higher,
//! and GPUs joined by several direct NVLink links score highest. A classification that cannot be
//! mapped scores 0 so that an unknown link never makes a group look better connected than it is.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of the path between two GPUs, as reported by the interconnect query facility.
///
/// `NvLink(k)` carries the number of direct NVLink links between the pair. Six or more links are
/// treated the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pLinkType {
    /// Path crosses the inter-socket (SMP) link.
    CrossCpu,
    /// Both GPUs hang off the same CPU but different host bridges.
    SameCpu,
    /// Path goes through a single host bridge.
    HostBridge,
    /// Path crosses several PCIe switches.
    MultiSwitch,
    /// Both GPUs sit behind one PCIe switch.
    SingleSwitch,
    /// Both GPUs live on the same board (e.g. dual-GPU cards).
    SameBoard,
    NvLink(u8),
    Unknown,
}

impl P2pLinkType {
    /// Weight of this link in the locality score.
    pub fn score(&self) -> u32 {
        match self {
            P2pLinkType::CrossCpu => 1,
            P2pLinkType::SameCpu => 2,
            P2pLinkType::HostBridge => 3,
            P2pLinkType::MultiSwitch => 4,
            P2pLinkType::SingleSwitch => 5,
            P2pLinkType::SameBoard => 6,
            P2pLinkType::NvLink(0) => 0,
            P2pLinkType::NvLink(1) => 4,
            P2pLinkType::NvLink(2) => 5,
            P2pLinkType::NvLink(3) => 6,
            P2pLinkType::NvLink(4) => 7,
            P2pLinkType::NvLink(5) => 8,
            P2pLinkType::NvLink(_) => 9,
            P2pLinkType::Unknown => 0,
        }
    }
}

impl fmt::Display for P2pLinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P2pLinkType::CrossCpu => write!(f, "cross-cpu"),
            P2pLinkType::SameCpu => write!(f, "same-cpu"),
            P2pLinkType::HostBridge => write!(f, "host-bridge"),
            P2pLinkType::MultiSwitch => write!(f, "multi-switch"),
            P2pLinkType::SingleSwitch => write!(f, "single-switch"),
            P2pLinkType::SameBoard => write!(f, "same-board"),
            P2pLinkType::NvLink(n) => write!(f, "nvlink x{}", n),
            P2pLinkType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Weight of a link classification; what the locality scorer sums over GPU pairs.
pub fn link_score(link: P2pLinkType) -> u32 {
    link.score()
}
