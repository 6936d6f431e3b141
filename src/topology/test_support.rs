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

//! Shared fixtures for the topology tests.

use super::hardware::{HardwareSnapshot, HwObject, ObjectKind, TopologyError, TopologySource};
use super::interconnect::LinkMatrix;
use super::link_scores::P2pLinkType;
use super::tree::TopologyNode;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn gpu_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| format!("GPU-{}-{}", prefix, uuid::Uuid::new_v4()))
        .collect()
}

pub struct TwoSocketIds {
    pub socket_a: Vec<String>,
    pub socket_b: Vec<String>,
}

/// A socket with four GPUs: host bridge -> two PCIe switches -> two PCIe devices each -> GPU.
pub fn socket(name: &str, ids: &[String]) -> HwObject {
    let switches = ids.chunks(2).enumerate().map(|(s, pair)| {
        HwObject::new(ObjectKind::Bridge)
            .with_name(&format!("{}-switch{}", name, s))
            .with_children(pair.iter().enumerate().map(|(i, id)| {
                HwObject::new(ObjectKind::PciDevice)
                    .with_name(&format!("{}-pci{}", name, 2 * s + i))
                    .with_child(HwObject::gpu(&format!("{}-nvidia{}", name, 2 * s + i), id))
            }))
    });
    HwObject::new(ObjectKind::Package).with_name(name).with_child(
        HwObject::new(ObjectKind::Bridge)
            .with_name(&format!("{}-hostbridge", name))
            .with_children(switches),
    )
}

/// Two sockets of four GPUs each. Socket A is fully NVLink connected (six links per pair, weight 9);
/// every other pair, inside socket B or across sockets, is cross-CPU (weight 1).
pub fn two_socket_machine() -> (HardwareSnapshot, LinkMatrix, TwoSocketIds) {
    let socket_a = gpu_ids("a", 4);
    let socket_b = gpu_ids("b", 4);
    let machine = HwObject::new(ObjectKind::Machine)
        .with_child(socket("socket-a", &socket_a))
        .with_child(socket("socket-b", &socket_b));
    let links = LinkMatrix::new()
        .with_clique(&socket_a, P2pLinkType::NvLink(6))
        .with_clique(&socket_b, P2pLinkType::CrossCpu)
        .with_bipartite(&socket_a, &socket_b, P2pLinkType::CrossCpu);
    (
        HardwareSnapshot::new(machine),
        links,
        TwoSocketIds { socket_a, socket_b },
    )
}

/// Wraps a snapshot and fails lookups of one top-level index.
pub struct FlakySource {
    snapshot: HardwareSnapshot,
    failing_index: usize,
}

impl FlakySource {
    pub fn new(snapshot: HardwareSnapshot, failing_index: usize) -> Self {
        Self {
            snapshot,
            failing_index,
        }
    }
}

impl TopologySource for FlakySource {
    fn count_objects(&self, kind: ObjectKind) -> Result<usize, TopologyError> {
        self.snapshot.count_objects(kind)
    }

    fn object(&self, kind: ObjectKind, index: usize) -> Result<&HwObject, TopologyError> {
        if index == self.failing_index {
            return Err(TopologyError::Unavailable(format!("{} #{} is flaky", kind, index)));
        }
        self.snapshot.object(kind, index)
    }
}

pub struct UnreachableSource;

impl TopologySource for UnreachableSource {
    fn count_objects(&self, _kind: ObjectKind) -> Result<usize, TopologyError> {
        Err(TopologyError::Unavailable("hwloc not loaded".to_string()))
    }

    fn object(&self, _kind: ObjectKind, _index: usize) -> Result<&HwObject, TopologyError> {
        Err(TopologyError::Unavailable("hwloc not loaded".to_string()))
    }
}

/// Checks capacity sums and the zero-score rule on every node.
pub fn assert_aggregates_consistent(node: &TopologyNode) {
    if node.is_gpu() {
        assert_eq!(node.max_capacity, 1);
        assert!(node.avail_capacity <= 1);
        return;
    }
    let max: usize = node.children.iter().map(|c| c.max_capacity).sum();
    let avail: usize = node.children.iter().map(|c| c.avail_capacity).sum();
    assert_eq!(node.max_capacity, max, "max capacity of {} {}", node.kind, node.name);
    assert_eq!(node.avail_capacity, avail, "avail capacity of {} {}", node.kind, node.name);
    if node.avail_capacity < 2 {
        assert_eq!(node.score, 0.0, "score of {} {}", node.kind, node.name);
    }
    for child in &node.children {
        assert_aggregates_consistent(child);
    }
}
