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

//! Topology-aware GPU allocator for a device plugin.
//!
//! The `TopologyAllocator` owns the locality tree of one node. It is built once from the hardware
//! topology, answers "which GPUs" for each allocation request and is told about every committed
//! allocation or release so that the scores used by later requests stay current.
//!
//! The allocator does no locking. Every method that changes state takes `&mut self`, and a selection
//! followed by its commit must happen without another request in between; processes that share an
//! allocator across threads wrap it in a `Mutex`.
//!
//! Typical usage:
//! ```rust
//! use gpu_topology_allocator::config::AllocatorConfig;
//! use gpu_topology_allocator::topology::allocator::TopologyAllocator;
//! use gpu_topology_allocator::topology::hardware::{HardwareSnapshot, HwObject, ObjectKind};
//! use gpu_topology_allocator::topology::interconnect::LinkMatrix;
//! use gpu_topology_allocator::topology::link_scores::P2pLinkType;
//!
//! fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let ids = ["GPU-0", "GPU-1"];
//!     let machine = HwObject::new(ObjectKind::Machine).with_child(
//!         HwObject::new(ObjectKind::Package)
//!             .with_child(HwObject::gpu("nvidia0", ids[0]))
//!             .with_child(HwObject::gpu("nvidia1", ids[1])),
//!     );
//!     let links = LinkMatrix::new().with_clique(&ids, P2pLinkType::NvLink(4));
//!
//!     let mut allocator = TopologyAllocator::new(
//!         &HardwareSnapshot::new(machine),
//!         links,
//!         AllocatorConfig::default(),
//!     )?;
//!
//!     // Pick two GPUs and mark them as used.
//!     let gpus = allocator.allocate(2)?;
//!     assert_eq!(gpus.len(), 2);
//!
//!     // The pod went away.
//!     allocator.release(&gpus)?;
//!     println!("{}", allocator.make_utilization_table());
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

use std::collections::HashMap;

use log::{debug, info};
use thiserror::Error;

use crate::config::AllocatorConfig;

use super::hardware::{TopologyError, TopologySource};
use super::interconnect::{InterconnectError, InterconnectQuery};
use super::selection;
use super::tree::{self, TopologyNode};

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Topology discovery failed: {0}")]
    Topology(#[from] TopologyError),
    #[error("Interconnect scoring failed: {0}")]
    Interconnect(#[from] InterconnectError),
    #[error("Resource {0} is not served by this allocator")]
    UnsupportedResource(String),
    #[error("Requested zero devices")]
    ZeroDevicesRequested,
    #[error("Not enough GPUs. Requested: {requested}, found: {found}")]
    Exhausted { requested: usize, found: usize },
}

/// Holds the locality tree of a node and answers allocation requests against it.
#[derive(Debug)]
pub struct TopologyAllocator<L: InterconnectQuery> {
    config: AllocatorConfig,
    links: L,
    root: TopologyNode,
}

impl<L: InterconnectQuery> TopologyAllocator<L> {
    /// Builds the tree from `source` and scores it with every GPU free.
    ///
    /// # Errors
    /// Returns `AllocatorError::Topology` if discovery fails entirely and
    /// `AllocatorError::Interconnect` if any GPU pair cannot be scored.
    pub fn new<S: TopologySource + ?Sized>(
        source: &S,
        links: L,
        config: AllocatorConfig,
    ) -> Result<Self, AllocatorError> {
        let mut root = tree::build_tree(source, &config)?;
        tree::aggregate(&mut root, true, &links)?;
        debug!("Initial topology tree:\n{}", root.make_tree_table());
        Ok(Self {
            config,
            links,
            root,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn root(&self) -> &TopologyNode {
        &self.root
    }

    pub fn num_total_gpus(&self) -> usize {
        self.root.max_capacity
    }

    pub fn num_available_gpus(&self) -> usize {
        self.root.avail_capacity
    }

    pub fn available_gpus(&self) -> Vec<String> {
        self.root.available_gpus()
    }

    pub fn select_one(&self) -> Option<String> {
        selection::select_one(&self.root)
    }

    pub fn select_many(&self, n: usize) -> Vec<String> {
        selection::select_many(&self.root, n)
    }

    /// Chooses GPUs for a request of `n` devices of `resource` without committing them.
    ///
    /// Single-device requests take the least valuable GPU; larger requests take the best connected
    /// group able to hold them. The result may be shorter than `n` when the node cannot satisfy the
    /// request.
    ///
    /// # Errors
    /// Returns `AllocatorError::UnsupportedResource` for any resource other than the configured one
    /// and `AllocatorError::ZeroDevicesRequested` if `n` is zero.
    pub fn find_best_devices(&self, resource: &str, n: usize) -> Result<Vec<String>, AllocatorError> {
        if resource != self.config.resource_name {
            return Err(AllocatorError::UnsupportedResource(resource.to_string()));
        }
        match n {
            0 => Err(AllocatorError::ZeroDevicesRequested),
            1 => Ok(self.select_one().into_iter().collect()),
            _ => Ok(self.select_many(n)),
        }
    }

    /// Chooses `n` GPUs of the configured resource and commits them as allocated.
    ///
    /// Nothing is committed when fewer than `n` GPUs could be found.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<String>, AllocatorError> {
        let resource = self.config.resource_name.clone();
        let devices = self.find_best_devices(&resource, n)?;
        if devices.len() < n {
            return Err(AllocatorError::Exhausted {
                requested: n,
                found: devices.len(),
            });
        }
        self.update_pod_devices::<String, String>(&devices, &[])?;
        Ok(devices)
    }

    /// Returns previously allocated GPUs to the free pool.
    pub fn release<S: AsRef<str>>(&mut self, devices: &[S]) -> Result<(), AllocatorError> {
        self.update_pod_devices::<S, S>(&[], devices)
    }

    /// Applies a pod device delta: `adds` become allocated, `dels` become free again.
    ///
    /// An identifier listed in both ends up free. Identifiers that are not on this node are ignored.
    /// The delta is applied to a copy of the tree and only swapped in once the copy has been
    /// re-scored, so on error the allocator is left exactly as it was.
    pub fn update_pod_devices<A: AsRef<str>, D: AsRef<str>>(
        &mut self,
        adds: &[A],
        dels: &[D],
    ) -> Result<(), AllocatorError> {
        let mut free_map: HashMap<String, bool> = HashMap::new();
        for s in adds {
            free_map.insert(s.as_ref().to_string(), false);
        }
        for s in dels {
            free_map.insert(s.as_ref().to_string(), true);
        }
        let mut next = self.root.clone();
        let updated = tree::apply_device_state(&mut next, &free_map);
        if updated < free_map.len() {
            debug!(
                "Ignored {} device id(s) not present on this node",
                free_map.len() - updated
            );
        }
        tree::aggregate(&mut next, false, &self.links)?;
        self.root = next;
        info!(
            "Update Pod Device: left available devices number: {}",
            self.root.avail_capacity
        );
        Ok(())
    }

    /// Recomputes capacities and scores from the current leaf states.
    ///
    /// The tree is left untouched if scoring fails.
    pub fn refresh(&mut self) -> Result<(), AllocatorError> {
        let mut next = self.root.clone();
        tree::aggregate(&mut next, false, &self.links)?;
        self.root = next;
        Ok(())
    }

    pub fn make_utilization_table(&self) -> String {
        self.root.make_tree_table()
    }
}
