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

//! Allocation core of a topology-aware GPU device plugin.
//!
//! Given the interconnect topology of a node and a request for N GPUs, the allocator decides which
//! GPUs to hand out: single GPUs come from the worst-connected group so that well-connected groups
//! stay whole, and multi-GPU requests come from the smallest best-connected group with room for them.
//! See [`topology::allocator`] for the entry point.

pub mod config;
pub mod topology;

pub use config::AllocatorConfig;
pub use topology::allocator::{AllocatorError, TopologyAllocator};
pub use topology::hardware::{HardwareSnapshot, HwObject, TopologySource};
pub use topology::interconnect::{InterconnectQuery, LinkMatrix};
pub use topology::link_scores::P2pLinkType;
pub use topology::tree::TopologyNode;
