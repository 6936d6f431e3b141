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

//! Boundary to the hardware topology discovery facility.
//!
//! The allocator never discovers hardware itself. It consumes a [`TopologySource`], which hands out
//! [`HwObject`]s: the machine hierarchy with object kinds, ordered children, an OS-device class used to
//! spot GPUs and free-form info attributes carrying e.g. the GPU UUID.
//!
//! [`HardwareSnapshot`] is an in-memory source that can be deserialized from JSON. It is what the tests
//! and offline dry runs use in place of a live discovery library.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Topology facility unavailable: {0}")]
    Unavailable(String),
    #[error("No {kind} object at index {index}")]
    ObjectNotFound { kind: ObjectKind, index: usize },
    #[error("GPU object {name:?} has no '{attribute}' attribute")]
    MissingIdentifier { name: String, attribute: String },
    #[error("None of the {0} top-level groups could be built")]
    NoUsableGroups(usize),
    #[error("Failed to read hardware snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse hardware snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Level of a hardware object in the machine hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Machine,
    Package,
    #[serde(rename = "NUMANode")]
    NumaNode,
    Die,
    Group,
    Bridge,
    #[serde(rename = "PCIDev")]
    PciDevice,
    #[serde(rename = "OSDev")]
    OsDevice,
    Misc,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Machine => "Machine",
            ObjectKind::Package => "Package",
            ObjectKind::NumaNode => "NUMANode",
            ObjectKind::Die => "Die",
            ObjectKind::Group => "Group",
            ObjectKind::Bridge => "Bridge",
            ObjectKind::PciDevice => "PCIDev",
            ObjectKind::OsDevice => "OSDev",
            ObjectKind::Misc => "Misc",
        };
        f.write_str(s)
    }
}

/// Class of an OS device object. Only `Gpu` matters to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsDeviceType {
    Block,
    Gpu,
    Network,
    OpenFabrics,
    Dma,
    CoProcessor,
}

/// One object of the discovered hardware hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwObject {
    pub kind: ObjectKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub os_device_type: Option<OsDeviceType>,
    #[serde(default)]
    pub info: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<HwObject>,
}

impl HwObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            name: None,
            os_device_type: None,
            info: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// A GPU OS device carrying `uuid` under the `NVIDIAUUID` info key.
    pub fn gpu(name: &str, uuid: &str) -> Self {
        Self::new(ObjectKind::OsDevice)
            .with_name(name)
            .with_os_device_type(OsDeviceType::Gpu)
            .with_info("NVIDIAUUID", uuid)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_os_device_type(mut self, os_device_type: OsDeviceType) -> Self {
        self.os_device_type = Some(os_device_type);
        self
    }

    pub fn with_info(mut self, key: &str, value: &str) -> Self {
        self.info.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_child(mut self, child: HwObject) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children<I: IntoIterator<Item = HwObject>>(mut self, children: I) -> Self {
        self.children.extend(children);
        self
    }

    pub fn is_gpu(&self) -> bool {
        self.os_device_type == Some(OsDeviceType::Gpu)
    }

    pub fn info(&self, key: &str) -> Option<&str> {
        self.info.get(key).map(String::as_str)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Read access to a discovered machine topology.
///
/// Objects are addressed the way discovery libraries expose them: by kind plus a logical index in
/// `0..count_objects(kind)`. The returned objects are only borrowed; the allocator copies what it
/// needs while building its own tree.
pub trait TopologySource {
    fn count_objects(&self, kind: ObjectKind) -> Result<usize, TopologyError>;

    fn object(&self, kind: ObjectKind, index: usize) -> Result<&HwObject, TopologyError>;
}

/// A recorded machine topology held in memory.
///
/// Logical indices of a kind follow breadth-first order from the machine root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub machine: HwObject,
}

impl HardwareSnapshot {
    pub fn new(machine: HwObject) -> Self {
        Self { machine }
    }

    pub fn from_json_str(data: &str) -> Result<Self, TopologyError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    fn objects_of_kind(&self, kind: ObjectKind) -> Vec<&HwObject> {
        let mut out = Vec::new();
        let mut queue: VecDeque<&HwObject> = VecDeque::from([&self.machine]);
        while let Some(obj) = queue.pop_front() {
            if obj.kind == kind {
                out.push(obj);
            }
            queue.extend(obj.children.iter());
        }
        out
    }
}

impl TopologySource for HardwareSnapshot {
    fn count_objects(&self, kind: ObjectKind) -> Result<usize, TopologyError> {
        Ok(self.objects_of_kind(kind).len())
    }

    fn object(&self, kind: ObjectKind, index: usize) -> Result<&HwObject, TopologyError> {
        self.objects_of_kind(kind)
            .get(index)
            .copied()
            .ok_or(TopologyError::ObjectNotFound { kind, index })
    }
}
