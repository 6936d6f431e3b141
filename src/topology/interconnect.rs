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

//! Boundary to the live device / interconnect query facility.
//!
//! Scoring asks this facility for the link classification between two GPUs, addressed by their stable
//! identifiers. [`LinkMatrix`] is an in-memory table implementation, loadable from JSON.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::hardware::TopologyError;
use super::link_scores::P2pLinkType;

#[derive(Error, Debug, PartialEq)]
pub enum InterconnectError {
    #[error("Unknown GPU device: {0}")]
    UnknownDevice(String),
    #[error("P2P link query between {a} and {b} failed: {reason}")]
    QueryFailed { a: String, b: String, reason: String },
}

/// Pairwise link lookup between two live GPUs.
pub trait InterconnectQuery {
    fn p2p_link(&self, a: &str, b: &str) -> Result<P2pLinkType, InterconnectError>;
}

impl<T: InterconnectQuery + ?Sized> InterconnectQuery for &T {
    fn p2p_link(&self, a: &str, b: &str) -> Result<P2pLinkType, InterconnectError> {
        (**self).p2p_link(a, b)
    }
}

impl<T: InterconnectQuery + ?Sized> InterconnectQuery for Box<T> {
    fn p2p_link(&self, a: &str, b: &str) -> Result<P2pLinkType, InterconnectError> {
        (**self).p2p_link(a, b)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LinkEntry {
    a: String,
    b: String,
    link: P2pLinkType,
}

#[derive(Debug, Clone, Deserialize)]
struct LinkMatrixFile {
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    links: Vec<LinkEntry>,
    #[serde(default)]
    default_link: Option<P2pLinkType>,
}

/// Symmetric table of link classifications between known devices.
///
/// A pair of known devices without an entry resolves to `default_link` when one is set and is a
/// query failure otherwise. Any identifier that was never registered is `UnknownDevice`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "LinkMatrixFile")]
pub struct LinkMatrix {
    devices: BTreeSet<String>,
    links: HashMap<(String, String), P2pLinkType>,
    default_link: Option<P2pLinkType>,
}

impl From<LinkMatrixFile> for LinkMatrix {
    fn from(file: LinkMatrixFile) -> Self {
        let mut matrix = LinkMatrix::new();
        for device in file.devices {
            matrix.add_device(&device);
        }
        for entry in file.links {
            matrix.set_link(&entry.a, &entry.b, entry.link);
        }
        matrix.default_link = file.default_link;
        matrix
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl LinkMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a recorded link table. Reading or parsing problems are discovery failures.
    pub fn from_json_str(data: &str) -> Result<Self, TopologyError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, TopologyError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn add_device(&mut self, id: &str) {
        self.devices.insert(id.to_string());
    }

    pub fn set_link(&mut self, a: &str, b: &str, link: P2pLinkType) {
        self.add_device(a);
        self.add_device(b);
        self.links.insert(pair_key(a, b), link);
    }

    pub fn with_link(mut self, a: &str, b: &str, link: P2pLinkType) -> Self {
        self.set_link(a, b, link);
        self
    }

    pub fn with_default_link(mut self, link: P2pLinkType) -> Self {
        self.default_link = Some(link);
        self
    }

    /// Connects every pair among `ids` with `link`.
    pub fn with_clique<S: AsRef<str>>(mut self, ids: &[S], link: P2pLinkType) -> Self {
        for (i, a) in ids.iter().enumerate() {
            self.add_device(a.as_ref());
            for b in &ids[i + 1..] {
                self.set_link(a.as_ref(), b.as_ref(), link);
            }
        }
        self
    }

    /// Connects every device of `left` with every device of `right` using `link`.
    pub fn with_bipartite<S: AsRef<str>>(mut self, left: &[S], right: &[S], link: P2pLinkType) -> Self {
        for a in left {
            for b in right {
                self.set_link(a.as_ref(), b.as_ref(), link);
            }
        }
        self
    }
}

impl InterconnectQuery for LinkMatrix {
    fn p2p_link(&self, a: &str, b: &str) -> Result<P2pLinkType, InterconnectError> {
        for id in [a, b] {
            if !self.devices.contains(id) {
                return Err(InterconnectError::UnknownDevice(id.to_string()));
            }
        }
        if let Some(link) = self.links.get(&pair_key(a, b)) {
            return Ok(*link);
        }
        self.default_link.ok_or_else(|| InterconnectError::QueryFailed {
            a: a.to_string(),
            b: b.to_string(),
            reason: "no link recorded for pair".to_string(),
        })
    }
}
