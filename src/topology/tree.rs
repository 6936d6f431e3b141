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

//! Locality tree of a node's GPUs.
//!
//! The tree mirrors the machine hierarchy below a synthetic root: top-level groups (sockets by default),
//! then bridges, PCIe switches and devices, down to one leaf per GPU. Every node carries the number of
//! GPU leaves below it (`max_capacity`), how many of those are currently free (`avail_capacity`) and a
//! locality score: the mean pairwise link weight among its free GPUs.
//!
//! The shape is fixed once [`build_tree`] returns. Afterwards only leaf availability changes, through
//! [`apply_device_state`], and [`aggregate`] has to run again to bring the ancestors back in sync.

use std::collections::{HashMap, VecDeque};

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL};
use log::{debug, trace, warn};

use crate::config::AllocatorConfig;

use super::hardware::{HwObject, TopologyError, TopologySource};
use super::interconnect::{InterconnectError, InterconnectQuery};
use super::link_scores::link_score;

pub const ROOT_KIND: &str = "root";

/// Score given to a GPU leaf. Only used so that leaves compare as maximally connected against their
/// interior siblings; it is not derived from link data.
pub const LEAF_SCORE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TopologyNode {
    /// Hardware level tag, e.g. "root", "Package", "Bridge", "OSDev".
    pub kind: String,
    pub name: String,
    pub max_capacity: usize,
    pub avail_capacity: usize,
    pub score: f64,
    /// Set on GPU leaves only.
    pub gpu_uuid: Option<String>,
    pub children: Vec<TopologyNode>,
}

impl TopologyNode {
    pub fn new_root() -> Self {
        Self::interior(ROOT_KIND, "")
    }

    pub fn interior(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            max_capacity: 0,
            avail_capacity: 0,
            score: 0.0,
            gpu_uuid: None,
            children: Vec::new(),
        }
    }

    pub fn gpu(kind: &str, name: &str, uuid: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            max_capacity: 1,
            avail_capacity: 1,
            score: LEAF_SCORE,
            gpu_uuid: Some(uuid.to_string()),
            children: Vec::new(),
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.gpu_uuid.is_some()
    }

    /// Identifiers of the free GPU leaves below this node, breadth-first.
    ///
    /// Only nodes with free capacity are descended into.
    pub fn available_gpus(&self) -> Vec<String> {
        let mut res = Vec::new();
        let mut queue: VecDeque<&TopologyNode> = VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            if let Some(uuid) = &node.gpu_uuid {
                if node.avail_capacity == 1 {
                    res.push(uuid.clone());
                }
            } else if node.avail_capacity > 0 {
                queue.extend(node.children.iter().filter(|c| c.avail_capacity > 0));
            }
        }
        res
    }

    /// Identifiers of every GPU leaf below this node, free or not, depth-first.
    pub fn gpu_uuids(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_gpu_uuids(&mut out);
        out
    }

    fn collect_gpu_uuids(&self, out: &mut Vec<String>) {
        if let Some(uuid) = &self.gpu_uuid {
            out.push(uuid.clone());
        }
        for child in &self.children {
            child.collect_gpu_uuids(out);
        }
    }

    pub fn find_gpu(&self, uuid: &str) -> Option<&TopologyNode> {
        if self.gpu_uuid.as_deref() == Some(uuid) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_gpu(uuid))
    }

    pub fn num_nodes(&self) -> usize {
        1 + self.children.iter().map(|c| c.num_nodes()).sum::<usize>()
    }

    /// Renders the tree, one row per node, indented by depth.
    pub fn make_tree_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Node"),
                Cell::new("GPU"),
                Cell::new("Free"),
                Cell::new("Total"),
                Cell::new("Score"),
                Cell::new("Utilization"),
            ]);

        let mut stack: Vec<(&TopologyNode, usize)> = vec![(self, 0)];
        while let Some((node, depth)) = stack.pop() {
            let label = if node.name.is_empty() {
                format!("{}{}", "  ".repeat(depth), node.kind)
            } else {
                format!("{}{} {}", "  ".repeat(depth), node.kind, node.name)
            };
            let used = node.max_capacity.saturating_sub(node.avail_capacity);
            table.add_row(vec![
                Cell::new(label),
                Cell::new(node.gpu_uuid.as_deref().unwrap_or("")),
                Cell::new(node.avail_capacity),
                Cell::new(node.max_capacity),
                Cell::new(format!("{:.2}", node.score)),
                Cell::new(create_bar_chart(used as f32, node.max_capacity as f32, 20)),
            ]);
            for child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }

        table.to_string()
    }
}

/// Creates an ASCII bar chart showing how much of a subtree is allocated.
fn create_bar_chart(used: f32, total: f32, width: usize) -> String {
    if total <= 0.0 {
        return format!("[{}] {used:.0}/{total:.0}", "-".repeat(width));
    }
    let filled = ((used / total).clamp(0.0, 1.0) * width as f32) as usize;
    format!(
        "[{}{}] {used:.0}/{total:.0}",
        "#".repeat(filled),
        "-".repeat(width - filled)
    )
}

// --------------------
// Building
// --------------------

/// Builds the locality tree from the discovery facility.
///
/// Each object of `config.top_level_kind` becomes a child of the root, mirrored recursively with its
/// children in the order the facility reports them. A group that cannot be fetched or contains a GPU
/// without an identifier is logged and left out. Failing to count the groups, or losing all of them,
/// is an error.
pub fn build_tree<S: TopologySource + ?Sized>(
    source: &S,
    config: &AllocatorConfig,
) -> Result<TopologyNode, TopologyError> {
    let kind = config.top_level_kind;
    let num_groups = source.count_objects(kind)?;
    let mut root = TopologyNode::new_root();

    for index in 0..num_groups {
        let obj = match source.object(kind, index) {
            Ok(obj) => obj,
            Err(e) => {
                warn!("Skipping {} #{}: topology lookup failed: {}", kind, index, e);
                continue;
            }
        };
        match mirror_object(obj, &config.identifier_attribute) {
            Ok(node) => root.children.push(node),
            Err(e) => warn!("Skipping {} #{}: {}", kind, index, e),
        }
    }

    if num_groups > 0 && root.children.is_empty() {
        return Err(TopologyError::NoUsableGroups(num_groups));
    }
    if num_groups == 0 {
        warn!("Topology reports no {} objects; the tree has no GPUs", kind);
    }
    debug!(
        "Built topology tree with {} nodes under {} {} groups",
        root.num_nodes(),
        root.children.len(),
        kind
    );
    Ok(root)
}

fn mirror_object(obj: &HwObject, identifier_attribute: &str) -> Result<TopologyNode, TopologyError> {
    let kind = obj.kind.to_string();
    if obj.is_gpu() {
        let uuid = obj
            .info(identifier_attribute)
            .ok_or_else(|| TopologyError::MissingIdentifier {
                name: obj.display_name().to_string(),
                attribute: identifier_attribute.to_string(),
            })?;
        trace!("Found GPU {} ({})", obj.display_name(), uuid);
        return Ok(TopologyNode::gpu(&kind, obj.display_name(), uuid));
    }

    let mut node = TopologyNode::interior(&kind, obj.display_name());
    node.children = obj
        .children
        .iter()
        .map(|child| mirror_object(child, identifier_attribute))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(node)
}

// --------------------
// Aggregation and scoring
// --------------------

/// Link weights between GPU pairs, memoized for the duration of one aggregation pass.
struct PairScorer<'a, L: ?Sized> {
    links: &'a L,
    memo: HashMap<(String, String), u32>,
}

impl<'a, L: InterconnectQuery + ?Sized> PairScorer<'a, L> {
    fn new(links: &'a L) -> Self {
        Self {
            links,
            memo: HashMap::new(),
        }
    }

    fn pair_score(&mut self, a: &str, b: &str) -> Result<u32, InterconnectError> {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        if let Some(score) = self.memo.get(&key) {
            return Ok(*score);
        }
        let link = self.links.p2p_link(a, b)?;
        let score = link_score(link);
        trace!("Link {} <-> {}: {} (score {})", a, b, link, score);
        self.memo.insert(key, score);
        Ok(score)
    }

    fn average_score(&mut self, gpus: &[String]) -> Result<f64, InterconnectError> {
        if gpus.len() < 2 {
            return Ok(0.0);
        }
        let mut total: u64 = 0;
        let mut num_pairs: u64 = 0;
        for (i, a) in gpus.iter().enumerate() {
            for b in &gpus[i + 1..] {
                total += self.pair_score(a, b)? as u64;
                num_pairs += 1;
            }
        }
        Ok(total as f64 / num_pairs as f64)
    }
}

/// Recomputes capacities and scores of `node` and everything below it.
///
/// With `initializing` set every GPU leaf is marked free; otherwise the stored leaf availability is
/// kept. Returns `(max_capacity, avail_capacity)` of `node`. A failed link query aborts the pass.
pub fn aggregate<L: InterconnectQuery + ?Sized>(
    node: &mut TopologyNode,
    initializing: bool,
    links: &L,
) -> Result<(usize, usize), InterconnectError> {
    let mut scorer = PairScorer::new(links);
    let (max, avail, _) = aggregate_node(node, initializing, &mut scorer)?;
    Ok((max, avail))
}

fn aggregate_node<L: InterconnectQuery + ?Sized>(
    node: &mut TopologyNode,
    initializing: bool,
    scorer: &mut PairScorer<'_, L>,
) -> Result<(usize, usize, Vec<String>), InterconnectError> {
    if let Some(uuid) = &node.gpu_uuid {
        node.max_capacity = 1;
        if initializing {
            node.avail_capacity = 1;
        }
        node.score = LEAF_SCORE;
        let free = if node.avail_capacity == 1 {
            vec![uuid.clone()]
        } else {
            Vec::new()
        };
        return Ok((node.max_capacity, node.avail_capacity, free));
    }

    let mut max_capacity = 0;
    let mut avail_capacity = 0;
    let mut free = Vec::new();
    for child in node.children.iter_mut() {
        let (child_max, child_avail, child_free) = aggregate_node(child, initializing, scorer)?;
        max_capacity += child_max;
        avail_capacity += child_avail;
        free.extend(child_free);
    }
    node.max_capacity = max_capacity;
    node.avail_capacity = avail_capacity;
    node.score = scorer.average_score(&free)?;
    Ok((max_capacity, avail_capacity, free))
}

// --------------------
// Leaf state
// --------------------

/// Marks every GPU leaf whose identifier is a key of `states` as free (`true`) or allocated (`false`).
///
/// Returns how many leaves were touched. Identifiers that are not in the tree are ignored. Ancestors
/// are not updated; run [`aggregate`] afterwards.
pub fn apply_device_state(node: &mut TopologyNode, states: &HashMap<String, bool>) -> usize {
    if let Some(uuid) = &node.gpu_uuid {
        return match states.get(uuid) {
            Some(free) => {
                node.avail_capacity = usize::from(*free);
                1
            }
            None => 0,
        };
    }
    node.children
        .iter_mut()
        .map(|child| apply_device_state(child, states))
        .sum()
}
