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

//! Device selection over a scored locality tree.
//!
//! Requests are split by shape:
//!
//! * A single GPU is taken from the worst-connected subtree that still has a free GPU. Consuming a
//!   stray GPU there keeps the well-connected groups whole for later multi-GPU requests.
//! * Several GPUs are taken from the smallest, best-scored subtree that can still hold the whole
//!   request. The search walks the tree level by level, keeps only the nodes tied for the best score
//!   among those with enough free GPUs and descends into them looking for an equally good but tighter
//!   group.
//!
//! Both functions only read the tree. Committing a choice is the caller's job.

use log::{debug, trace};

use super::tree::TopologyNode;

/// Picks one free GPU by descending into the lowest-scored child with free capacity.
///
/// Ties go to the first child. Returns `None` when nothing is free.
pub fn select_one(root: &TopologyNode) -> Option<String> {
    let mut node = root;
    loop {
        if let Some(uuid) = &node.gpu_uuid {
            if node.avail_capacity == 0 {
                return None;
            }
            debug!("Selected single GPU {}", uuid);
            return Some(uuid.clone());
        }

        let mut best: Option<&TopologyNode> = None;
        for child in node.children.iter().filter(|c| c.avail_capacity > 0) {
            if best.map_or(true, |b| child.score < b.score) {
                best = Some(child);
            }
        }
        match best {
            Some(child) => {
                trace!(
                    "Descending into {} {} (score {:.3}, free {})",
                    child.kind, child.name, child.score, child.avail_capacity
                );
                node = child;
            }
            None => {
                debug!("No free GPU below {} {}", node.kind, node.name);
                return None;
            }
        }
    }
}

/// Picks up to `n` free GPUs from the tightest best-scored subtree able to hold them.
///
/// The result is shorter than `n` when no such group can be assembled; callers must treat that as a
/// failed allocation.
pub fn select_many(root: &TopologyNode, n: usize) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }

    let mut frontier: Vec<&TopologyNode> = vec![root];
    let mut candidates: Vec<&TopologyNode> = Vec::new();
    let mut depth = 0;

    while !frontier.is_empty() {
        let level_max = frontier
            .iter()
            .filter(|node| node.avail_capacity >= n)
            .map(|node| node.score)
            .fold(0.0_f64, f64::max);
        if level_max <= 0.0 {
            trace!("No node at depth {} can hold {} GPUs", depth, n);
            break;
        }

        let mut next = Vec::new();
        candidates.clear();
        for node in frontier.into_iter().filter(|node| node.avail_capacity >= n) {
            if node.score < level_max {
                continue;
            }
            candidates.push(node);
            next.extend(node.children.iter().filter(|c| c.avail_capacity > 0));
        }
        trace!(
            "Depth {}: best score {:.3} held by {} node(s)",
            depth,
            level_max,
            candidates.len()
        );
        frontier = next;
        depth += 1;
    }

    let mut selected: Vec<String> = Vec::with_capacity(n);
    'drain: for candidate in &candidates {
        for uuid in candidate.available_gpus() {
            if selected.len() == n {
                break 'drain;
            }
            if !selected.contains(&uuid) {
                selected.push(uuid);
            }
        }
    }
    debug!("Selected {}/{} GPUs: {:?}", selected.len(), n, selected);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::topology::hardware::{HardwareSnapshot, HwObject, ObjectKind};
    use crate::topology::interconnect::LinkMatrix;
    use crate::topology::link_scores::P2pLinkType;
    use crate::topology::test_support::{self as ts, TwoSocketIds};
    use crate::topology::tree::{aggregate, apply_device_state, build_tree};
    use std::collections::{HashMap, HashSet};

    fn scored_two_socket() -> (TopologyNode, LinkMatrix, TwoSocketIds) {
        ts::init();
        let (snapshot, links, ids) = ts::two_socket_machine();
        let mut root = build_tree(&snapshot, &AllocatorConfig::default()).unwrap();
        aggregate(&mut root, true, &links).unwrap();
        (root, links, ids)
    }

    fn mark_allocated(root: &mut TopologyNode, links: &LinkMatrix, ids: &[String]) {
        let states: HashMap<String, bool> = ids.iter().map(|id| (id.clone(), false)).collect();
        apply_device_state(root, &states);
        aggregate(root, false, links).unwrap();
    }

    fn assert_all_free(root: &TopologyNode, selected: &[String]) {
        for id in selected {
            assert_eq!(root.find_gpu(id).unwrap().avail_capacity, 1, "{} is not free", id);
        }
    }

    #[test]
    fn test_single_gpu_comes_from_worst_connected_socket() {
        let (root, _, ids) = scored_two_socket();
        let selected = select_one(&root).unwrap();
        assert_eq!(selected, ids.socket_b[0]);
    }

    #[test]
    fn test_single_gpu_prefers_stray_leftover() {
        let (mut root, links, ids) = scored_two_socket();
        // Socket A is left with one GPU, which scores 0 and is now the least valuable group.
        mark_allocated(&mut root, &links, &ids.socket_a[..3]);
        assert_eq!(select_one(&root).unwrap(), ids.socket_a[3]);
    }

    #[test]
    fn test_single_gpu_never_returns_allocated() {
        let (mut root, links, ids) = scored_two_socket();
        let mut taken: Vec<String> = Vec::new();
        for _ in 0..8 {
            let id = select_one(&root).unwrap();
            assert_all_free(&root, std::slice::from_ref(&id));
            assert!(!taken.contains(&id));
            taken.push(id);
            mark_allocated(&mut root, &links, &taken);
        }
        assert_eq!(root.avail_capacity, 0);
        assert_eq!(select_one(&root), None);
        let all: HashSet<&String> = ids.socket_a.iter().chain(ids.socket_b.iter()).collect();
        assert_eq!(taken.iter().collect::<HashSet<_>>(), all);
    }

    #[test]
    fn test_four_gpus_come_from_nvlink_socket() {
        let (root, _, ids) = scored_two_socket();
        let selected = select_many(&root, 4);
        assert_eq!(
            selected.iter().collect::<HashSet<_>>(),
            ids.socket_a.iter().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_pair_falls_back_to_other_socket() {
        let (mut root, links, ids) = scored_two_socket();
        mark_allocated(&mut root, &links, &ids.socket_a[..3]);
        let selected = select_many(&root, 2);
        assert_eq!(selected.len(), 2);
        for id in &selected {
            assert!(ids.socket_b.contains(id), "{} is not on socket B", id);
        }
        assert_all_free(&root, &selected);
    }

    #[test]
    fn test_pair_prefers_tightest_group() {
        let (root, _, ids) = scored_two_socket();
        // Every subtree of socket A scores 9; the deepest ones that still fit two are the switches.
        let selected = select_many(&root, 2);
        assert_eq!(selected, vec![ids.socket_a[0].clone(), ids.socket_a[1].clone()]);
    }

    #[test]
    fn test_lower_scored_socket_is_not_searched() {
        ts::init();
        let socket_a = ts::gpu_ids("a", 4);
        let socket_b = ts::gpu_ids("b", 4);
        let machine = HwObject::new(ObjectKind::Machine)
            .with_child(ts::socket("socket-a", &socket_a))
            .with_child(ts::socket("socket-b", &socket_b));
        // Socket A averages 3. Socket B averages (9 + 5 * 1) / 6, although its first switch holds
        // an NVLink pair scoring 9.
        let links = LinkMatrix::new()
            .with_clique(&socket_a, P2pLinkType::HostBridge)
            .with_clique(&socket_b, P2pLinkType::CrossCpu)
            .with_link(&socket_b[0], &socket_b[1], P2pLinkType::NvLink(6))
            .with_bipartite(&socket_a, &socket_b, P2pLinkType::CrossCpu);
        let mut root = build_tree(&HardwareSnapshot::new(machine), &AllocatorConfig::default()).unwrap();
        aggregate(&mut root, true, &links).unwrap();
        assert!(root.children[1].score < root.children[0].score);
        assert_eq!(root.children[1].children[0].children[0].score, 9.0);

        let selected = select_many(&root, 2);
        assert_eq!(selected, vec![socket_a[0].clone(), socket_a[1].clone()]);
    }

    #[test]
    fn test_request_larger_than_free_is_short() {
        let (mut root, links, ids) = scored_two_socket();
        assert!(select_many(&root, 9).is_empty());
        mark_allocated(&mut root, &links, &ids.socket_b[..2]);
        let selected = select_many(&root, 7);
        assert!(selected.len() < 7);
    }

    #[test]
    fn test_never_returns_more_than_requested() {
        let (mut root, links, ids) = scored_two_socket();
        mark_allocated(&mut root, &links, &ids.socket_a[..1]);
        for n in 1..=8 {
            let selected = select_many(&root, n);
            assert!(selected.len() <= n);
            let distinct: HashSet<&String> = selected.iter().collect();
            assert_eq!(distinct.len(), selected.len());
            assert_all_free(&root, &selected);
        }
    }

    #[test]
    fn test_whole_machine_request() {
        let (root, _, _) = scored_two_socket();
        let selected = select_many(&root, 8);
        assert_eq!(selected.len(), 8);
    }

    #[test]
    fn test_zero_request_is_empty() {
        let (root, _, _) = scored_two_socket();
        assert!(select_many(&root, 0).is_empty());
    }

    #[test]
    fn test_unscored_links_yield_nothing() {
        ts::init();
        let ids = ts::gpu_ids("u", 2);
        let machine = HwObject::new(ObjectKind::Machine).with_child(
            HwObject::new(ObjectKind::Package)
                .with_children(ids.iter().map(|id| HwObject::gpu("nvidia", id))),
        );
        let links = LinkMatrix::new().with_clique(&ids, P2pLinkType::Unknown);
        let mut root = build_tree(&HardwareSnapshot::new(machine), &AllocatorConfig::default()).unwrap();
        aggregate(&mut root, true, &links).unwrap();
        assert!(select_many(&root, 2).is_empty());
        // A single GPU does not depend on link scores.
        assert_eq!(select_one(&root).unwrap(), ids[0]);
    }

    #[test]
    fn test_equal_siblings_are_drained_in_order() {
        ts::init();
        let left = ts::gpu_ids("l", 2);
        let right = ts::gpu_ids("r", 2);
        let machine = HwObject::new(ObjectKind::Machine)
            .with_child(
                HwObject::new(ObjectKind::Package)
                    .with_name("left")
                    .with_children(left.iter().map(|id| HwObject::gpu("nvidia", id))),
            )
            .with_child(
                HwObject::new(ObjectKind::Package)
                    .with_name("right")
                    .with_children(right.iter().map(|id| HwObject::gpu("nvidia", id))),
            );
        let links = LinkMatrix::new()
            .with_clique(&left, P2pLinkType::NvLink(2))
            .with_clique(&right, P2pLinkType::NvLink(2))
            .with_bipartite(&left, &right, P2pLinkType::SameCpu);
        let mut root = build_tree(&HardwareSnapshot::new(machine), &AllocatorConfig::default()).unwrap();
        aggregate(&mut root, true, &links).unwrap();
        assert_eq!(select_many(&root, 2), left);
        // Three GPUs do not fit a single socket, so the search stops at the root.
        let selected = select_many(&root, 3);
        assert_eq!(selected.len(), 3);
        assert_eq!(&selected[..2], &left[..]);
    }
}
