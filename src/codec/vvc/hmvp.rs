// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! History-based motion vector prediction.

use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::Mv;

/// Number of entries kept in the history.
pub const HMVP_SIZE: usize = 5;

/// Number of history entries an AMVP list may look at.
const HMVP_AMVP_CHECKS: usize = 4;

/// Number of newest history entries pruned against the spatial merge candidates.
const HMVP_MERGE_PRUNED: usize = 2;

/// Motion of the last inter coded blocks, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HmvpLut {
    entries: Vec<MergeInfo>,
}

impl HmvpLut {
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MergeInfo] {
        &self.entries
    }

    /// Records the motion of a block. An identical entry is moved to the newest position instead
    /// of being duplicated, otherwise the oldest entry is evicted once the history is full.
    pub fn update(&mut self, info: MergeInfo) {
        if let Some(pos) = self.entries.iter().position(|e| e.same_motion(&info)) {
            self.entries.remove(pos);
        } else if self.entries.len() == HMVP_SIZE {
            self.entries.remove(0);
        }
        self.entries.push(info);
    }

    /// Appends history candidates to an AMVP list of `list` until it holds two entries.
    ///
    /// Oldest entries come first. An entry contributes its `list` vector when it points at
    /// `ref_idx`, then its other list vector when that one points at `opp_ref_idx`, the index of
    /// the same picture in the other list.
    pub fn add_amvp_cands(&self, cands: &mut Vec<Mv>, list: usize, ref_idx: u8, opp_ref_idx: u8) {
        let own = InterDir::list(list);
        let opp = InterDir::list(1 - list);

        for entry in self.entries.iter().take(HMVP_AMVP_CHECKS) {
            if cands.len() >= 2 {
                return;
            }

            if entry.inter_dir.intersects(own) && entry.mv(list).ref_idx == ref_idx {
                cands.push(*entry.mv(list));
            }

            if cands.len() == 2 {
                return;
            }

            if entry.inter_dir.intersects(opp) && entry.mv(1 - list).ref_idx == opp_ref_idx {
                cands.push(*entry.mv(1 - list));
            }
        }
    }

    /// Appends history candidates to a merge list, newest first.
    ///
    /// The two newest entries are skipped when they match the B1 or A1 spatial candidate.
    /// Returns true once the candidate at `merge_idx` has been appended. Stops without it when
    /// the list reaches `max_nb_cand - 1` entries, leaving room for the pairwise candidate.
    /// `filter` restricts the entries to those using at least one of its lists.
    pub fn add_merge_cands(
        &self,
        cands: &mut Vec<MergeInfo>,
        b1: Option<&MergeInfo>,
        a1: Option<&MergeInfo>,
        filter: InterDir,
        merge_idx: usize,
        max_nb_cand: usize,
    ) -> bool {
        for (i, entry) in self.entries.iter().rev().enumerate() {
            if !entry.inter_dir.intersects(filter) {
                continue;
            }

            let pruned = i < HMVP_MERGE_PRUNED
                && (b1.is_some_and(|c| c.same_motion(entry))
                    || a1.is_some_and(|c| c.same_motion(entry)));
            if pruned {
                continue;
            }

            cands.push(*entry);
            if cands.len() == merge_idx + 1 {
                return true;
            }

            if cands.len() + 1 >= max_nb_cand {
                return false;
            }
        }

        false
    }
}
