// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Merge with motion vector difference.
//!
//! One of the first two merge candidates is refined by an offset taken from a fixed set of
//! distances along the four axis directions.

use crate::codec::vvc::mv::compute_scale;
use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::mvp::InterCtx;
use crate::codec::vvc::mvp::PbPos;
use crate::codec::vvc::picture::RefType;
use crate::codec::vvc::MAX_NUM_REF;

/// Offset distances in quarter samples.
pub const MMVD_DISTANCES: [i32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Number of refinements of a base candidate: 8 distances in 4 directions.
pub const MMVD_REFINE_NUM: usize = 32;

/// Number of base candidates.
pub const MMVD_BASE_NUM: usize = 2;

/// Coded MMVD syntax.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmvdIdx {
    /// Merge candidate being refined, 0 or 1.
    pub base: u8,
    /// Index in [`MMVD_DISTANCES`].
    pub distance: u8,
    /// 0 to 3: +x, -x, +y, -y.
    pub direction: u8,
}

impl MmvdIdx {
    /// Splits the combined index `base * 32 + distance * 4 + direction`.
    pub fn from_combined(idx: usize) -> Self {
        let refine = idx % MMVD_REFINE_NUM;
        Self {
            base: (idx / MMVD_REFINE_NUM) as u8,
            distance: (refine >> 2) as u8,
            direction: (refine & 3) as u8,
        }
    }

    pub fn combined(&self) -> usize {
        usize::from(self.base) * MMVD_REFINE_NUM
            + (usize::from(self.distance) << 2)
            + usize::from(self.direction)
    }

    /// Offset in 1/16 samples. `shift` is 2 when the slice restricts MMVD to full samples.
    pub fn offset(&self, shift: u8) -> Mv {
        let dist = (MMVD_DISTANCES[usize::from(self.distance) & 7] << 2) << shift;
        match self.direction & 3 {
            0 => Mv::new(dist, 0),
            1 => Mv::new(-dist, 0),
            2 => Mv::new(0, dist),
            _ => Mv::new(0, -dist),
        }
    }
}

fn negate(mv: Mv) -> Mv {
    Mv::new(-mv.x, -mv.y)
}

/// Offsets of both lists of a bi-predicted candidate.
///
/// The offset applies as is to the list with the farther reference. The other list gets it
/// scaled by the ratio of POC distances, or only mirrored when either reference is long-term.
fn bi_offsets(offset: Mv, d0: i32, d1: i32, long_term: bool) -> (Mv, Mv) {
    let derive = |far: i32, near: i32| {
        if long_term {
            if far * near <= 0 {
                negate(offset)
            } else {
                offset
            }
        } else {
            offset.scale(compute_scale(near, far))
        }
    };

    if d0 == d1 {
        (offset, offset)
    } else if d0.abs() < d1.abs() {
        (derive(d1, d0), offset)
    } else {
        (offset, derive(d0, d1))
    }
}

impl InterCtx {
    /// Refines merge candidate `idx.base` with the offset `idx` designates.
    pub fn mmvd_merge(&mut self, pb: &PbPos, idx: MmvdIdx, max_nb_cand: usize) -> MergeInfo {
        let mut info = self.merge_cand(pb, usize::from(idx.base), max_nb_cand);
        let offset = idx.offset(self.mmvd_shift);

        if !self.bi_pred {
            info.inter_dir = InterDir::L0;
        }

        if info.inter_dir == InterDir::BI {
            let (r0, r1) = (
                info.mv0.ref_idx as usize % MAX_NUM_REF,
                info.mv1.ref_idx as usize % MAX_NUM_REF,
            );
            let long_term = self.ref_types[0][r0] == RefType::LongTerm
                || self.ref_types[1][r1] == RefType::LongTerm;
            let (mvd0, mvd1) = bi_offsets(
                offset,
                self.tmvp.dist_ref[0][r0],
                self.tmvp.dist_ref[1][r1],
                long_term,
            );
            info.mv0 = info.mv0.add(mvd0);
            info.mv1 = info.mv1.add(mvd1);

            if pb.is_small() {
                info.inter_dir = InterDir::L0;
            }
        } else {
            let list = usize::from(info.inter_dir == InterDir::L1);
            let mv = info.mv_mut(list);
            *mv = mv.add(offset);
        }

        self.store_motion(&info, pb);
        self.hmvp.update(info);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::mvp::tests::ctx;

    #[test]
    fn offsets() {
        let idx = |combined| MmvdIdx::from_combined(combined);

        assert_eq!(idx(0).offset(0), Mv::new(4, 0));
        assert_eq!(idx(5).offset(0), Mv::new(-8, 0));
        assert_eq!(idx(2).offset(2), Mv::new(0, 16));
        assert_eq!(idx(63).offset(0), Mv::new(0, -512));

        let last = idx(63);
        assert_eq!(last.base, 1);
        assert_eq!(last.distance, 7);
        assert_eq!(last.combined(), 63);
    }

    #[test]
    fn p_refines_list0() {
        let mut ctx = ctx(false, &[1]);
        let pb = PbPos::new(0, 0, 3, 3);
        let info = ctx.mmvd_merge(&pb, MmvdIdx::from_combined(6), 6);

        assert_eq!(info.inter_dir, InterDir::L0);
        assert_eq!((info.mv0.x, info.mv0.y), (0, 8));
        assert_eq!(ctx.hmvp().len(), 1);
    }

    fn bi_neighbour(ctx: &mut InterCtx, ref0: u8, ref1: u8) {
        let bi = MergeInfo {
            inter_dir: InterDir::BI,
            mv0: Mv::with_ref(16, 16, ref0),
            mv1: Mv::with_ref(-16, -16, ref1),
        };
        ctx.store_motion(&bi, &PbPos::new(0, 0, 3, 3));
    }

    #[test]
    fn bi_offsets_follow_poc_distances() {
        // Same distance: same offset on both sides.
        assert_eq!(bi_offsets(Mv::new(4, 0), 1, 1, false), (Mv::new(4, 0), Mv::new(4, 0)));
        // Opposite sides, same distance: mirrored.
        assert_eq!(bi_offsets(Mv::new(4, 0), 1, -1, false), (Mv::new(4, 0), Mv::new(-4, 0)));
        // List 1 is farther: the offset goes there, list 0 gets it scaled down and mirrored.
        assert_eq!(bi_offsets(Mv::new(8, 0), 1, -2, false), (Mv::new(-4, 0), Mv::new(8, 0)));
        // Long-term: mirrored only.
        assert_eq!(bi_offsets(Mv::new(8, 0), 1, -2, true), (Mv::new(-8, 0), Mv::new(8, 0)));
        assert_eq!(bi_offsets(Mv::new(8, 0), 2, 1, true), (Mv::new(8, 0), Mv::new(8, 0)));
    }

    #[test]
    fn b_scales_offset_of_nearer_list() {
        let mut ctx = ctx(true, &[1, -2]);
        bi_neighbour(&mut ctx, 0, 1);

        let pb = PbPos::new(8, 0, 3, 3);
        // Distance 2 quarter samples, +x.
        let info = ctx.mmvd_merge(&pb, MmvdIdx::from_combined(4), 6);
        assert_eq!(info.inter_dir, InterDir::BI);
        assert_eq!((info.mv0.x, info.mv0.y), (12, 16));
        assert_eq!((info.mv1.x, info.mv1.y), (-8, -16));
    }

    #[test]
    fn b_long_term_mirrors() {
        let mut ctx = ctx(true, &[1, -2]);
        ctx.ref_types[1][1] = RefType::LongTerm;
        bi_neighbour(&mut ctx, 0, 1);

        let pb = PbPos::new(8, 0, 3, 3);
        let info = ctx.mmvd_merge(&pb, MmvdIdx::from_combined(4), 6);
        assert_eq!((info.mv0.x, info.mv1.x), (8, -8));
    }

    #[test]
    fn small_bi_block_keeps_list0() {
        let mut ctx = ctx(true, &[1, -1]);
        bi_neighbour(&mut ctx, 0, 0);

        let pb = PbPos::new(8, 0, 3, 2);
        let info = ctx.mmvd_merge(&pb, MmvdIdx::from_combined(0), 6);
        assert_eq!(info.inter_dir, InterDir::L0);
        assert_eq!((info.mv0.x, info.mv0.y), (20, 16));
    }
}
