// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Geometric partitioning.
//!
//! The block is split along a line given by an angle and a distance from the centre. Each side
//! is predicted from one list of a merge candidate; 4x4 units crossed by the line store the
//! motion of both.

use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::MvPrecision;
use crate::codec::vvc::mvp::InterCtx;
use crate::codec::vvc::mvp::PbPos;

pub const GEO_NUM_ANGLES: usize = 32;
pub const GEO_NUM_PARTITION_MODE: usize = 64;

/// Displacement of the partition line per angle.
pub const GEO_DIS: [i32; GEO_NUM_ANGLES] = [
    8, 8, 8, 8, 4, 4, 2, 1, 0, -1, -2, -4, -4, -8, -8, -8, -8, -8, -8, -8, -4, -4, -2, -1, 0, 1,
    2, 4, 4, 8, 8, 8,
];

/// Angle and distance indices of each partition mode.
#[rustfmt::skip]
pub const GEO_PARAMS: [(u8, u8); GEO_NUM_PARTITION_MODE] = [
    (0, 1), (0, 3),
    (2, 0), (2, 1), (2, 2), (2, 3),
    (3, 0), (3, 1), (3, 2), (3, 3),
    (4, 0), (4, 1), (4, 2), (4, 3),
    (5, 0), (5, 1), (5, 2), (5, 3),
    (8, 1), (8, 3),
    (11, 0), (11, 1), (11, 2), (11, 3),
    (12, 0), (12, 1), (12, 2), (12, 3),
    (13, 0), (13, 1), (13, 2), (13, 3),
    (14, 0), (14, 1), (14, 2), (14, 3),
    (16, 1), (16, 3),
    (18, 1), (18, 2), (18, 3),
    (19, 1), (19, 2), (19, 3),
    (20, 1), (20, 2), (20, 3),
    (21, 1), (21, 2), (21, 3),
    (24, 1), (24, 3),
    (27, 1), (27, 2), (27, 3),
    (28, 1), (28, 2), (28, 3),
    (29, 1), (29, 2), (29, 3),
    (30, 1), (30, 2), (30, 3),
];

/// Motion source of a 4x4 unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpmUnit {
    First,
    Second,
    /// On the partition line.
    Blended,
}

/// Result of a GPM derivation, for the blending stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpmInfo {
    pub split_dir: u8,
    pub angle: u8,
    pub distance: u8,
    /// Uni-predicted motion of each side.
    pub cands: [MergeInfo; 2],
}

impl GpmInfo {
    /// Motion source of unit `(x, y)` of a block of `w` by `h` 4x4 units.
    pub fn unit(&self, x: i32, y: i32, w: i32, h: i32) -> GpmUnit {
        let angle = usize::from(self.angle) % GEO_NUM_ANGLES;
        let dist = i32::from(self.distance);
        let x_dis = GEO_DIS[angle];
        let y_dis = GEO_DIS[(angle + 8) % GEO_NUM_ANGLES];
        let flip = (13..=27).contains(&angle);

        let mut offset_x = -(w * 4) / 2;
        let mut offset_y = -(h * 4) / 2;
        if dist > 0 {
            let sign = if angle < 16 { 1 } else { -1 };
            if angle % 16 == 8 || (angle % 16 != 0 && h >= w) {
                offset_y += sign * ((dist * h) >> 1);
            } else {
                offset_x += sign * ((dist * w) >> 1);
            }
        }

        let motion_idx = (((4 * x + offset_x) << 1) + 5) * x_dis + (((4 * y + offset_y) << 1) + 5) * y_dis;
        if motion_idx.abs() < 32 {
            GpmUnit::Blended
        } else if (motion_idx <= 0) != flip {
            GpmUnit::Second
        } else {
            GpmUnit::First
        }
    }

    /// Motion stored for units on the partition line: both sides when they use different
    /// lists, the second side otherwise.
    fn blended(&self) -> MergeInfo {
        let [a, b] = self.cands;
        if a.inter_dir == b.inter_dir {
            return b;
        }

        let mut info = MergeInfo {
            inter_dir: InterDir::BI,
            ..Default::default()
        };
        for c in [a, b] {
            let list = usize::from(c.inter_dir == InterDir::L1);
            *info.mv_mut(list) = *c.mv(list);
        }
        info
    }
}

impl InterCtx {
    /// Uni-predicted motion from merge candidate `merge_idx`. Even indices prefer list 0, odd
    /// ones list 1.
    fn gpm_cand(&mut self, pb: &PbPos, merge_idx: usize, max_nb_cand: usize) -> MergeInfo {
        let cand = self.merge_cand(pb, merge_idx, max_nb_cand);
        let parity = merge_idx & 1;
        let list = if cand.inter_dir.contains(InterDir::list(parity)) {
            parity
        } else {
            1 - parity
        };

        let mut mv = *cand.mv(list);
        mv.bcw_idx_plus1 = 0;
        mv.prec = MvPrecision::default();
        MergeInfo::uni(list, mv)
    }

    /// Geometric partition merge: `split_dir` selects the partition line, `merge_idx` the
    /// candidates of each side.
    pub fn gpm_merge(
        &mut self,
        pb: &PbPos,
        split_dir: u8,
        merge_idx: [usize; 2],
        max_nb_cand: usize,
    ) -> GpmInfo {
        let (angle, distance) = GEO_PARAMS[usize::from(split_dir) % GEO_NUM_PARTITION_MODE];
        let cands = [
            self.gpm_cand(pb, merge_idx[0], max_nb_cand),
            self.gpm_cand(pb, merge_idx[1], max_nb_cand),
        ];
        let info = GpmInfo {
            split_dir,
            angle,
            distance,
            cands,
        };

        let blended = info.blended();
        for y in 0..pb.h {
            for x in 0..pb.w {
                let motion = match info.unit(x, y, pb.w, pb.h) {
                    GpmUnit::First => &info.cands[0],
                    GpmUnit::Second => &info.cands[1],
                    GpmUnit::Blended => &blended,
                };
                self.store_unit(motion, pb.x + x, pb.y + y);
            }
        }

        self.dbf
            .check_units(&self.fields, &self.tmvp.dist_ref, pb.x, pb.y, pb.w, pb.h);

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::mv::Mv;
    use crate::codec::vvc::mvp::tests::ctx;

    fn info(split_dir: u8) -> GpmInfo {
        let (angle, distance) = GEO_PARAMS[split_dir as usize];
        GpmInfo {
            split_dir,
            angle,
            distance,
            cands: [
                MergeInfo::uni(0, Mv::with_ref(4, 0, 0)),
                MergeInfo::uni(1, Mv::with_ref(-4, 0, 0)),
            ],
        }
    }

    #[test]
    fn vertical_split_through_centre() {
        // Angle 0, distance 1 on a 16x16 block: left and right halves around the shifted line.
        let gpm = info(0);
        assert_eq!((gpm.angle, gpm.distance), (0, 1));

        let row: Vec<GpmUnit> = (0..4).map(|x| gpm.unit(x, 0, 4, 4)).collect();
        assert_eq!(row[0], GpmUnit::Second);
        assert_eq!(row[3], GpmUnit::First);
        // Rows are identical for a vertical line.
        for y in 1..4 {
            for x in 0..4 {
                assert_eq!(gpm.unit(x, y, 4, 4), row[x as usize]);
            }
        }
    }

    #[test]
    fn horizontal_split() {
        // Angle 8: the line runs horizontally, columns are identical.
        let gpm = info(18);
        assert_eq!(gpm.angle, 8);

        for x in 1..4 {
            for y in 0..4 {
                assert_eq!(gpm.unit(x, y, 4, 4), gpm.unit(0, y, 4, 4));
            }
        }
        assert_ne!(gpm.unit(0, 0, 4, 4), gpm.unit(0, 3, 4, 4));
    }

    #[test]
    fn blended_units_mix_lists() {
        let gpm = info(0);
        let mixed = gpm.blended();
        assert_eq!(mixed.inter_dir, InterDir::BI);
        assert_eq!(mixed.mv0.x, 4);
        assert_eq!(mixed.mv1.x, -4);

        let mut same = gpm;
        same.cands[1] = MergeInfo::uni(0, Mv::with_ref(8, 0, 1));
        assert_eq!(same.blended(), same.cands[1]);
    }

    #[test]
    fn merge_stores_motion_per_unit() {
        let mut ctx = ctx(true, &[1, -1]);
        let left = MergeInfo {
            inter_dir: InterDir::BI,
            mv0: Mv::with_ref(16, 0, 0),
            mv1: Mv::with_ref(-16, 0, 1),
        };
        ctx.store_motion(&left, &PbPos::new(0, 0, 4, 4));

        let pb = PbPos::new(16, 0, 4, 4);
        let hmvp_len = ctx.hmvp().len();
        let gpm = ctx.gpm_merge(&pb, 0, [0, 1], 6);

        // Candidate 0 is the left neighbour: list 0 for the even index.
        assert_eq!(gpm.cands[0], MergeInfo::uni(0, Mv::with_ref(16, 0, 0)));
        // Candidate 1 is a zero candidate: list 1 for the odd index.
        assert_eq!(gpm.cands[1], MergeInfo::uni(1, Mv::with_ref(0, 0, 0)));

        // The history is left untouched.
        assert_eq!(ctx.hmvp().len(), hmvp_len);

        for y in 0..pb.h {
            for x in 0..pb.w {
                let (ux, uy) = (pb.x + x, pb.y + y);
                let l0 = ctx.fields()[0].is_available(ux, uy);
                let l1 = ctx.fields()[1].is_available(ux, uy);
                match gpm.unit(x, y, pb.w, pb.h) {
                    GpmUnit::First => assert!(l0 && !l1),
                    GpmUnit::Second => assert!(!l0 && l1),
                    GpmUnit::Blended => assert!(l0 && l1),
                }
            }
        }
    }
}
