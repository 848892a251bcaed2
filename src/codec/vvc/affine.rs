// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Affine motion.
//!
//! A block carries two or three control-point vectors (top-left, top-right, bottom-left) per
//! list. Each 4x4 sub-block gets the vector of the model at its centre.

use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::mv::MvPrecision;
use crate::codec::vvc::mv::MV_MAX;
use crate::codec::vvc::mv::MV_MIN;
use crate::codec::vvc::mvp::InterCtx;
use crate::codec::vvc::mvp::PbPos;
use crate::codec::vvc::mvp::BCW_DEFAULT;
use crate::utils::clip3;

/// Log2 of the largest coding block side.
const AFFINE_SHIFT: u8 = 7;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffineType {
    /// Rotation and zoom: two control points.
    #[default]
    FourParam,
    /// Full model: three control points.
    SixParam,
}

impl AffineType {
    pub fn nb_cps(&self) -> usize {
        match self {
            AffineType::FourParam => 2,
            AffineType::SixParam => 3,
        }
    }
}

fn round_affine(v: i32) -> i32 {
    let offset = 1 << (AFFINE_SHIFT - 1);
    clip3(MV_MIN, MV_MAX, (v + offset - i32::from(v >= 0)) >> AFFINE_SHIFT)
}

/// Shifts `v` by the log2 ratio `to - from`.
fn rescale(v: i32, from: u8, to: u8) -> i32 {
    if to >= from {
        v << (to - from)
    } else {
        v >> (from - to)
    }
}

/// Vector of the 4x4 sub-block `(x, y)` of a `1 << log2_w` by `1 << log2_h` block.
///
/// Side information is taken from the top-left control point.
pub fn sub_block_mv(type_: AffineType, cps: &[Mv; 3], log2_w: u8, log2_h: u8, x: i32, y: i32) -> Mv {
    let shift_w = AFFINE_SHIFT.saturating_sub(log2_w);
    let shift_h = AFFINE_SHIFT.saturating_sub(log2_h);

    let d_hor_x = (cps[1].x - cps[0].x) << shift_w;
    let d_ver_x = (cps[1].y - cps[0].y) << shift_w;
    let (d_hor_y, d_ver_y) = match type_ {
        AffineType::SixParam => (
            (cps[2].x - cps[0].x) << shift_h,
            (cps[2].y - cps[0].y) << shift_h,
        ),
        AffineType::FourParam => (-d_ver_x, d_hor_x),
    };

    let (px, py) = (x * 4 + 2, y * 4 + 2);
    let mut mv = cps[0];
    mv.x = round_affine((cps[0].x << AFFINE_SHIFT) + d_hor_x * px + d_hor_y * py);
    mv.y = round_affine((cps[0].y << AFFINE_SHIFT) + d_ver_x * px + d_ver_y * py);
    mv
}

/// Affine motion of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AffineInfo {
    pub type_: AffineType,
    pub inter_dir: InterDir,
    /// Top-left, top-right and bottom-left control points per list. The bottom-left one of a
    /// four parameter model follows from the other two.
    pub cps: [[Mv; 3]; 2],
}

impl AffineInfo {
    /// Motion of sub-block `(x, y)` of `pb`.
    pub fn sub_block(&self, pb: &PbPos, x: i32, y: i32) -> MergeInfo {
        let mut info = MergeInfo {
            inter_dir: self.inter_dir,
            ..Default::default()
        };
        for list in 0..2 {
            if self.inter_dir.contains(InterDir::list(list)) {
                *info.mv_mut(list) =
                    sub_block_mv(self.type_, &self.cps[list], pb.log2_w, pb.log2_h, x, y);
            }
        }
        info
    }
}

/// Bottom-left control point of a four parameter model.
fn bottom_left(cp0: Mv, cp1: Mv, pb: &PbPos) -> Mv {
    let mut mv = cp0;
    mv.x = cp0.x - rescale(cp1.y - cp0.y, pb.log2_w, pb.log2_h);
    mv.y = cp0.y + rescale(cp1.x - cp0.x, pb.log2_w, pb.log2_h);
    mv
}

/// Top-right control point of a four parameter model.
fn top_right(cp0: Mv, cp2: Mv, pb: &PbPos) -> Mv {
    let mut mv = cp0;
    mv.x = cp0.x + rescale(cp2.y - cp0.y, pb.log2_h, pb.log2_w);
    mv.y = cp0.y - rescale(cp2.x - cp0.x, pb.log2_h, pb.log2_w);
    mv
}

/// Corners the constructed candidates are built from.
#[derive(Clone, Copy, Debug)]
enum Combination {
    /// Top-left, top-right and bottom-left.
    Full,
    /// Top-left and top-right.
    Top,
    /// Top-left and bottom-left.
    Left,
}

impl Combination {
    fn corners(self) -> &'static [usize] {
        match self {
            Combination::Full => &[0, 1, 2],
            Combination::Top => &[0, 1],
            Combination::Left => &[0, 2],
        }
    }
}

/// Syntax of an explicitly coded affine block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AffineAmvpParams {
    pub type_: AffineType,
    pub inter_dir: InterDir,
    pub ref_idx: [u8; 2],
    pub mvp_idx: [u8; 2],
    /// Control-point differences per list, in `prec` units.
    pub mvd: [[Mv; 3]; 2],
    pub prec: MvPrecision,
    pub bcw_idx: u8,
}

impl Default for AffineAmvpParams {
    fn default() -> Self {
        Self {
            type_: AffineType::FourParam,
            inter_dir: InterDir::L0,
            ref_idx: [0; 2],
            mvp_idx: [0; 2],
            mvd: [[Mv::default(); 3]; 2],
            prec: MvPrecision::Quarter,
            bcw_idx: BCW_DEFAULT,
        }
    }
}

impl InterCtx {
    /// Neighbour positions of the top-left, top-right and bottom-left corners, in search order.
    fn corner_positions(pb: &PbPos) -> [Vec<(i32, i32)>; 3] {
        let (x, y, w, h) = (pb.x, pb.y, pb.w, pb.h);
        [
            vec![(x - 1, y - 1), (x, y - 1), (x - 1, y)],
            vec![(x + w - 1, y - 1), (x + w, y - 1)],
            vec![(x - 1, y + h - 1), (x - 1, y + h)],
        ]
    }

    fn corner_merge(&self, positions: &[(i32, i32)]) -> Option<MergeInfo> {
        positions.iter().find_map(|&(x, y)| {
            let avail = (
                self.fields[0].is_available(x, y),
                self.fields[1].is_available(x, y),
            );
            self.neighbour_info(avail, (x, y))
        })
    }

    /// Candidates built from the translational motion around the corners. A list takes part
    /// when every corner of the combination uses it with the same reference.
    fn constructed_merge(&self, pb: &PbPos) -> Vec<AffineInfo> {
        let corners = Self::corner_positions(pb).map(|p| self.corner_merge(&p));
        let combinations: &[Combination] = if self.six_param_affine {
            &[Combination::Full, Combination::Top, Combination::Left]
        } else {
            &[Combination::Top, Combination::Left]
        };

        let mut cands = vec![];
        for &combination in combinations {
            let Some(cps) = combination
                .corners()
                .iter()
                .map(|&k| corners[k])
                .collect::<Option<Vec<MergeInfo>>>()
            else {
                continue;
            };

            let mut info = AffineInfo {
                type_: match combination {
                    Combination::Full => AffineType::SixParam,
                    _ => AffineType::FourParam,
                },
                ..Default::default()
            };

            for list in 0..2 {
                let dir = InterDir::list(list);
                let ref_idx = cps[0].mv(list).ref_idx;
                if !cps
                    .iter()
                    .all(|c| c.inter_dir.contains(dir) && c.mv(list).ref_idx == ref_idx)
                {
                    continue;
                }

                let mvs: Vec<Mv> = cps.iter().map(|c| c.mv(list).reset_side_info()).collect();
                info.cps[list] = match combination {
                    Combination::Full => [mvs[0], mvs[1], mvs[2]],
                    Combination::Top => [mvs[0], mvs[1], bottom_left(mvs[0], mvs[1], pb)],
                    Combination::Left => [mvs[0], top_right(mvs[0], mvs[1], pb), mvs[1]],
                };
                info.inter_dir |= dir;
            }

            if !info.inter_dir.is_empty() {
                cands.push(info);
            }
        }

        cands
    }

    fn zero_affine(&self) -> AffineInfo {
        AffineInfo {
            type_: AffineType::FourParam,
            inter_dir: if self.bi_pred {
                InterDir::BI
            } else {
                InterDir::L0
            },
            cps: [[Mv::with_ref(0, 0, 0); 3]; 2],
        }
    }

    /// Writes the sub-block motion of an affine block and derives its deblocking edges.
    fn store_affine(&mut self, info: &AffineInfo, pb: &PbPos) {
        for y in 0..pb.h {
            for x in 0..pb.w {
                let motion = info.sub_block(pb, x, y);
                self.store_unit(&motion, pb.x + x, pb.y + y);
            }
        }
        self.dbf
            .check_units(&self.fields, &self.tmvp.dist_ref, pb.x, pb.y, pb.w, pb.h);
    }

    /// Sub-block merge: candidate `merge_idx` among the constructed affine candidates, padded
    /// with zero motion.
    pub fn affine_merge(&mut self, pb: &PbPos, merge_idx: usize, max_nb_cand: usize) -> AffineInfo {
        let mut cands = self.constructed_merge(pb);
        cands.truncate(max_nb_cand);
        let info = cands
            .get(merge_idx)
            .copied()
            .unwrap_or_else(|| self.zero_affine());

        self.store_affine(&info, pb);
        info
    }

    /// First neighbour of a corner pointing at the reference picture, in either list.
    fn corner_amvp(&self, positions: &[(i32, i32)], list: usize, ref_idx: u8, opp_ref_idx: u8) -> Option<Mv> {
        let (own, opp) = (&self.fields[list], &self.fields[1 - list]);
        positions.iter().find_map(|&(x, y)| {
            if own.is_available(x, y) && own.mv(x, y).ref_idx == ref_idx {
                Some(own.mv(x, y))
            } else if opp.is_available(x, y) && opp.mv(x, y).ref_idx == opp_ref_idx {
                Some(opp.mv(x, y))
            } else {
                None
            }
        })
    }

    /// Control-point predictor `mvp_idx` of `list` for reference `ref_idx`.
    fn affine_amvp_cand(
        &self,
        pb: &PbPos,
        type_: AffineType,
        list: usize,
        ref_idx: u8,
        mvp_idx: u8,
        prec: MvPrecision,
    ) -> [Mv; 3] {
        let opp_ref_idx = self.opp_ref_idx(list, ref_idx);
        let corners = Self::corner_positions(pb)
            .map(|p| self.corner_amvp(&p, list, ref_idx, opp_ref_idx));

        let mut cands: Vec<[Mv; 3]> = Vec::with_capacity(2);
        match (type_, corners) {
            (AffineType::SixParam, [Some(cp0), Some(cp1), Some(cp2)]) => cands.push([cp0, cp1, cp2]),
            (AffineType::FourParam, [Some(cp0), Some(cp1), _]) => {
                cands.push([cp0, cp1, bottom_left(cp0, cp1, pb)])
            }
            _ => (),
        }

        // Translational fallbacks, bottom-left corner first.
        for mv in corners.iter().rev().flatten() {
            if cands.len() >= 2 {
                break;
            }
            cands.push([*mv; 3]);
        }

        while cands.len() < 2 {
            cands.push([Mv::with_ref(0, 0, ref_idx); 3]);
        }

        cands[usize::from(mvp_idx).min(1)].map(|mv| {
            let mut mv = mv.round_to_precision(MvPrecision::INTERNAL, prec);
            mv.ref_idx = ref_idx;
            mv
        })
    }

    /// Explicit affine motion: control-point predictors plus coded differences. The
    /// differences of the second and third points are relative to the first one.
    pub fn affine_amvp(&mut self, pb: &PbPos, params: &AffineAmvpParams) -> AffineInfo {
        let mut info = AffineInfo {
            type_: params.type_,
            inter_dir: params.inter_dir,
            ..Default::default()
        };

        for list in 0..2 {
            if !params.inter_dir.contains(InterDir::list(list)) {
                continue;
            }

            let mvp = self.affine_amvp_cand(
                pb,
                params.type_,
                list,
                params.ref_idx[list],
                params.mvp_idx[list],
                params.prec,
            );
            let mvd = params.mvd[list]
                .map(|d| d.change_precision(params.prec, MvPrecision::INTERNAL));

            let mut cps = [mvp[0].add(mvd[0]), mvp[1].add(mvd[1]).add(mvd[0]), mvp[2]];
            cps[2] = match params.type_ {
                AffineType::SixParam => mvp[2].add(mvd[2]).add(mvd[0]),
                AffineType::FourParam => bottom_left(cps[0], cps[1], pb),
            };
            for cp in cps.iter_mut() {
                cp.ref_idx = params.ref_idx[list];
                cp.bcw_idx_plus1 = params.bcw_idx + 1;
                cp.prec = params.prec;
            }
            info.cps[list] = cps;
        }

        self.store_affine(&info, pb);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::mvp::tests::ctx;

    #[test]
    fn four_param_zoom() {
        let cps = [Mv::new(0, 0), Mv::new(16, 0), Mv::default()];
        // 16x16 block: the vector grows with the sub-block centre.
        let mv = sub_block_mv(AffineType::FourParam, &cps, 4, 4, 0, 0);
        assert_eq!((mv.x, mv.y), (2, 2));
        let mv = sub_block_mv(AffineType::FourParam, &cps, 4, 4, 3, 3);
        assert_eq!((mv.x, mv.y), (14, 14));
    }

    #[test]
    fn six_param_vertical_stretch() {
        let cps = [Mv::new(0, 0), Mv::new(0, 0), Mv::new(0, 16)];
        let mv = sub_block_mv(AffineType::SixParam, &cps, 4, 4, 1, 2);
        assert_eq!((mv.x, mv.y), (0, 10));
    }

    #[test]
    fn translation_is_uniform() {
        let cps = [Mv::with_ref(-12, 40, 1); 3];
        for (x, y) in [(0, 0), (1, 3), (3, 1)] {
            assert_eq!(
                sub_block_mv(AffineType::FourParam, &cps, 4, 4, x, y),
                Mv::with_ref(-12, 40, 1)
            );
        }
    }

    fn corners(ctx: &mut InterCtx) {
        let l0 = |x, y| MergeInfo::uni(0, Mv::with_ref(x, y, 0));
        // Around a 16x16 block at (16, 16): top-left, top-right and bottom-left neighbours.
        ctx.store_motion(&l0(0, 0), &PbPos::new(8, 8, 3, 3));
        ctx.store_motion(&l0(16, 0), &PbPos::new(16, 8, 4, 3));
        ctx.store_motion(&l0(0, 16), &PbPos::new(8, 16, 3, 4));
    }

    #[test]
    fn constructed_merge_candidates() {
        let mut ctx = ctx(false, &[1]);
        corners(&mut ctx);

        let pb = PbPos::new(16, 16, 4, 4);
        let cands = ctx.constructed_merge(&pb);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].type_, AffineType::FourParam);
        assert_eq!(cands[0].cps[0][1], Mv::with_ref(16, 0, 0));
        // Bottom-left and top-right corners describe the same model.
        assert_eq!(cands[1].cps[0][1], Mv::with_ref(16, 0, 0));
        assert_eq!(cands[0].cps[0][2], Mv::with_ref(0, 16, 0));

        ctx.six_param_affine = true;
        let cands = ctx.constructed_merge(&pb);
        assert_eq!(cands.len(), 3);
        assert_eq!(cands[0].type_, AffineType::SixParam);

        let info = ctx.affine_merge(&pb, 0, 5);
        assert_eq!(info.inter_dir, InterDir::L0);
        assert_eq!(ctx.fields()[0].mv(7, 7), Mv::with_ref(14, 14, 0));
        assert!(!ctx.fields()[1].is_available(7, 7));

        // Past the constructed candidates: zero motion.
        let info = ctx.affine_merge(&pb, 4, 5);
        assert_eq!(info.cps[0], [Mv::with_ref(0, 0, 0); 3]);
    }

    #[test]
    fn amvp_adds_differences_relative_to_first_point() {
        let mut ctx = ctx(false, &[1]);
        corners(&mut ctx);

        let pb = PbPos::new(16, 16, 4, 4);
        let mut params = AffineAmvpParams::default();
        params.mvd[0][0] = Mv::new(1, 0);
        let info = ctx.affine_amvp(&pb, &params);

        assert_eq!((info.cps[0][0].x, info.cps[0][0].y), (4, 0));
        assert_eq!((info.cps[0][1].x, info.cps[0][1].y), (20, 0));
        assert_eq!(info.cps[0][0].bcw_idx_plus1, BCW_DEFAULT + 1);
    }

    #[test]
    fn amvp_falls_back_to_translation() {
        let mut ctx = ctx(false, &[1]);
        // Left of the bottom of the block only.
        ctx.store_motion(
            &MergeInfo::uni(0, Mv::with_ref(0, 16, 0)),
            &PbPos::new(8, 24, 3, 3),
        );

        let pb = PbPos::new(16, 16, 4, 4);
        let mvp = ctx.affine_amvp_cand(&pb, AffineType::FourParam, 0, 0, 0, MvPrecision::Quarter);
        assert_eq!(mvp, [Mv::with_ref(0, 16, 0); 3]);
        let mvp = ctx.affine_amvp_cand(&pb, AffineType::FourParam, 0, 0, 1, MvPrecision::Quarter);
        assert_eq!(mvp, [Mv::with_ref(0, 0, 0); 3]);
    }
}
