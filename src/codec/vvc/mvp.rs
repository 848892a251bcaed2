// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Motion vector derivation for inter coded blocks.
//!
//! [`InterCtx`] holds everything the derivation of a block depends on: the neighbour motion of
//! the current CTU, the collocated motion, the history list and the reference distances of the
//! slice. Every derivation writes its result back, so that the next block sees it as a
//! neighbour.
//!
//! Block positions are in 4x4 units relative to the CTU origin, see [`PbPos`].

use std::sync::Arc;

use crate::codec::vvc::dbf::DbfInfo;
use crate::codec::vvc::hmvp::HmvpLut;
use crate::codec::vvc::motion_field::MotionLineBuffer;
use crate::codec::vvc::motion_field::MvField;
use crate::codec::vvc::mv::compute_scale;
use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::mv::MvPrecision;
use crate::codec::vvc::params::PictureGeometry;
use crate::codec::vvc::params::SequenceParams;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::picture::RefType;
use crate::codec::vvc::picture::RplInfo;
use crate::codec::vvc::recon::BlockRect;
use crate::codec::vvc::tmvp::CollocatedCtu;
use crate::codec::vvc::tmvp::CtuTmvpBuffer;
use crate::codec::vvc::tmvp::TmvpInfo;
use crate::codec::vvc::LOG2_MIN_CU_S;
use crate::codec::vvc::MAX_NUM_REF;

/// Reference index of the other list when the picture is absent from it.
pub const NO_OPP_REF: u8 = u8::MAX;

/// BCW index of the equal weights.
pub const BCW_DEFAULT: u8 = 2;

pub const MAX_NUM_MERGE_CAND: usize = 6;

/// Prediction block inside the CTU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PbPos {
    /// Position and size in 4x4 units.
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub log2_w: u8,
    pub log2_h: u8,
}

impl PbPos {
    /// Block of `1 << log2_w` by `1 << log2_h` luma samples at offset `(x0, y0)` of the CTU.
    pub fn new(x0: u32, y0: u32, log2_w: u8, log2_h: u8) -> Self {
        Self {
            x: (x0 >> LOG2_MIN_CU_S) as i32,
            y: (y0 >> LOG2_MIN_CU_S) as i32,
            w: 1 << log2_w.saturating_sub(LOG2_MIN_CU_S),
            h: 1 << log2_h.saturating_sub(LOG2_MIN_CU_S),
            log2_w,
            log2_h,
        }
    }

    /// 8x4 and 4x8 blocks: no temporal candidate and no bi-prediction.
    pub fn is_small(&self) -> bool {
        self.log2_w + self.log2_h <= 5
    }

    /// Luma offset in the CTU.
    pub fn luma_pos(&self) -> (u32, u32) {
        ((self.x as u32) << LOG2_MIN_CU_S, (self.y as u32) << LOG2_MIN_CU_S)
    }
}

/// Syntax of an explicitly coded (AMVP) block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmvpParams {
    pub inter_dir: InterDir,
    pub ref_idx: [u8; 2],
    pub mvp_idx: [u8; 2],
    /// Motion vector differences, in `prec` units.
    pub mvd: [Mv; 2],
    pub prec: MvPrecision,
    pub bcw_idx: u8,
}

impl Default for AmvpParams {
    fn default() -> Self {
        Self {
            inter_dir: InterDir::L0,
            ref_idx: [0; 2],
            mvp_idx: [0; 2],
            mvd: [Mv::default(); 2],
            prec: MvPrecision::Quarter,
            bcw_idx: BCW_DEFAULT,
        }
    }
}

/// Rounded average of two vector components.
fn average(a: i32, b: i32) -> i32 {
    let sum = a + b;
    (sum + 1 - i32::from(sum >= 0)) >> 1
}

/// Pairwise candidate of the first two merge candidates.
///
/// Lists used by both are averaged; a list used by one only is copied from it.
fn pairwise_cand(c0: &MergeInfo, c1: &MergeInfo) -> MergeInfo {
    let both = c0.inter_dir & c1.inter_dir;
    let mut avg = *c0;
    avg.inter_dir = both;

    for list in 0..2 {
        let dir = InterDir::list(list);
        if both.contains(dir) {
            let (a, b) = (c0.mv(list), c1.mv(list));
            let mv = avg.mv_mut(list);
            mv.x = average(a.x, b.x);
            mv.y = average(a.y, b.y);
        } else if c1.inter_dir.contains(dir) {
            *avg.mv_mut(list) = *c1.mv(list);
            avg.inter_dir |= dir;
        } else if c0.inter_dir.contains(dir) {
            avg.inter_dir |= dir;
        }
    }

    let prec_of = |c: &MergeInfo| {
        if c.inter_dir.contains(InterDir::L0) {
            c.mv0.prec
        } else {
            c.mv1.prec
        }
    };
    let prec = if prec_of(c0) == prec_of(c1) {
        prec_of(c0)
    } else {
        MvPrecision::default()
    };
    for list in 0..2 {
        let mv = avg.mv_mut(list);
        mv.bcw_idx_plus1 = 0;
        mv.prec = prec;
    }

    avg
}

/// Reference pair used by symmetric MVD: the closest short-term references on each side of
/// `poc`, list 0 looking backward first.
pub fn derive_smvd_refs(poc: i32, rpl_info: &[RplInfo; 2], nb_active: [usize; 2]) -> Option<(u8, u8)> {
    let closest = |list: usize, forward: bool| {
        rpl_info[list]
            .iter()
            .take(nb_active[list])
            .enumerate()
            .filter(|(_, r)| r.type_ == RefType::ShortTerm)
            .filter(|(_, r)| if forward { r.poc > poc } else { r.poc < poc })
            .min_by_key(|(_, r)| (r.poc - poc).abs())
            .map(|(i, _)| i as u8)
    };

    match (closest(0, false), closest(1, true)) {
        (Some(r0), Some(r1)) => Some((r0, r1)),
        _ => closest(0, true).zip(closest(1, false)),
    }
}

/// Samples read around a displaced block by the interpolation filters and the decoder side
/// refinements, in luma samples.
const REF_MARGIN: i32 = 8;

/// Pictures a slice predicts from.
#[derive(Clone, Debug, Default)]
pub struct SliceRefs {
    /// Reference pictures, indexed like the reference lists.
    pub lists: [[Option<Arc<Picture>>; MAX_NUM_REF]; 2],
    /// Picture temporal candidates are read from.
    pub collocated: Option<Arc<Picture>>,
}

/// Inter prediction state of a slice.
#[derive(Debug)]
pub struct InterCtx {
    pub(super) fields: [MvField; 2],
    lines: [MotionLineBuffer; 2],
    pub(super) tmvp_bufs: [CtuTmvpBuffer; 2],
    pub(super) hmvp: HmvpLut,
    pub(super) dbf: DbfInfo,
    pub(super) tmvp: TmvpInfo,
    collocated: Option<Arc<Picture>>,
    ref_pics: [[Option<Arc<Picture>>; MAX_NUM_REF]; 2],
    col_ctu: CollocatedCtu,
    tmvp_enabled: bool,
    pub(super) bi_pred: bool,
    geometry: PictureGeometry,
    nb_unit_ctb: usize,
    ctb: (u32, u32),
    rpl: [[Option<PicId>; MAX_NUM_REF]; 2],
    pub(super) ref_types: [[RefType; MAX_NUM_REF]; 2],
    pub(super) nb_active: [usize; 2],
    smvd_refs: Option<(u8, u8)>,
    /// Extra left shift of the MMVD distances, 2 for full-sample MMVD.
    pub(super) mmvd_shift: u8,
    pub(super) six_param_affine: bool,
}

impl InterCtx {
    pub fn new(geometry: &PictureGeometry) -> Self {
        let (nb_units_w, _) = geometry.resolution.blocks(LOG2_MIN_CU_S);
        let line = MotionLineBuffer::new(nb_units_w as usize);

        Self {
            fields: Default::default(),
            lines: [line.clone(), line],
            tmvp_bufs: Default::default(),
            hmvp: Default::default(),
            dbf: Default::default(),
            tmvp: Default::default(),
            collocated: None,
            ref_pics: Default::default(),
            col_ctu: Default::default(),
            tmvp_enabled: false,
            bi_pred: false,
            geometry: *geometry,
            nb_unit_ctb: (geometry.ctb_size() >> LOG2_MIN_CU_S) as usize,
            ctb: (0, 0),
            rpl: [[None; MAX_NUM_REF]; 2],
            ref_types: Default::default(),
            nb_active: [0; 2],
            smvd_refs: None,
            mmvd_shift: 0,
            six_param_affine: false,
        }
    }

    /// Loads the reference side of a slice of `pic`.
    pub fn start_slice(
        &mut self,
        slice: &SliceParams,
        sps: &SequenceParams,
        pic: &Picture,
        refs: SliceRefs,
    ) {
        let SliceRefs { lists, collocated } = refs;

        self.nb_active = [slice.num_active(0), slice.num_active(1)];
        self.bi_pred = slice.slice_type.is_b();

        {
            let state = pic.state();
            self.tmvp = state.tmvp.clone();
            self.rpl = state.rpl;
            for (types, info) in self.ref_types.iter_mut().zip(state.rpl_info.iter()) {
                *types = Default::default();
                for (t, r) in types.iter_mut().zip(info.iter()) {
                    *t = r.type_;
                }
            }
            self.smvd_refs = if self.bi_pred && sps.tools.smvd && !slice.mvd_l1_zero {
                derive_smvd_refs(state.poc, &state.rpl_info, self.nb_active)
            } else {
                None
            };
        }

        self.tmvp_enabled = sps.tools.temporal_mvp
            && slice.temporal_mvp_enabled
            && !slice.slice_type.is_intra()
            && collocated.is_some();
        self.collocated = collocated;
        self.ref_pics = lists;
        self.mmvd_shift = if slice.fpel_mmvd { 2 } else { 0 };
        self.six_param_affine = sps.tools.affine && sps.tools.six_param_affine;
        self.col_ctu.invalidate();
        self.hmvp.reset();
    }

    /// Starts a CTU row: nothing on the left, empty history.
    pub fn start_row(&mut self) {
        for line in self.lines.iter_mut() {
            line.start_row();
        }
        self.hmvp.reset();
    }

    pub fn end_row(&mut self) {
        for line in self.lines.iter_mut() {
            line.end_row();
        }
    }

    /// Prepares the neighbour buffers of CTU `(ctb_x, ctb_y)`.
    pub fn start_ctu(&mut self, ctb_x: u32, ctb_y: u32) {
        for (line, field) in self.lines.iter().zip(self.fields.iter_mut()) {
            line.load_ctu(field, ctb_x as usize, self.nb_unit_ctb);
        }
        self.col_ctu.invalidate();
        self.dbf.reset();
        self.ctb = (ctb_x, ctb_y);
    }

    /// Saves the motion of the current CTU for its neighbours and, when `pic` keeps motion
    /// planes, for the pictures using it as collocated picture.
    pub fn end_ctu(&mut self, pic: &Picture) {
        let (ctb_x, ctb_y) = (self.ctb.0 as usize, self.ctb.1 as usize);

        for (line, field) in self.lines.iter_mut().zip(self.fields.iter()) {
            line.save_ctu(field, ctb_x, self.nb_unit_ctb);
        }

        let mut state = pic.state();
        for (list, plane) in state.mv_planes.iter_mut().enumerate() {
            if let Some(plane) = plane.as_mut() {
                plane.store_ctu(ctb_x, ctb_y, &self.fields[list], &self.tmvp_bufs[list]);
            }
        }
    }

    pub fn dbf(&self) -> &DbfInfo {
        &self.dbf
    }

    pub fn dbf_mut(&mut self) -> &mut DbfInfo {
        &mut self.dbf
    }

    pub fn hmvp(&self) -> &HmvpLut {
        &self.hmvp
    }

    pub fn fields(&self) -> &[MvField; 2] {
        &self.fields
    }

    /// Low delay: no active reference follows the current picture.
    pub fn ldc(&self) -> bool {
        self.tmvp.ldc
    }

    /// Slot of reference `ref_idx` of `list`.
    pub fn ref_id(&self, list: usize, ref_idx: u8) -> Option<PicId> {
        self.rpl
            .get(list)
            .and_then(|ids| ids.get(ref_idx as usize))
            .copied()
            .flatten()
    }

    /// Slots of the references of `info`, per list.
    pub fn ref_ids(&self, info: &MergeInfo) -> [Option<PicId>; 2] {
        let id = |list: usize| {
            info.inter_dir
                .contains(InterDir::list(list))
                .then(|| self.ref_id(list, info.mv(list).ref_idx))
                .flatten()
        };
        [id(0), id(1)]
    }

    /// Blocks until the samples `blk` reads through `motion` are decoded in its references.
    pub fn wait_for_refs(&self, blk: &BlockRect, motion: &MergeInfo) {
        for list in 0..2 {
            if !motion.inter_dir.contains(InterDir::list(list)) {
                continue;
            }
            let mv = motion.mv(list);
            let Some(pic) = self.ref_pics[list]
                .get(mv.ref_idx as usize)
                .and_then(Option::as_ref)
            else {
                continue;
            };
            let (tl, br) = self.ref_footprint(blk, mv);
            pic.progress().wait_for_region(tl, br);
        }
    }

    /// CTUs holding the reference samples of `blk` displaced by `mv`, clamped to the picture.
    pub(super) fn ref_footprint(&self, blk: &BlockRect, mv: &Mv) -> ((u32, u32), (u32, u32)) {
        let log2_ctb = self.geometry.log2_ctb_size;
        let (nb_ctb_w, nb_ctb_h) = self.geometry.ctb_dims();
        let to_ctb = |pos: i32, nb: u32| ((pos.max(0) as u32) >> log2_ctb).min(nb.saturating_sub(1));

        // 1/16 sample MVs, the fractional part stays within the margin.
        let x0 = blk.x0 as i32 + (mv.x >> 4);
        let y0 = blk.y0 as i32 + (mv.y >> 4);
        let x1 = x0 + blk.width() as i32 - 1;
        let y1 = y0 + blk.height() as i32 - 1;

        (
            (to_ctb(x0 - REF_MARGIN, nb_ctb_w), to_ctb(y0 - REF_MARGIN, nb_ctb_h)),
            (to_ctb(x1 + REF_MARGIN, nb_ctb_w), to_ctb(y1 + REF_MARGIN, nb_ctb_h)),
        )
    }

    /// References used by symmetric MVD, when the slice allows it.
    pub fn smvd_refs(&self) -> Option<(u8, u8)> {
        self.smvd_refs
    }

    /// Whether the two references lie at the same distance on opposite sides of the current
    /// picture, as BDOF and DMVR require.
    pub fn symmetric_refs(&self, ref_idx0: u8, ref_idx1: u8) -> bool {
        let d0 = self.tmvp.dist_ref[0][ref_idx0 as usize % MAX_NUM_REF];
        let d1 = self.tmvp.dist_ref[1][ref_idx1 as usize % MAX_NUM_REF];
        d0 == -d1
    }

    /// Bi-prediction from two short-term references at mirrored distances.
    pub fn is_refinable_bi(&self, info: &MergeInfo) -> bool {
        let (r0, r1) = (info.mv0.ref_idx, info.mv1.ref_idx);
        let short_term =
            |list: usize, r: u8| self.ref_types[list].get(r as usize) == Some(&RefType::ShortTerm);
        info.inter_dir == InterDir::BI
            && short_term(0, r0)
            && short_term(1, r1)
            && self.symmetric_refs(r0, r1)
    }

    /// Index in the other list of the picture at `ref_idx` of `list`, last match.
    pub(super) fn opp_ref_idx(&self, list: usize, ref_idx: u8) -> u8 {
        let Some(id) = self.ref_id(list, ref_idx) else {
            return NO_OPP_REF;
        };
        let nb_active = self.nb_active[1 - list].min(MAX_NUM_REF);
        self.rpl[1 - list][..nb_active]
            .iter()
            .rposition(|r| *r == Some(id))
            .map_or(NO_OPP_REF, |i| i as u8)
    }

    fn load_collocated(&mut self) {
        if self.col_ctu.is_loaded() {
            return;
        }
        if let Some(col) = self.collocated.as_ref() {
            self.col_ctu
                .load(col, &self.geometry, self.ctb.0, self.ctb.1);
        }
    }

    /// Bottom-right (C0) and centre (C1) collocated positions, snapped to the 8x8 grid the
    /// temporal motion is stored on.
    fn col_positions(&self, pb: &PbPos) -> [(i32, i32); 2] {
        let snap = if self.geometry.log2_min_cb_size == 2 {
            !1
        } else {
            !0
        };
        [
            ((pb.x + pb.w) & snap, (pb.y + pb.h) & snap),
            ((pb.x + (pb.w >> 1)) & snap, (pb.y + (pb.h >> 1)) & snap),
        ]
    }

    /// Collocated vector of `col_list` at `pos`, scaled to a reference at `dist_ref`.
    fn col_mv(&self, col_list: usize, (x, y): (i32, i32), dist_ref: i32) -> Option<Mv> {
        if !self.col_ctu.available(col_list, x, y) {
            return None;
        }
        let col = self.col_ctu.mv(col_list, x, y);
        let dist_col = self.tmvp.dist_col[col_list][col.ref_idx as usize % MAX_NUM_REF];
        Some(col.compress().scale(compute_scale(dist_ref, dist_col)))
    }

    fn spatial_amvp(&self, list: usize, ref_idx: u8, opp_ref_idx: u8, pb: &PbPos) -> Vec<Mv> {
        let (own, opp) = (&self.fields[list], &self.fields[1 - list]);
        let n_own = own.neighbours(pb.x, pb.y, pb.w, pb.h);
        let n_opp = opp.neighbours(pb.x, pb.y, pb.w, pb.h);

        let pick = |avail: bool, avail_opp: bool, (x, y): (i32, i32)| {
            let mv = own.mv(x, y);
            if avail && mv.ref_idx == ref_idx {
                return Some(mv);
            }
            let mv = opp.mv(x, y);
            (avail_opp && mv.ref_idx == opp_ref_idx).then_some(mv)
        };
        let (x, y, w, h) = (pb.x, pb.y, pb.w, pb.h);

        let a = pick(n_own.a0, n_opp.a0, MvField::a0_pos(x, y, w, h))
            .or_else(|| pick(n_own.a1, n_opp.a1, MvField::a1_pos(x, y, w, h)));
        let b = pick(n_own.b0, n_opp.b0, MvField::b0_pos(x, y, w, h))
            .or_else(|| pick(n_own.b1, n_opp.b1, MvField::b1_pos(x, y, w, h)))
            .or_else(|| pick(n_own.b2, n_opp.b2, MvField::b2_pos(x, y, w, h)));

        a.into_iter().chain(b).collect()
    }

    fn temporal_amvp(&self, list: usize, ref_idx: u8, pb: &PbPos) -> Option<Mv> {
        let [c0, c1] = self.col_positions(pb);
        let dist_ref = self.tmvp.dist_ref[list][ref_idx as usize % MAX_NUM_REF];
        let first = if (!self.tmvp.col_from_l0 && !self.tmvp.ldc) || (self.tmvp.ldc && list == 0) {
            0
        } else {
            1
        };

        [(c0, first), (c0, 1 - first), (c1, first), (c1, 1 - first)]
            .into_iter()
            .find_map(|(pos, col_list)| self.col_mv(col_list, pos, dist_ref))
    }

    /// Motion vector predictor `mvp_idx` of `list` for reference `ref_idx`, on the `prec` grid.
    pub(super) fn amvp_cand(
        &mut self,
        list: usize,
        ref_idx: u8,
        pb: &PbPos,
        mvp_idx: u8,
        prec: MvPrecision,
    ) -> Mv {
        let opp_ref_idx = self.opp_ref_idx(list, ref_idx);
        let mut cands = self.spatial_amvp(list, ref_idx, opp_ref_idx, pb);

        for c in cands.iter_mut() {
            *c = c.round_to_precision(MvPrecision::INTERNAL, prec);
        }
        if cands.len() == 2 && cands[0].same_vector(&cands[1]) {
            cands.pop();
        }

        if self.tmvp_enabled && cands.len() < 2 && !pb.is_small() {
            self.load_collocated();
            if let Some(mv) = self.temporal_amvp(list, ref_idx, pb) {
                let mut mv = mv.round_to_precision(MvPrecision::INTERNAL, prec);
                mv.ref_idx = ref_idx;
                cands.push(mv);
            }
        }

        if cands.len() < 2 {
            self.hmvp
                .add_amvp_cands(&mut cands, list, ref_idx, opp_ref_idx);
        }

        while cands.len() < 2 {
            cands.push(Mv::with_ref(0, 0, ref_idx));
        }

        cands[usize::from(mvp_idx).min(1)].round_to_precision(MvPrecision::INTERNAL, prec)
    }

    pub(super) fn neighbour_info(&self, (l0, l1): (bool, bool), (x, y): (i32, i32)) -> Option<MergeInfo> {
        let inter_dir = InterDir::from_lists(l0, l1);
        if inter_dir.is_empty() {
            return None;
        }

        let mut info = MergeInfo {
            inter_dir,
            ..Default::default()
        };
        if l0 {
            info.mv0 = self.fields[0].mv(x, y);
        }
        if l1 {
            info.mv1 = self.fields[1].mv(x, y);
        }
        Some(info)
    }

    /// Spatial merge candidates, with the B1 and A1 neighbours the history is pruned against.
    fn spatial_merge(&self, pb: &PbPos) -> (Vec<MergeInfo>, Option<MergeInfo>, Option<MergeInfo>) {
        let (x, y, w, h) = (pb.x, pb.y, pb.w, pb.h);
        let n0 = self.fields[0].neighbours(x, y, w, h);
        let n1 = self.fields[1].neighbours(x, y, w, h);

        let b1 = self.neighbour_info((n0.b1, n1.b1), MvField::b1_pos(x, y, w, h));
        let a1 = self.neighbour_info((n0.a1, n1.a1), MvField::a1_pos(x, y, w, h));
        let b0 = self.neighbour_info((n0.b0, n1.b0), MvField::b0_pos(x, y, w, h));
        let a0 = self.neighbour_info((n0.a0, n1.a0), MvField::a0_pos(x, y, w, h));
        let b2 = self.neighbour_info((n0.b2, n1.b2), MvField::b2_pos(x, y, w, h));

        let differs = |c: &MergeInfo, other: &Option<MergeInfo>| {
            other.as_ref().map_or(true, |o| !c.same_motion(o))
        };

        let mut cands = Vec::with_capacity(MAX_NUM_MERGE_CAND);
        cands.extend(b1);
        cands.extend(a1.filter(|c| differs(c, &b1)));
        cands.extend(b0.filter(|c| differs(c, &b1)));
        cands.extend(a0.filter(|c| differs(c, &a1)));
        if cands.len() < 4 {
            cands.extend(b2.filter(|c| differs(c, &a1) && differs(c, &b1)));
        }

        (cands, b1, a1)
    }

    fn temporal_merge_p(&self, pb: &PbPos) -> Option<MergeInfo> {
        let [c0, c1] = self.col_positions(pb);
        let dist_ref = self.tmvp.dist_ref[0][0];

        [(c0, 0), (c0, 1), (c1, 0), (c1, 1)]
            .into_iter()
            .find_map(|(pos, col_list)| self.col_mv(col_list, pos, dist_ref))
            .map(|mv| {
                let mut mv = mv.reset_side_info();
                mv.ref_idx = 0;
                MergeInfo::uni(0, mv)
            })
    }

    /// Bi-predicted temporal candidate. Both lists are derived from the collocated list
    /// designated by the slice when it carries motion, except in low delay where each list
    /// prefers its own collocated list.
    fn temporal_merge_b(&self, pb: &PbPos) -> Option<MergeInfo> {
        let primary = usize::from(self.tmvp.col_from_l0);

        for pos in self.col_positions(pb) {
            let avail = [
                self.col_ctu.available(0, pos.0, pos.1),
                self.col_ctu.available(1, pos.0, pos.1),
            ];
            if !avail[0] && !avail[1] {
                continue;
            }

            let src = if avail[primary] { primary } else { 1 - primary };
            let mut info = MergeInfo {
                inter_dir: InterDir::BI,
                ..Default::default()
            };
            for target in 0..2 {
                let col_list = if target != src && self.tmvp.ldc && avail[target] {
                    target
                } else {
                    src
                };
                let mv = self.col_mv(col_list, pos, self.tmvp.dist_ref[target][0])?;
                let mut mv = mv.reset_side_info();
                mv.ref_idx = 0;
                *info.mv_mut(target) = mv;
            }
            return Some(info);
        }

        None
    }

    fn zero_cand(&self, merge_idx: usize, nb_cand: usize) -> MergeInfo {
        let nb_refs = if self.bi_pred {
            self.nb_active[0].min(self.nb_active[1])
        } else {
            self.nb_active[0]
        };
        let diff = merge_idx.saturating_sub(nb_cand);
        let ref_idx = if diff < nb_refs { diff as u8 } else { 0 };
        let zero = Mv::with_ref(0, 0, ref_idx);

        if self.bi_pred {
            MergeInfo {
                inter_dir: InterDir::BI,
                mv0: zero,
                mv1: zero,
            }
        } else {
            MergeInfo::uni(0, zero)
        }
    }

    /// Merge candidate `merge_idx` of a list of at most `max_nb_cand` entries. The list is only
    /// built up to the requested entry.
    pub(super) fn merge_cand(&mut self, pb: &PbPos, merge_idx: usize, max_nb_cand: usize) -> MergeInfo {
        let (mut cands, b1, a1) = self.spatial_merge(pb);
        if let Some(c) = cands.get(merge_idx) {
            return *c;
        }

        if self.tmvp_enabled && !pb.is_small() {
            self.load_collocated();
            let temporal = if self.bi_pred {
                self.temporal_merge_b(pb)
            } else {
                self.temporal_merge_p(pb)
            };
            cands.extend(temporal);
            if let Some(c) = cands.get(merge_idx) {
                return *c;
            }
        }

        if cands.len() + 1 != max_nb_cand {
            let filter = if self.bi_pred {
                InterDir::BI
            } else {
                InterDir::L0
            };
            let found = self.hmvp.add_merge_cands(
                &mut cands,
                b1.as_ref(),
                a1.as_ref(),
                filter,
                merge_idx,
                max_nb_cand,
            );
            if let (true, Some(c)) = (found, cands.last()) {
                return *c;
            }
        }

        let mut nb_cand = cands.len();
        if nb_cand > 1 && nb_cand < max_nb_cand {
            if nb_cand == merge_idx {
                return pairwise_cand(&cands[0], &cands[1]);
            }
            nb_cand += 1;
        }

        self.zero_cand(merge_idx, nb_cand)
    }

    /// Writes the motion of a block to the neighbour and temporal buffers and derives the
    /// deblocking edges along its top and left sides.
    pub(super) fn store_motion(&mut self, info: &MergeInfo, pb: &PbPos) {
        let (x, y, w, h) = (pb.x, pb.y, pb.w, pb.h);

        for list in 0..2 {
            if info.inter_dir.contains(InterDir::list(list)) {
                self.fields[list].fill(*info.mv(list), x, y, w, h);
                self.tmvp_bufs[list].fill(*info.mv(list), x, y, w, h);
            }
        }

        let dist = &self.tmvp.dist_ref;
        if info.inter_dir == InterDir::BI {
            self.dbf
                .check_bi(&self.fields, dist, &info.mv0, &info.mv1, x, y, w, h);
        } else if info.inter_dir == InterDir::L0 {
            self.dbf
                .check_uni(&self.fields, dist, 0, &info.mv0, x, y, w, h);
        } else if info.inter_dir == InterDir::L1 {
            self.dbf
                .check_uni(&self.fields, dist, 1, &info.mv1, x, y, w, h);
        }
    }

    /// Stores the motion of one 4x4 unit without deblocking derivation.
    pub(super) fn store_unit(&mut self, info: &MergeInfo, x: i32, y: i32) {
        for list in 0..2 {
            if info.inter_dir.contains(InterDir::list(list)) {
                self.fields[list].fill(*info.mv(list), x, y, 1, 1);
                self.tmvp_bufs[list].fill(*info.mv(list), x, y, 1, 1);
            }
        }
    }

    /// Regular merge. Small blocks fall back to list 0 prediction.
    pub fn merge(&mut self, pb: &PbPos, merge_idx: usize, max_nb_cand: usize) -> MergeInfo {
        let mut info = self.merge_cand(pb, merge_idx, max_nb_cand);
        if pb.is_small() && info.inter_dir == InterDir::BI {
            info.inter_dir = InterDir::L0;
        }

        self.store_motion(&info, pb);
        self.hmvp.update(info);
        info
    }

    /// Merge of a CIIP block: the block is deblocked as intra and predicted with equal weights.
    pub fn ciip_merge(&mut self, pb: &PbPos, merge_idx: usize, max_nb_cand: usize) -> MergeInfo {
        let mut info = self.merge(pb, merge_idx, max_nb_cand);
        self.dbf.mark_bs2(pb.x, pb.y, pb.w, pb.h);
        info.mv0.bcw_idx_plus1 = 0;
        info.mv1.bcw_idx_plus1 = 0;
        info
    }

    /// Explicit motion: predictor plus coded difference, for each list of `params.inter_dir`.
    pub fn amvp(&mut self, pb: &PbPos, params: &AmvpParams) -> MergeInfo {
        let mut info = MergeInfo {
            inter_dir: params.inter_dir,
            ..Default::default()
        };

        for list in 0..2 {
            if !params.inter_dir.contains(InterDir::list(list)) {
                continue;
            }
            let ref_idx = params.ref_idx[list];
            let mvp = self.amvp_cand(list, ref_idx, pb, params.mvp_idx[list], params.prec);
            let mvd = params.mvd[list].change_precision(params.prec, MvPrecision::INTERNAL);

            let mv = info.mv_mut(list);
            *mv = mvp.add(mvd);
            mv.ref_idx = ref_idx;
            mv.bcw_idx_plus1 = params.bcw_idx + 1;
            mv.prec = params.prec;
        }

        self.store_motion(&info, pb);
        self.hmvp.update(info);
        info
    }

    /// Symmetric MVD: bi-prediction from the slice's symmetric reference pair, list 1 using the
    /// mirrored difference. `None` when the slice has no such pair.
    pub fn smvd(
        &mut self,
        pb: &PbPos,
        mvd: Mv,
        mvp_idx: [u8; 2],
        prec: MvPrecision,
        bcw_idx: u8,
    ) -> Option<MergeInfo> {
        let (ref0, ref1) = self.smvd_refs?;
        let params = AmvpParams {
            inter_dir: InterDir::BI,
            ref_idx: [ref0, ref1],
            mvp_idx,
            mvd: [mvd, Mv::new(-mvd.x, -mvd.y)],
            prec,
            bcw_idx,
        };
        Some(self.amvp(pb, &params))
    }

    /// Overrides the temporal motion of a sub-block after decoder side refinement.
    pub fn refine_temporal(&mut self, info: &MergeInfo, pb: &PbPos) {
        for list in 0..2 {
            if info.inter_dir.contains(InterDir::list(list)) {
                self.tmvp_bufs[list].fill(*info.mv(list), pb.x, pb.y, pb.w, pb.h);
            }
        }
    }
}
