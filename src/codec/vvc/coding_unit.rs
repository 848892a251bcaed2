// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coding unit syntax and prediction dispatch.
//!
//! The `read_*` functions decode one syntax element each from an [`EntropyDecoder`]. The
//! [`SliceDecoder`] methods below combine them into a coding unit, derive its motion or intra
//! mode and hand the block to a [`Reconstructor`].

use anyhow::anyhow;

use crate::codec::vvc::affine::AffineAmvpParams;
use crate::codec::vvc::affine::AffineInfo;
use crate::codec::vvc::affine::AffineType;
use crate::codec::vvc::coding_tree::TreeNode;
use crate::codec::vvc::entropy::ContextId;
use crate::codec::vvc::entropy::EntropyDecoder;
use crate::codec::vvc::entropy::SyntaxElement;
use crate::codec::vvc::gpm::GpmInfo;
use crate::codec::vvc::mmvd::MmvdIdx;
use crate::codec::vvc::mv::InterDir;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::mv::MvPrecision;
use crate::codec::vvc::mvp::AmvpParams;
use crate::codec::vvc::mvp::PbPos;
use crate::codec::vvc::mvp::BCW_DEFAULT;
use crate::codec::vvc::recon::BlockRect;
use crate::codec::vvc::recon::ChromaMode;
use crate::codec::vvc::recon::IntraInfo;
use crate::codec::vvc::recon::IspSplit;
use crate::codec::vvc::recon::MipMode;
use crate::codec::vvc::recon::Reconstructor;
use crate::codec::vvc::slice::SliceDecoder;
use crate::codec::vvc::LOG2_MIN_CU_S;
use crate::Resolution;

pub const PLANAR_IDX: u8 = 0;
pub const DC_IDX: u8 = 1;
pub const HOR_IDX: u8 = 18;
pub const VER_IDX: u8 = 50;

/// Number of most probable modes besides planar.
pub const NUM_MPM: usize = 5;

/// Weight index of each `bcw_idx` codeword.
const BCW_PARSING_ORDER: [u8; 5] = [2, 3, 1, 4, 0];

/// Reference line of each `intra_luma_ref_idx`.
const INTRA_LUMA_REF_LINE: [u8; 3] = [0, 1, 3];

/// Side of the sub-blocks DMVR and BDOF work on.
const LOG2_REFINE_SIZE: u8 = 4;

fn bin<E: EntropyDecoder + ?Sized>(ed: &mut E, elem: SyntaxElement, inc: u8) -> bool {
    ed.read_bin(ContextId::new(elem, inc))
}

/// Truncated unary value of at most `max` whose first bin uses a context and the others bypass.
fn read_first_ctx_tr<E: EntropyDecoder + ?Sized>(ed: &mut E, elem: SyntaxElement, max: u32) -> u32 {
    if max == 0 || !bin(ed, elem, 0) {
        return 0;
    }
    1 + ed.read_truncated(max - 1)
}

pub fn read_cu_skip_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, inc: u8) -> bool {
    bin(ed, SyntaxElement::CuSkipFlag, inc)
}

/// `pred_mode_flag`, true for intra.
pub fn read_pred_mode_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, inc: u8) -> bool {
    bin(ed, SyntaxElement::PredModeFlag, inc)
}

pub fn read_general_merge_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::GeneralMergeFlag, 0)
}

pub fn read_merge_subblock_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, inc: u8) -> bool {
    bin(ed, SyntaxElement::MergeSubblockFlag, inc)
}

pub fn read_merge_subblock_idx<E: EntropyDecoder + ?Sized>(ed: &mut E, max_nb_cand: usize) -> usize {
    read_first_ctx_tr(ed, SyntaxElement::MergeSubblockIdx, max_nb_cand.saturating_sub(1) as u32) as usize
}

/// `regular_merge_flag`. The context depends on whether the block is skipped.
pub fn read_regular_merge_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, skip: bool) -> bool {
    bin(ed, SyntaxElement::RegularMergeFlag, u8::from(!skip))
}

pub fn read_mmvd_merge_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::MmvdMergeFlag, 0)
}

/// Base candidate, distance and direction of an MMVD block.
pub fn read_mmvd_idx<E: EntropyDecoder + ?Sized>(ed: &mut E, max_nb_cand: usize) -> MmvdIdx {
    let base = max_nb_cand > 1 && bin(ed, SyntaxElement::MmvdCandFlag, 0);
    let distance = read_first_ctx_tr(ed, SyntaxElement::MmvdDistanceIdx, 7);
    let direction = ed.read_bypass_bits(2);
    MmvdIdx {
        base: u8::from(base),
        distance: distance as u8,
        direction: direction as u8,
    }
}

pub fn read_ciip_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::CiipFlag, 0)
}

pub fn read_merge_idx<E: EntropyDecoder + ?Sized>(ed: &mut E, max_nb_cand: usize) -> usize {
    read_first_ctx_tr(ed, SyntaxElement::MergeIdx, max_nb_cand.saturating_sub(1) as u32) as usize
}

/// Partition index and the two distinct candidate indices of a GPM block.
pub fn read_gpm_syntax<E: EntropyDecoder + ?Sized>(ed: &mut E, max_nb_gpm_cand: usize) -> (u8, [usize; 2]) {
    let split_dir = ed.read_bypass_bits(6) as u8;
    let idx0 = read_first_ctx_tr(ed, SyntaxElement::MergeIdx, max_nb_gpm_cand.saturating_sub(1) as u32) as usize;
    let mut idx1 = if max_nb_gpm_cand > 2 {
        read_first_ctx_tr(ed, SyntaxElement::MergeIdx, (max_nb_gpm_cand - 2) as u32) as usize
    } else {
        0
    };
    if idx1 >= idx0 {
        idx1 += 1;
    }
    (split_dir, [idx0, idx1])
}

/// `inter_pred_idc`. Blocks of 12 samples of width plus height only use one list.
pub fn read_inter_pred_idc<E: EntropyDecoder + ?Sized>(ed: &mut E, log2_w: u8, log2_h: u8) -> InterDir {
    if (1u32 << log2_w) + (1u32 << log2_h) > 12 {
        let inc = 7 - ((log2_w + log2_h + 1) >> 1);
        if bin(ed, SyntaxElement::InterPredIdc, inc) {
            return InterDir::BI;
        }
    }
    if bin(ed, SyntaxElement::InterPredIdc, 5) {
        InterDir::L1
    } else {
        InterDir::L0
    }
}

pub fn read_inter_affine_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, inc: u8) -> bool {
    bin(ed, SyntaxElement::InterAffineFlag, inc)
}

pub fn read_cu_affine_type_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::CuAffineTypeFlag, 0)
}

pub fn read_sym_mvd_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::SymMvdFlag, 0)
}

/// Reference index among `nb_active` references: two context coded bins, then bypass.
pub fn read_ref_idx<E: EntropyDecoder + ?Sized>(ed: &mut E, nb_active: usize) -> u8 {
    let max = nb_active.saturating_sub(1) as u8;
    let mut val = 0;
    while val < max {
        let more = if val < 2 {
            bin(ed, SyntaxElement::RefIdx, val)
        } else {
            ed.read_bypass()
        };
        if !more {
            break;
        }
        val += 1;
    }
    val
}

pub fn read_mvp_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> u8 {
    u8::from(bin(ed, SyntaxElement::MvpFlag, 0))
}

/// `mvd_coding`: both greater-than-0 flags first, then the greater-than-1 flags, then the
/// remainders and signs.
pub fn read_mvd<E: EntropyDecoder + ?Sized>(ed: &mut E) -> Mv {
    let gt0 = [
        bin(ed, SyntaxElement::AbsMvdGreater0Flag, 0),
        bin(ed, SyntaxElement::AbsMvdGreater0Flag, 0),
    ];
    let gt1 = [
        gt0[0] && bin(ed, SyntaxElement::AbsMvdGreater1Flag, 0),
        gt0[1] && bin(ed, SyntaxElement::AbsMvdGreater1Flag, 0),
    ];

    let mut comps = [0i32; 2];
    for (c, comp) in comps.iter_mut().enumerate() {
        if !gt0[c] {
            continue;
        }
        let abs = if gt1[c] {
            2 + ed.read_exp_golomb(1) as i32
        } else {
            1
        };
        *comp = if ed.read_bypass() { -abs } else { abs };
    }
    Mv::new(comps[0], comps[1])
}

/// MVD resolution of a translational block.
pub fn read_amvr<E: EntropyDecoder + ?Sized>(ed: &mut E) -> MvPrecision {
    if !bin(ed, SyntaxElement::AmvrFlag, 0) {
        return MvPrecision::Quarter;
    }
    if !bin(ed, SyntaxElement::AmvrPrecisionIdx, 0) {
        return MvPrecision::Half;
    }
    if bin(ed, SyntaxElement::AmvrPrecisionIdx, 1) {
        MvPrecision::FourPel
    } else {
        MvPrecision::Int
    }
}

/// MVD resolution of an affine block.
pub fn read_affine_amvr<E: EntropyDecoder + ?Sized>(ed: &mut E) -> MvPrecision {
    if !bin(ed, SyntaxElement::AmvrFlag, 1) {
        return MvPrecision::Quarter;
    }
    if bin(ed, SyntaxElement::AmvrPrecisionIdx, 2) {
        MvPrecision::Int
    } else {
        MvPrecision::Sixteenth
    }
}

/// Bi-prediction weight index. Low delay slices have five weights, others three.
pub fn read_bcw_idx<E: EntropyDecoder + ?Sized>(ed: &mut E, ldc: bool) -> u8 {
    let max = if ldc { 4 } else { 2 };
    let codeword = read_first_ctx_tr(ed, SyntaxElement::BcwIdx, max);
    BCW_PARSING_ORDER[codeword as usize]
}

pub fn read_cu_coded_flag<E: EntropyDecoder + ?Sized>(ed: &mut E) -> bool {
    bin(ed, SyntaxElement::CuCodedFlag, 0)
}

/// `cu_qp_delta_abs` with its sign.
pub fn read_cu_qp_delta<E: EntropyDecoder + ?Sized>(ed: &mut E) -> i32 {
    let mut prefix = 0;
    while prefix < 5 && bin(ed, SyntaxElement::CuQpDeltaAbs, u8::from(prefix > 0)) {
        prefix += 1;
    }
    let abs = if prefix > 4 {
        prefix + ed.read_exp_golomb(0) as i32
    } else {
        prefix
    };
    if abs > 0 && ed.read_bypass() {
        -abs
    } else {
        abs
    }
}

pub fn read_intra_mip_flag<E: EntropyDecoder + ?Sized>(ed: &mut E, inc: u8) -> bool {
    bin(ed, SyntaxElement::IntraMipFlag, inc)
}

/// Number of MIP modes of a block, minus one.
pub fn mip_max_mode(log2_w: u8, log2_h: u8) -> u32 {
    match (log2_w, log2_h) {
        (2, 2) => 15,
        (2, _) | (_, 2) | (3, 3) => 7,
        _ => 5,
    }
}

pub fn read_intra_luma_ref_line<E: EntropyDecoder + ?Sized>(ed: &mut E) -> u8 {
    let idx = if !bin(ed, SyntaxElement::IntraLumaRefIdx, 0) {
        0
    } else if !bin(ed, SyntaxElement::IntraLumaRefIdx, 1) {
        1
    } else {
        2
    };
    INTRA_LUMA_REF_LINE[idx]
}

pub fn read_isp<E: EntropyDecoder + ?Sized>(ed: &mut E) -> IspSplit {
    if !bin(ed, SyntaxElement::IntraSubpartitionsModeFlag, 0) {
        IspSplit::None
    } else if bin(ed, SyntaxElement::IntraSubpartitionsSplitFlag, 0) {
        IspSplit::Vertical
    } else {
        IspSplit::Horizontal
    }
}

/// Most probable luma modes from the left and above modes, planar excluded.
pub fn derive_mpm(cand_a: u8, cand_b: u8) -> [u8; NUM_MPM] {
    let wrap = |v: i32| (2 + v.rem_euclid(64)) as u8;

    if cand_a == cand_b && cand_a > DC_IDX {
        let a = i32::from(cand_a);
        return [cand_a, wrap(a + 61), wrap(a - 1), wrap(a + 60), wrap(a)];
    }

    if cand_a != cand_b && (cand_a > DC_IDX || cand_b > DC_IDX) {
        let (min, max) = (i32::from(cand_a.min(cand_b)), i32::from(cand_a.max(cand_b)));
        if cand_a > DC_IDX && cand_b > DC_IDX {
            let rest = match max - min {
                1 => [wrap(min + 61), wrap(max - 1), wrap(min + 60)],
                d if d >= 62 => [wrap(min - 1), wrap(max + 61), wrap(min)],
                2 => [wrap(min - 1), wrap(min + 61), wrap(max - 1)],
                _ => [wrap(min + 61), wrap(min - 1), wrap(max + 61)],
            };
            return [cand_a, cand_b, rest[0], rest[1], rest[2]];
        }
        return [max as u8, wrap(max + 61), wrap(max - 1), wrap(max + 60), wrap(max)];
    }

    [DC_IDX, VER_IDX, HOR_IDX, VER_IDX - 4, VER_IDX + 4]
}

/// Luma intra mode: planar, a most probable mode or a remainder.
pub fn read_luma_mode<E: EntropyDecoder + ?Sized>(
    ed: &mut E,
    mpm: &[u8; NUM_MPM],
    ref_line: u8,
    isp: IspSplit,
) -> u8 {
    let in_mpm = ref_line != 0 || bin(ed, SyntaxElement::IntraLumaMpmFlag, 0);
    if in_mpm {
        let not_planar = ref_line != 0
            || bin(ed, SyntaxElement::IntraLumaNotPlanarFlag, u8::from(isp == IspSplit::None));
        if !not_planar {
            return PLANAR_IDX;
        }
        return mpm[ed.read_truncated(NUM_MPM as u32 - 1) as usize];
    }

    let mut sorted = *mpm;
    sorted.sort_unstable();
    let mut mode = ed.read_truncated_binary(60) as u8 + 1;
    for m in sorted {
        if mode >= m {
            mode += 1;
        }
    }
    mode
}

pub fn read_chroma_mode<E: EntropyDecoder + ?Sized>(ed: &mut E, cclm: bool) -> ChromaMode {
    if cclm && bin(ed, SyntaxElement::CclmModeFlag, 0) {
        let idx = if bin(ed, SyntaxElement::CclmModeIdx, 0) {
            1 + u8::from(ed.read_bypass())
        } else {
            0
        };
        return ChromaMode::Cclm(idx);
    }
    if !bin(ed, SyntaxElement::IntraChromaPredMode, 0) {
        return ChromaMode::Derived;
    }
    ChromaMode::Explicit(ed.read_bypass_bits(2) as u8)
}

/// What the neighbours of later blocks need to know about a coding unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CuRecord {
    pub skip: bool,
    pub intra: bool,
    /// Affine merge or affine AMVP.
    pub affine: bool,
    pub mip: bool,
    pub luma_mode: u8,
    pub qt_depth: u8,
    pub log2_w: u8,
    pub log2_h: u8,
    pub qp: i8,
}

/// Coding unit records of a picture, per 4x4 unit. Units not yet decoded in the current slice
/// are unavailable.
#[derive(Clone, Debug, Default)]
pub struct CuMaps {
    width: usize,
    height: usize,
    cus: Vec<Option<CuRecord>>,
}

impl CuMaps {
    pub fn new(resolution: Resolution) -> Self {
        let (w, h) = resolution.blocks(LOG2_MIN_CU_S);
        Self {
            width: w as usize,
            height: h as usize,
            cus: vec![None; (w * h) as usize],
        }
    }

    pub fn reset(&mut self) {
        self.cus.fill(None);
    }

    /// Record covering luma sample `(x, y)`.
    pub fn get(&self, x: i64, y: i64) -> Option<&CuRecord> {
        if x < 0 || y < 0 {
            return None;
        }
        let (ux, uy) = ((x >> LOG2_MIN_CU_S) as usize, (y >> LOG2_MIN_CU_S) as usize);
        if ux >= self.width || uy >= self.height {
            return None;
        }
        self.cus[uy * self.width + ux].as_ref()
    }

    pub fn fill(&mut self, blk: &BlockRect, cu: CuRecord) {
        let x0 = (blk.x0 >> LOG2_MIN_CU_S) as usize;
        let y0 = (blk.y0 >> LOG2_MIN_CU_S) as usize;
        let x1 = ((blk.x0 + blk.width()) >> LOG2_MIN_CU_S) as usize;
        let y1 = ((blk.y0 + blk.height()) >> LOG2_MIN_CU_S) as usize;
        for y in y0..y1.min(self.height) {
            let row = y * self.width;
            self.cus[row + x0.min(self.width)..row + x1.min(self.width)].fill(Some(cu));
        }
    }
}

/// Luma QP state of the current quantization group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpState {
    /// QP of the last coding unit decoded.
    pub last: i8,
    /// Predicted QP of the current group.
    pub pred: i8,
    /// QP of coding units in the current group.
    pub cu_qp: i8,
    pub delta_coded: bool,
}

impl QpState {
    pub fn start_slice(&mut self, slice_qp: i32) {
        let qp = slice_qp.clamp(-64, 63) as i8;
        *self = Self {
            last: qp,
            pred: qp,
            cu_qp: qp,
            delta_coded: false,
        };
    }

    pub fn start_group(&mut self, pred: i8) {
        self.pred = pred;
        self.cu_qp = pred;
        self.delta_coded = false;
    }

    /// Applies `cu_qp_delta`, wrapping into the range allowed by `bit_depth`.
    pub fn apply_delta(&mut self, delta: i32, bit_depth: u8) {
        let offset = 6 * i32::from(bit_depth.saturating_sub(8));
        let qp = (i32::from(self.pred) + delta + 64 + 2 * offset).rem_euclid(64 + offset) - offset;
        self.cu_qp = qp as i8;
        self.delta_coded = true;
    }
}

/// Prediction chosen for an inter coding unit.
#[derive(Clone, Copy, Debug)]
enum InterPred {
    Regular {
        motion: MergeInfo,
        /// Regular merge, the only mode DMVR refines.
        dmvr: bool,
        /// Modes excluded from BDOF.
        no_bdof: bool,
    },
    Ciip(MergeInfo),
    Gpm(GpmInfo),
    Affine(AffineInfo),
}

impl SliceDecoder {
    fn neighbours(&self, blk: &BlockRect) -> (Option<CuRecord>, Option<CuRecord>) {
        let (x0, y0) = (i64::from(blk.x0), i64::from(blk.y0));
        (self.maps.get(x0 - 1, y0).copied(), self.maps.get(x0, y0 - 1).copied())
    }

    /// Predicted QP of the quantization group starting at `(x, y)`: the average of the left
    /// and above groups inside the same CTU, each falling back to the last QP decoded.
    pub(super) fn start_quantization_group(&mut self, x: u32, y: u32) {
        let log2_ctb = self.sps.geometry.log2_ctb_size;
        let same_ctb = |nx: i64, ny: i64| {
            nx >= 0 && ny >= 0 && (nx >> log2_ctb) == i64::from(x >> log2_ctb) && (ny >> log2_ctb) == i64::from(y >> log2_ctb)
        };
        let last = self.qp.last;
        let qp_at = |nx: i64, ny: i64| {
            if !same_ctb(nx, ny) {
                return last;
            }
            self.maps.get(nx, ny).map_or(last, |cu| cu.qp)
        };

        let (x, y) = (i64::from(x), i64::from(y));
        let qp_a = i32::from(qp_at(x - 1, y));
        let qp_b = i32::from(qp_at(x, y - 1));
        self.qp.start_group(((qp_a + qp_b + 1) >> 1) as i8);
    }

    /// Decodes the coding unit of leaf `node`.
    pub(super) fn coding_unit<E, R>(&mut self, ed: &mut E, recon: &mut R, node: &TreeNode) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let blk = node.rect();
        let (left, above) = self.neighbours(&blk);
        let mut cu = CuRecord {
            qt_depth: node.qt_depth,
            log2_w: node.log2_w,
            log2_h: node.log2_h,
            ..Default::default()
        };

        let inter_allowed = !self.slice.slice_type.is_intra() && !(blk.log2_w == 2 && blk.log2_h == 2);
        if inter_allowed {
            let inc = u8::from(left.map_or(false, |c| c.skip)) + u8::from(above.map_or(false, |c| c.skip));
            cu.skip = read_cu_skip_flag(ed, inc);
        }
        cu.intra = if !inter_allowed {
            true
        } else if cu.skip {
            false
        } else {
            let inc = left.map_or(false, |c| c.intra) || above.map_or(false, |c| c.intra);
            read_pred_mode_flag(ed, u8::from(inc))
        };

        log::trace!(
            "CU ({}, {}) {}x{} {}",
            blk.x0,
            blk.y0,
            blk.width(),
            blk.height(),
            if cu.intra { "intra" } else if cu.skip { "skip" } else { "inter" }
        );

        if cu.intra {
            self.intra_cu(ed, recon, &blk, &mut cu, left, above)?;
        } else {
            self.inter_cu(ed, recon, &blk, &mut cu, left, above)?;
        }

        cu.qp = self.qp.cu_qp;
        self.qp.last = cu.qp;
        let pb = blk.pb(self.sps.geometry.log2_ctb_size);
        self.inter.dbf_mut().fill_qp(cu.qp, pb.x, pb.y, pb.w, pb.h);
        self.maps.fill(&blk, cu);
        Ok(())
    }

    fn intra_cu<E, R>(
        &mut self,
        ed: &mut E,
        recon: &mut R,
        blk: &BlockRect,
        cu: &mut CuRecord,
        left: Option<CuRecord>,
        above: Option<CuRecord>,
    ) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let tools = self.sps.tools;
        let geometry = self.sps.geometry;
        let mut intra = IntraInfo::default();

        if tools.mip && blk.log2_w <= 6 && blk.log2_h <= 6 {
            let inc = if blk.log2_w.abs_diff(blk.log2_h) > 1 {
                3
            } else {
                u8::from(left.map_or(false, |c| c.mip)) + u8::from(above.map_or(false, |c| c.mip))
            };
            if read_intra_mip_flag(ed, inc) {
                let transposed = ed.read_bypass();
                let mode = ed.read_truncated_binary(mip_max_mode(blk.log2_w, blk.log2_h)) as u8;
                intra.mip = Some(MipMode { mode, transposed });
                cu.mip = true;
            }
        }

        if intra.mip.is_none() {
            if tools.mrl && blk.y0 % geometry.ctb_size() != 0 {
                intra.ref_line = read_intra_luma_ref_line(ed);
            }
            if tools.isp
                && intra.ref_line == 0
                && blk.log2_w <= geometry.log2_max_tb_size
                && blk.log2_h <= geometry.log2_max_tb_size
                && blk.log2_w + blk.log2_h > 4
            {
                intra.isp = read_isp(ed);
            }

            // Left neighbour at the bottom-left, above at the top-right, above restricted to
            // the current CTU row.
            let mode_of = |c: Option<&CuRecord>| match c {
                Some(c) if c.intra && !c.mip => c.luma_mode,
                _ => PLANAR_IDX,
            };
            let (x0, y0) = (i64::from(blk.x0), i64::from(blk.y0));
            let cand_a = mode_of(self.maps.get(x0 - 1, y0 + i64::from(blk.height()) - 1));
            let cand_b = if blk.y0 % geometry.ctb_size() == 0 {
                PLANAR_IDX
            } else {
                mode_of(self.maps.get(x0 + i64::from(blk.width()) - 1, y0 - 1))
            };
            let mpm = derive_mpm(cand_a, cand_b);
            intra.luma_mode = read_luma_mode(ed, &mpm, intra.ref_line, intra.isp);
            cu.luma_mode = intra.luma_mode;
        }

        intra.chroma = read_chroma_mode(ed, tools.cclm);
        recon.intra_predict(blk, &intra);

        let pb = blk.pb(geometry.log2_ctb_size);
        self.inter.dbf_mut().mark_bs2(pb.x, pb.y, pb.w, pb.h);
        self.transform_tree(ed, recon, blk, true)
    }

    fn inter_cu<E, R>(
        &mut self,
        ed: &mut E,
        recon: &mut R,
        blk: &BlockRect,
        cu: &mut CuRecord,
        left: Option<CuRecord>,
        above: Option<CuRecord>,
    ) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let pb = blk.pb(self.sps.geometry.log2_ctb_size);
        let affine_inc = u8::from(left.map_or(false, |c| c.affine)) + u8::from(above.map_or(false, |c| c.affine));

        let merge = cu.skip || read_general_merge_flag(ed);
        let pred = if merge {
            self.merge_data(ed, blk, &pb, cu, affine_inc)
        } else {
            self.explicit_motion(ed, blk, &pb, cu, affine_inc)?
        };

        self.predict_inter(recon, blk, &pb, &pred);

        let coded = if cu.skip {
            false
        } else if merge {
            true
        } else {
            read_cu_coded_flag(ed)
        };
        if coded {
            self.transform_tree(ed, recon, blk, false)?;
        }
        Ok(())
    }

    fn merge_data<E: EntropyDecoder + ?Sized>(
        &mut self,
        ed: &mut E,
        blk: &BlockRect,
        pb: &PbPos,
        cu: &mut CuRecord,
        affine_inc: u8,
    ) -> InterPred {
        let tools = self.sps.tools;
        let (w, h) = (blk.width(), blk.height());
        let max_merge = usize::from(self.slice.max_num_merge_cand);
        let max_subblock = usize::from(self.slice.max_num_subblock_merge_cand);

        if max_subblock > 0 && w >= 8 && h >= 8 && read_merge_subblock_flag(ed, affine_inc) {
            let idx = read_merge_subblock_idx(ed, max_subblock);
            cu.affine = true;
            return InterPred::Affine(self.inter.affine_merge(pb, idx, max_subblock));
        }

        let ciip_allowed = tools.ciip && !cu.skip && w < 128 && h < 128 && w * h >= 64;
        let gpm_allowed = tools.gpm
            && self.slice.slice_type.is_b()
            && self.slice.max_num_gpm_cand >= 2
            && w >= 8
            && h >= 8
            && w < 128
            && h < 128
            && w < 8 * h
            && h < 8 * w;

        let regular = !(ciip_allowed || gpm_allowed) || read_regular_merge_flag(ed, cu.skip);
        if regular {
            if tools.mmvd && read_mmvd_merge_flag(ed) {
                let idx = read_mmvd_idx(ed, max_merge);
                return InterPred::Regular {
                    motion: self.inter.mmvd_merge(pb, idx, max_merge),
                    dmvr: false,
                    no_bdof: false,
                };
            }
            let idx = read_merge_idx(ed, max_merge);
            return InterPred::Regular {
                motion: self.inter.merge(pb, idx, max_merge),
                dmvr: true,
                no_bdof: false,
            };
        }

        let ciip = if ciip_allowed && gpm_allowed {
            read_ciip_flag(ed)
        } else {
            ciip_allowed
        };
        if ciip {
            let idx = read_merge_idx(ed, max_merge);
            return InterPred::Ciip(self.inter.ciip_merge(pb, idx, max_merge));
        }

        let (split_dir, idx) = read_gpm_syntax(ed, usize::from(self.slice.max_num_gpm_cand));
        InterPred::Gpm(self.inter.gpm_merge(pb, split_dir, idx, max_merge))
    }

    fn explicit_motion<E: EntropyDecoder + ?Sized>(
        &mut self,
        ed: &mut E,
        blk: &BlockRect,
        pb: &PbPos,
        cu: &mut CuRecord,
        affine_inc: u8,
    ) -> anyhow::Result<InterPred> {
        let tools = self.sps.tools;
        let (w, h) = (blk.width(), blk.height());

        let inter_dir = if self.slice.slice_type.is_b() {
            read_inter_pred_idc(ed, blk.log2_w, blk.log2_h)
        } else {
            InterDir::L0
        };
        let affine = tools.affine && w >= 16 && h >= 16 && read_inter_affine_flag(ed, affine_inc);
        let affine_type = if affine && tools.six_param_affine && read_cu_affine_type_flag(ed) {
            AffineType::SixParam
        } else {
            AffineType::FourParam
        };
        let smvd = inter_dir == InterDir::BI
            && !affine
            && self.inter.smvd_refs().is_some()
            && read_sym_mvd_flag(ed);

        let nb_mvds = if affine { affine_type.nb_cps() } else { 1 };
        let mut ref_idx = [0u8; 2];
        let mut mvp_idx = [0u8; 2];
        let mut mvd = [[Mv::default(); 3]; 2];
        for list in 0..2 {
            if !inter_dir.contains(InterDir::list(list)) {
                continue;
            }
            if !smvd {
                ref_idx[list] = read_ref_idx(ed, self.slice.num_active(list));
            }
            let zero_mvd = list == 1 && ((self.slice.mvd_l1_zero && inter_dir == InterDir::BI) || smvd);
            if !zero_mvd {
                for cp in mvd[list].iter_mut().take(nb_mvds) {
                    *cp = read_mvd(ed);
                }
            }
            mvp_idx[list] = read_mvp_flag(ed);
        }

        let has_mvd = mvd.iter().flatten().any(|m| m.x != 0 || m.y != 0);
        let prec = match (affine, has_mvd) {
            (true, true) if tools.affine_amvr => read_affine_amvr(ed),
            (false, true) if tools.amvr => read_amvr(ed),
            _ => MvPrecision::Quarter,
        };

        let bcw_idx = if inter_dir == InterDir::BI && tools.bcw && w * h >= 256 {
            read_bcw_idx(ed, self.inter.ldc())
        } else {
            BCW_DEFAULT
        };

        if affine {
            cu.affine = true;
            let params = AffineAmvpParams {
                type_: affine_type,
                inter_dir,
                ref_idx,
                mvp_idx,
                mvd,
                prec,
                bcw_idx,
            };
            return Ok(InterPred::Affine(self.inter.affine_amvp(pb, &params)));
        }

        if smvd {
            let motion = self
                .inter
                .smvd(pb, mvd[0][0], mvp_idx, prec, bcw_idx)
                .ok_or_else(|| anyhow!("symmetric MVD without a symmetric reference pair"))?;
            return Ok(InterPred::Regular {
                motion,
                dmvr: false,
                no_bdof: true,
            });
        }

        let params = AmvpParams {
            inter_dir,
            ref_idx,
            mvp_idx,
            mvd: [mvd[0][0], mvd[1][0]],
            prec,
            bcw_idx,
        };
        Ok(InterPred::Regular {
            motion: self.inter.amvp(pb, &params),
            dmvr: false,
            no_bdof: false,
        })
    }

    /// Blocks large enough for the sub-block refinements.
    fn refinable_size(blk: &BlockRect) -> bool {
        blk.log2_w >= 3 && blk.log2_h >= 3 && blk.log2_w + blk.log2_h >= 7
    }

    fn default_weight(motion: &MergeInfo) -> bool {
        let plus1 = motion.mv0.bcw_idx_plus1;
        plus1 == 0 || plus1 == BCW_DEFAULT + 1
    }

    fn dmvr_applies(&self, blk: &BlockRect, motion: &MergeInfo) -> bool {
        self.sps.tools.dmvr
            && !self.slice.dmvr_disabled
            && Self::refinable_size(blk)
            && Self::default_weight(motion)
            && self.inter.is_refinable_bi(motion)
    }

    fn bdof_applies(&self, blk: &BlockRect, motion: &MergeInfo) -> bool {
        self.sps.tools.bdof
            && !self.slice.bdof_disabled
            && Self::refinable_size(blk)
            && Self::default_weight(motion)
            && self.inter.is_refinable_bi(motion)
    }

    fn predict_inter<R: Reconstructor + ?Sized>(&mut self, recon: &mut R, blk: &BlockRect, pb: &PbPos, pred: &InterPred) {
        let log2_ctb = self.sps.geometry.log2_ctb_size;

        match *pred {
            InterPred::Regular { motion, dmvr, no_bdof } => {
                let refs = self.inter.ref_ids(&motion);
                let dmvr = dmvr && self.dmvr_applies(blk, &motion);
                let bdof = !no_bdof && self.bdof_applies(blk, &motion);
                self.inter.wait_for_refs(blk, &motion);
                if !dmvr && !bdof {
                    recon.motion_compensate(blk, &motion, refs);
                    return;
                }
                for sub in blk.tiles(LOG2_REFINE_SIZE) {
                    let refined = if dmvr {
                        let refined = recon.dmvr_refine(&sub, &motion);
                        self.inter.refine_temporal(&refined, &sub.pb(log2_ctb));
                        refined
                    } else {
                        motion
                    };
                    recon.motion_compensate(&sub, &refined, refs);
                    if bdof {
                        recon.bdof_refine(&sub, &refined);
                    }
                }
            }
            InterPred::Ciip(motion) => {
                let refs = self.inter.ref_ids(&motion);
                self.inter.wait_for_refs(blk, &motion);
                recon.ciip_blend(blk, &motion, refs);
            }
            InterPred::Gpm(gpm) => {
                let side = |c: &MergeInfo| self.inter.ref_ids(c).into_iter().flatten().next();
                let refs = [side(&gpm.cands[0]), side(&gpm.cands[1])];
                for cand in gpm.cands.iter() {
                    self.inter.wait_for_refs(blk, cand);
                }
                recon.gpm_blend(blk, &gpm, refs);
            }
            InterPred::Affine(affine) => {
                for sub in blk.tiles(LOG2_MIN_CU_S) {
                    let x = ((sub.x0 - blk.x0) >> LOG2_MIN_CU_S) as i32;
                    let y = ((sub.y0 - blk.y0) >> LOG2_MIN_CU_S) as i32;
                    let motion = affine.sub_block(pb, x, y);
                    let refs = self.inter.ref_ids(&motion);
                    self.inter.wait_for_refs(&sub, &motion);
                    recon.motion_compensate(&sub, &motion, refs);
                }
            }
        }
    }

    /// Transform blocks of a coded coding unit, split at the largest transform size.
    fn transform_tree<E, R>(&mut self, ed: &mut E, recon: &mut R, blk: &BlockRect, intra: bool) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let log2_ctb = self.sps.geometry.log2_ctb_size;
        let tiles = blk.tiles(self.sps.geometry.log2_max_tb_size);
        let single = tiles.len() == 1;

        for tu in tiles {
            let cb = bin(ed, SyntaxElement::TuCbCodedFlag, 0);
            let cr = bin(ed, SyntaxElement::TuCrCodedFlag, u8::from(cb));
            // A coded inter block with a single transform has luma coefficients unless chroma
            // has some.
            let y = if !intra && single && !cb && !cr {
                true
            } else {
                bin(ed, SyntaxElement::TuYCodedFlag, u8::from(!intra))
            };
            if !(y || cb || cr) {
                continue;
            }

            if self.sps.tools.cu_qp_delta && !self.qp.delta_coded {
                let delta = read_cu_qp_delta(ed);
                self.qp.apply_delta(delta, self.sps.bit_depth);
                log::trace!("cu_qp_delta {} -> qp {}", delta, self.qp.cu_qp);
            }

            recon.residual(&tu, self.qp.cu_qp);
            let pb = tu.pb(log2_ctb);
            self.inter.dbf_mut().bs1.mark_block(pb.x, pb.y, pb.w, pb.h);
        }
        Ok(())
    }
}
