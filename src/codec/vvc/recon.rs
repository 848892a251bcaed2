// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel reconstruction seam.
//!
//! Prediction and residual operations are performed outside of this crate. The parser calls a
//! [`Reconstructor`] once the motion or intra mode of a block is known.

use crate::codec::vvc::dbf::DbfInfo;
use crate::codec::vvc::gpm::GpmInfo;
use crate::codec::vvc::mv::MergeInfo;
use crate::codec::vvc::mvp::PbPos;
use crate::codec::vvc::picture::PicId;

/// Luma rectangle of a block, in picture coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockRect {
    pub x0: u32,
    pub y0: u32,
    pub log2_w: u8,
    pub log2_h: u8,
}

impl BlockRect {
    pub fn new(x0: u32, y0: u32, log2_w: u8, log2_h: u8) -> Self {
        Self {
            x0,
            y0,
            log2_w,
            log2_h,
        }
    }

    pub fn width(&self) -> u32 {
        1 << self.log2_w
    }

    pub fn height(&self) -> u32 {
        1 << self.log2_h
    }

    /// Tiles of at most `1 << log2_size` samples a side, in raster order.
    pub fn tiles(&self, log2_size: u8) -> Vec<BlockRect> {
        let log2_w = self.log2_w.min(log2_size);
        let log2_h = self.log2_h.min(log2_size);

        let mut tiles = vec![];
        for y in (0..self.height()).step_by(1 << log2_h) {
            for x in (0..self.width()).step_by(1 << log2_w) {
                tiles.push(BlockRect::new(self.x0 + x, self.y0 + y, log2_w, log2_h));
            }
        }
        tiles
    }

    /// Position inside its CTU of `1 << log2_ctb_size` samples.
    pub fn pb(&self, log2_ctb_size: u8) -> PbPos {
        let mask = (1 << log2_ctb_size) - 1;
        PbPos::new(self.x0 & mask, self.y0 & mask, self.log2_w, self.log2_h)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IspSplit {
    #[default]
    None,
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MipMode {
    pub mode: u8,
    pub transposed: bool,
}

/// Chroma intra prediction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaMode {
    /// Same mode as the collocated luma block.
    #[default]
    Derived,
    /// Planar, vertical, horizontal or DC, by index.
    Explicit(u8),
    /// Cross-component linear model, by index.
    Cclm(u8),
}

/// Intra prediction of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntraInfo {
    pub luma_mode: u8,
    /// Matrix based prediction, replacing the angular luma mode.
    pub mip: Option<MipMode>,
    /// Reference line, 0 for the adjacent one.
    pub ref_line: u8,
    pub isp: IspSplit,
    pub chroma: ChromaMode,
}

/// Pixel operations on the current picture.
///
/// `refs` hold the slots of the reference pictures, per list or per GPM side.
pub trait Reconstructor {
    fn motion_compensate(&mut self, blk: &BlockRect, motion: &MergeInfo, refs: [Option<PicId>; 2]);

    /// Combines the inter prediction of `blk` with a planar intra prediction.
    fn ciip_blend(&mut self, blk: &BlockRect, motion: &MergeInfo, refs: [Option<PicId>; 2]);

    /// Predicts both sides of a geometric partition and blends them along the line.
    fn gpm_blend(&mut self, blk: &BlockRect, gpm: &GpmInfo, refs: [Option<PicId>; 2]);

    /// Bi-directional optical flow on a 16x16 sub-block.
    fn bdof_refine(&mut self, blk: &BlockRect, motion: &MergeInfo);

    /// Decoder side vector refinement of a 16x16 sub-block. Returns the refined motion.
    fn dmvr_refine(&mut self, blk: &BlockRect, motion: &MergeInfo) -> MergeInfo;

    fn intra_predict(&mut self, blk: &BlockRect, intra: &IntraInfo);

    /// Adds the residual of a transform block dequantized with `qp`.
    fn residual(&mut self, blk: &BlockRect, qp: i8);

    /// Edges and QPs the deblocking filter needs for CTU `(ctb_x, ctb_y)`, once it is parsed.
    fn deblocking_info(&mut self, _ctb_x: u32, _ctb_y: u32, _dbf: &DbfInfo) {}
}

/// A call received by [`ReconLog`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconCall {
    MotionCompensate(BlockRect, MergeInfo),
    CiipBlend(BlockRect, MergeInfo),
    GpmBlend(BlockRect, GpmInfo),
    Bdof(BlockRect),
    Dmvr(BlockRect),
    IntraPredict(BlockRect, IntraInfo),
    Residual(BlockRect, i8),
}

/// Reconstructor that only records the calls it receives.
#[derive(Clone, Debug, Default)]
pub struct ReconLog {
    pub calls: Vec<ReconCall>,
}

impl Reconstructor for ReconLog {
    fn motion_compensate(&mut self, blk: &BlockRect, motion: &MergeInfo, _: [Option<PicId>; 2]) {
        self.calls.push(ReconCall::MotionCompensate(*blk, *motion));
    }

    fn ciip_blend(&mut self, blk: &BlockRect, motion: &MergeInfo, _: [Option<PicId>; 2]) {
        self.calls.push(ReconCall::CiipBlend(*blk, *motion));
    }

    fn gpm_blend(&mut self, blk: &BlockRect, gpm: &GpmInfo, _: [Option<PicId>; 2]) {
        self.calls.push(ReconCall::GpmBlend(*blk, *gpm));
    }

    fn bdof_refine(&mut self, blk: &BlockRect, _: &MergeInfo) {
        self.calls.push(ReconCall::Bdof(*blk));
    }

    fn dmvr_refine(&mut self, blk: &BlockRect, motion: &MergeInfo) -> MergeInfo {
        self.calls.push(ReconCall::Dmvr(*blk));
        *motion
    }

    fn intra_predict(&mut self, blk: &BlockRect, intra: &IntraInfo) {
        self.calls.push(ReconCall::IntraPredict(*blk, *intra));
    }

    fn residual(&mut self, blk: &BlockRect, qp: i8) {
        self.calls.push(ReconCall::Residual(*blk, qp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_cover_block() {
        let blk = BlockRect::new(64, 32, 5, 4);
        let tiles = blk.tiles(4);
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[1], BlockRect::new(80, 32, 4, 4));

        // Smaller than the tile: itself.
        let blk = BlockRect::new(8, 8, 3, 3);
        assert_eq!(blk.tiles(4), vec![blk]);
    }

    #[test]
    fn ctu_relative_position() {
        let pb = BlockRect::new(72, 40, 3, 4).pb(5);
        assert_eq!((pb.x, pb.y, pb.w, pb.h), (2, 2, 2, 4));
    }
}
