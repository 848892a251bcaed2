// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Temporal motion vector storage.
//!
//! Every inter picture keeps one [`MvPlane`] per list, holding the motion of each 8x8 unit and a
//! per-column availability bitmap at 4x4 granularity. Later pictures read it back through a
//! [`CollocatedCtu`] window loaded once per CTU.

use crate::codec::vvc::motion_field::unit_mask;
use crate::codec::vvc::motion_field::MvField;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::params::PictureGeometry;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::picture::RplInfo;
use crate::codec::vvc::LOG2_MIN_CU_S;
use crate::codec::vvc::MAX_NUM_REF;
use crate::video_frame::frame_pool::BufferPool;

const LOG2_TMVP_UNIT: u8 = 3;

/// Stride of the per-CTU buffers, in 8x8 units.
const CTU_TMVP_STRIDE: usize = 16;

/// Stride of the collocated window: one CTU plus the first column of its right neighbour.
const COL_TMVP_STRIDE: usize = CTU_TMVP_STRIDE + 1;

/// Motion of a whole picture for one list.
#[derive(Clone, Debug, Default)]
pub struct MvPlane {
    /// One word per 4x4 column of each CTU, in CTU raster order. Bit `y + 1` is set when the
    /// unit at row `y` of the CTU carries motion for this list.
    dirs: Vec<u64>,
    /// One vector per 8x8 unit, picture raster order.
    mvs: Vec<Mv>,
    nb_unit_ctb: usize,
    nb_tmvp_unit: usize,
    nb_ctb_w: usize,
}

pub type MvPlanePool = BufferPool<MvPlane, PictureGeometry>;

impl MvPlane {
    pub fn new(geometry: &PictureGeometry) -> Self {
        let (nb_ctb_w, nb_ctb_h) = geometry.ctb_dims();
        let nb_unit_ctb = (geometry.ctb_size() >> LOG2_MIN_CU_S) as usize;
        let nb_tmvp_unit = (geometry.ctb_size() >> LOG2_TMVP_UNIT) as usize;
        let nb_ctbs = (nb_ctb_w * nb_ctb_h) as usize;

        Self {
            // One extra CTU worth of columns so the right neighbour read of the last CTU stays in
            // bounds.
            dirs: vec![0; (nb_ctbs + 1) * nb_unit_ctb],
            mvs: vec![Mv::default(); (nb_ctbs + 1) * nb_tmvp_unit * nb_tmvp_unit],
            nb_unit_ctb,
            nb_tmvp_unit,
            nb_ctb_w: nb_ctb_w as usize,
        }
    }

    /// Forgets the motion of a previous picture.
    pub fn reset(&mut self) {
        self.dirs.fill(0);
    }

    fn stride(&self) -> usize {
        self.nb_tmvp_unit * self.nb_ctb_w
    }

    fn ctb_offset(&self, ctb_x: usize, ctb_y: usize) -> usize {
        ctb_x * self.nb_tmvp_unit + ctb_y * self.nb_tmvp_unit * self.stride()
    }

    /// Copies the motion of CTU `(ctb_x, ctb_y)` out of the decoding buffers.
    pub fn store_ctu(&mut self, ctb_x: usize, ctb_y: usize, field: &MvField, ctu: &CtuTmvpBuffer) {
        let ctb_rs = ctb_x + ctb_y * self.nb_ctb_w;
        let nb_unit = self.nb_unit_ctb;
        let rows = unit_mask(nb_unit as u32) << 1;

        let dirs = &mut self.dirs[ctb_rs * nb_unit..(ctb_rs + 1) * nb_unit];
        for (x, dir) in dirs.iter_mut().enumerate() {
            *dir = field.vfield[x + 1] & rows;
        }

        let offset = self.ctb_offset(ctb_x, ctb_y);
        let stride = self.stride();
        let ntu = self.nb_tmvp_unit;
        for j in 0..ntu {
            let dst = offset + j * stride;
            let src = j * CTU_TMVP_STRIDE;
            self.mvs[dst..dst + ntu].copy_from_slice(&ctu.mvs[src..src + ntu]);
        }
    }
}

/// 8x8 motion of the CTU being decoded, for one list.
#[derive(Clone, Debug)]
pub struct CtuTmvpBuffer {
    mvs: Vec<Mv>,
}

impl Default for CtuTmvpBuffer {
    fn default() -> Self {
        Self {
            mvs: vec![Mv::default(); CTU_TMVP_STRIDE * CTU_TMVP_STRIDE],
        }
    }
}

impl CtuTmvpBuffer {
    /// Records `mv` for the 8x8 units whose top-left sample lies in the block. Positions are in
    /// 4x4 units.
    pub fn fill(&mut self, mv: Mv, x: i32, y: i32, w: i32, h: i32) {
        let mv = mv.reset_side_info();
        for j in y..y + h {
            if j & 1 != 0 {
                continue;
            }
            for i in x..x + w {
                if i & 1 == 0 {
                    self.mvs[(i >> 1) as usize + (j >> 1) as usize * CTU_TMVP_STRIDE] = mv;
                }
            }
        }
    }

    pub fn mv(&self, x: i32, y: i32) -> Mv {
        self.mvs[(x >> 1) as usize + (y >> 1) as usize * CTU_TMVP_STRIDE]
    }
}

/// Collocated picture selection and POC distances of the current picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TmvpInfo {
    pub collocated: Option<PicId>,
    /// The collocated picture is taken from list 0.
    pub col_from_l0: bool,
    pub col_ref_idx: usize,
    /// Index of the collocated picture in the other list, last match.
    pub mirror_idx: Option<usize>,
    /// Current POC minus the POC of each reference, per list.
    pub dist_ref: [[i32; MAX_NUM_REF]; 2],
    /// Collocated POC minus the POC of each of its references, per list.
    pub dist_col: [[i32; MAX_NUM_REF]; 2],
    /// Low delay: no reference follows the current picture in output order.
    pub ldc: bool,
}

impl TmvpInfo {
    /// Derives the temporal context of the picture at `poc` with resolved lists `rpl_info`.
    ///
    /// `rpl` holds the slot of each reference and `col_info` returns the POC and resolved lists
    /// of a slot.
    pub fn derive(
        poc: i32,
        slice: &SliceParams,
        rpl_info: &[RplInfo; 2],
        rpl: &[[Option<PicId>; MAX_NUM_REF]; 2],
        col_info: impl Fn(PicId) -> Option<(i32, [RplInfo; 2])>,
    ) -> Self {
        let mut info = TmvpInfo {
            ldc: true,
            ..Default::default()
        };

        for list in 0..2 {
            let nb_active = slice.num_active(list);
            for (i, r) in rpl_info[list].iter().enumerate() {
                info.dist_ref[list][i] = poc - r.poc;
                if i < nb_active && r.poc > poc {
                    info.ldc = false;
                }
            }
        }

        if !slice.temporal_mvp_enabled || slice.slice_type.is_intra() {
            return info;
        }

        let from_l0 = slice.collocated_from_l0 || slice.slice_type.is_p();
        let (col_list, mirror_list) = if from_l0 { (0, 1) } else { (1, 0) };
        let col_ref_idx = slice.collocated_ref_idx;

        let Some(col_ref) = rpl_info[col_list].get(col_ref_idx) else {
            log::warn!("Collocated reference index {} out of list", col_ref_idx);
            return info;
        };
        let col_poc = col_ref.poc;

        info.col_from_l0 = from_l0;
        info.col_ref_idx = col_ref_idx;
        info.mirror_idx = rpl_info[mirror_list]
            .iter()
            .take(slice.num_active(mirror_list))
            .rposition(|r| r.poc == col_poc);
        info.collocated = rpl[col_list][col_ref_idx];

        if let Some((col_poc, col_rpl)) = info.collocated.and_then(&col_info) {
            for list in 0..2 {
                for (i, r) in col_rpl[list].iter().enumerate() {
                    info.dist_col[list][i] = col_poc - r.poc;
                }
            }
        }

        info
    }
}

/// Collocated motion covering the current CTU and the first column of its right neighbour.
#[derive(Clone, Debug)]
pub struct CollocatedCtu {
    /// Index `x` describes 4x4 column `x` of the CTU, bit `y + 1` row `y`.
    dir_maps: [[u64; CTU_TMVP_STRIDE * 2 + 2]; 2],
    mvs: [Vec<Mv>; 2],
    loaded: bool,
}

impl Default for CollocatedCtu {
    fn default() -> Self {
        Self {
            dir_maps: [[0; CTU_TMVP_STRIDE * 2 + 2]; 2],
            mvs: [
                vec![Mv::default(); COL_TMVP_STRIDE * CTU_TMVP_STRIDE],
                vec![Mv::default(); COL_TMVP_STRIDE * CTU_TMVP_STRIDE],
            ],
            loaded: false,
        }
    }
}

impl CollocatedCtu {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Drops the window at CTU change.
    pub fn invalidate(&mut self) {
        self.loaded = false;
    }

    /// Loads the window of CTU `(ctb_x, ctb_y)` from `col`, waiting for the collocated CTUs to be
    /// decoded first. Lists the collocated picture carries no motion for read as unavailable.
    pub fn load(&mut self, col: &Picture, geometry: &PictureGeometry, ctb_x: u32, ctb_y: u32) {
        let (nb_ctb_w, nb_ctb_h) = geometry.ctb_dims();
        col.progress()
            .wait_for_collocated(ctb_x, ctb_y, nb_ctb_w, nb_ctb_h);

        let is_border_pic = ctb_x + 1 == nb_ctb_w;
        let state = col.state();

        for list in 0..2 {
            self.dir_maps[list].fill(0);

            let Some(plane) = state.mv_planes[list].as_ref() else {
                continue;
            };

            let nb_unit = plane.nb_unit_ctb;
            let ntu = plane.nb_tmvp_unit;
            let nb_cols = nb_unit + usize::from(!is_border_pic);
            let ctb_rs = ctb_x as usize + ctb_y as usize * plane.nb_ctb_w;
            let src = ctb_rs * nb_unit;
            self.dir_maps[list][..nb_cols].copy_from_slice(&plane.dirs[src..src + nb_cols]);

            let nb_mv_cols = ntu + usize::from(!is_border_pic);
            let offset = plane.ctb_offset(ctb_x as usize, ctb_y as usize);
            let stride = plane.stride();
            for j in 0..ntu {
                let src = offset + j * stride;
                let dst = j * COL_TMVP_STRIDE;
                self.mvs[list][dst..dst + nb_mv_cols]
                    .copy_from_slice(&plane.mvs[src..src + nb_mv_cols]);
            }
        }

        self.loaded = true;
    }

    /// Whether 4x4 unit `(x, y)` of the collocated picture carries motion for `list`. `x` may
    /// point at the first column of the right CTU, `y` one row below the CTU, which always reads
    /// as unavailable.
    pub fn available(&self, list: usize, x: i32, y: i32) -> bool {
        self.dir_maps[list][x as usize] & (1u64 << (y + 1)) != 0
    }

    pub fn mv(&self, list: usize, x: i32, y: i32) -> Mv {
        self.mvs[list][(x >> 1) as usize + (y >> 1) as usize * COL_TMVP_STRIDE]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::vvc::params::RefPicList;
    use crate::codec::vvc::params::SliceType;
    use crate::codec::vvc::picture::RefInfo;
    use crate::video_frame::frame_pool::FramePool;
    use crate::video_frame::FrameInfo;
    use crate::video_frame::PlanarFrame;
    use crate::Resolution;

    fn rpl_info(pocs: &[i32]) -> RplInfo {
        let mut info = RplInfo::default();
        for (i, &poc) in pocs.iter().enumerate() {
            info.refs[i] = RefInfo {
                poc,
                ..Default::default()
            };
        }
        info.nb_refs = pocs.len();
        info
    }

    #[test]
    fn ctu_buffer_keeps_8x8_origins() {
        let mut buf = CtuTmvpBuffer::default();
        let mut mv = Mv::with_ref(5, 6, 1);
        mv.bcw_idx_plus1 = 3;
        buf.fill(mv, 1, 1, 3, 3);

        // Only the unit at (2, 2) starts an 8x8 block.
        assert_eq!(buf.mv(2, 2), Mv::with_ref(5, 6, 1));
        assert_eq!(buf.mv(0, 0), Mv::default());
    }

    #[test]
    fn collocated_selection_and_distances() {
        let slice = SliceParams {
            slice_type: SliceType::B,
            temporal_mvp_enabled: true,
            collocated_from_l0: false,
            collocated_ref_idx: 0,
            rpl: [
                RefPicList::from_pocs(4, &[0, 8], 2),
                RefPicList::from_pocs(4, &[8, 0], 2),
            ],
            ..Default::default()
        };
        let lists = [rpl_info(&[0, 8]), rpl_info(&[8, 0])];
        let mut ids = [[None; MAX_NUM_REF]; 2];
        ids[0][0] = Some(0);
        ids[0][1] = Some(1);
        ids[1][0] = Some(1);
        ids[1][1] = Some(0);

        let info = TmvpInfo::derive(4, &slice, &lists, &ids, |id| {
            (id == 1).then(|| (8, [rpl_info(&[0]), RplInfo::default()]))
        });

        assert!(!info.ldc);
        assert!(!info.col_from_l0);
        assert_eq!(info.collocated, Some(1));
        assert_eq!(info.mirror_idx, Some(1));
        assert_eq!(info.dist_ref[0][..2], [4, -4]);
        assert_eq!(info.dist_ref[1][..2], [-4, 4]);
        assert_eq!(info.dist_col[0][0], 8);
    }

    #[test]
    fn p_slices_take_collocated_from_list0() {
        let slice = SliceParams {
            slice_type: SliceType::P,
            temporal_mvp_enabled: true,
            collocated_ref_idx: 1,
            rpl: [RefPicList::from_pocs(3, &[2, 1], 2), RefPicList::default()],
            ..Default::default()
        };
        let lists = [rpl_info(&[2, 1]), RplInfo::default()];
        let mut ids = [[None; MAX_NUM_REF]; 2];
        ids[0][1] = Some(7);

        let info = TmvpInfo::derive(3, &slice, &lists, &ids, |_| None);
        assert!(info.ldc);
        assert!(info.col_from_l0);
        assert_eq!(info.collocated, Some(7));
        assert_eq!(info.mirror_idx, None);
    }

    #[test]
    fn plane_round_trip_through_collocated_window() {
        let geometry = PictureGeometry::new(Resolution::from((64, 32)), 5);
        let mut pool = FramePool::new(PlanarFrame::new);
        pool.resize(&FrameInfo {
            resolution: geometry.resolution,
            bit_depth: 8,
            min_num_frames: 1,
            ..Default::default()
        });
        let mut planes = MvPlanePool::new(MvPlane::new);
        planes.resize(&geometry, 1);

        let col = Picture::new(0);
        col.claim(Arc::new(pool.alloc().unwrap()));
        col.progress().resize(2, 1);

        // CTU (1, 0) holds one 8x8 block at 4x4 position (2, 4).
        let mut field = MvField::default();
        let mut ctu = CtuTmvpBuffer::default();
        let mv = Mv::with_ref(12, -4, 0);
        field.fill(mv, 2, 4, 2, 2);
        ctu.fill(mv, 2, 4, 2, 2);

        let mut plane = planes.alloc().unwrap();
        plane.store_ctu(1, 0, &field, &ctu);
        col.state().mv_planes[0] = Some(plane);
        col.progress().report_frame();

        let mut window = CollocatedCtu::default();
        window.load(&col, &geometry, 1, 0);
        assert!(window.is_loaded());
        assert!(window.available(0, 2, 4));
        assert!(window.available(0, 3, 5));
        assert!(!window.available(0, 4, 4));
        assert!(!window.available(1, 2, 4));
        assert_eq!(window.mv(0, 2, 4), mv);

        // The left CTU sees the first column of its right neighbour, empty here.
        window.load(&col, &geometry, 0, 0);
        assert!(!window.available(0, 8, 4));
    }
}
