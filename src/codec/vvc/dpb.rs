// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use thiserror::Error;

use crate::codec::vvc::params::DpbParams;
use crate::codec::vvc::params::PictureGeometry;
use crate::codec::vvc::params::SequenceParams;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::PicFlags;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::PicMeta;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::tmvp::MvPlane;
use crate::codec::vvc::tmvp::MvPlanePool;
use crate::codec::vvc::tmvp::TmvpInfo;
use crate::codec::vvc::DPB_CAPACITY;
use crate::video_frame::frame_pool::FramePool;
use crate::video_frame::ChromaFormat;
use crate::video_frame::FrameInfo;
use crate::video_frame::PlanarFrame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("no frame buffer left in the pool")]
    OutOfMemory,
    #[error("every DPB slot holds a live picture")]
    CapacityExceeded,
    #[error("duplicate POC {poc} in coded video sequence {cvs_id}")]
    DuplicateSequenceNumber { poc: i32, cvs_id: u8 },
}

pub type Result<T> = std::result::Result<T, DpbError>;

/// Derives a POC from its signalled LSBs and the POC of the previous picture.
pub fn derive_poc(poc_lsb: u32, log2_max_poc_lsb: u8, prev_poc: i32) -> i32 {
    let max_poc_lsb = 1i32 << log2_max_poc_lsb;
    let poc_lsb = poc_lsb as i32;
    let prev_poc_lsb = prev_poc & (max_poc_lsb - 1);
    let mut poc_msb = prev_poc - prev_poc_lsb;

    if poc_lsb < prev_poc_lsb && prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
        poc_msb += max_poc_lsb;
    } else if poc_lsb > prev_poc_lsb && poc_lsb - prev_poc_lsb > max_poc_lsb / 2 {
        poc_msb -= max_poc_lsb;
    }

    poc_msb + poc_lsb
}

/// Slot to reclaim so that the number of used slots goes back under `capacity`: the lowest POC
/// among the used slots that are neither flagged nor referenced.
pub fn select_stale(metas: &[PicMeta], capacity: usize) -> Option<PicId> {
    let nb_used = metas.iter().filter(|m| m.used).count();
    if nb_used < capacity {
        return None;
    }

    metas
        .iter()
        .filter(|m| m.used && m.ref_count == 0 && m.flags.is_empty())
        .min_by_key(|m| m.poc)
        .map(|m| m.id)
}

/// The decoded picture buffer.
///
/// A fixed arena of [`Picture`] slots. Slots are handed out to the current picture and to
/// synthesized missing references, and come back once unflagged and unreferenced.
pub struct Dpb {
    /// Slots, indexed by [`PicId`].
    pictures: Vec<Arc<Picture>>,
    /// POC of the last initialized picture.
    poc: i32,
    /// Coded video sequence of the last initialized picture.
    cvs_id: u8,
    /// Maximum number of used slots before stale pictures are reclaimed.
    max_nb_dpb_pic: usize,
    max_nb_reorder_pic: usize,
    max_latency_increase: u32,
    /// Whether decoded pictures are queued for output.
    display_output: bool,
    geometry: PictureGeometry,
    /// Whether pictures keep their motion for later temporal prediction.
    temporal_mvp: bool,
    frame_pool: FramePool<PlanarFrame>,
    mv_pool: MvPlanePool,
}

impl Dpb {
    pub fn new(display_output: bool) -> Self {
        Self {
            pictures: (0..DPB_CAPACITY).map(|id| Arc::new(Picture::new(id))).collect(),
            poc: 0,
            cvs_id: 0,
            max_nb_dpb_pic: DPB_CAPACITY - 1,
            max_nb_reorder_pic: 0,
            max_latency_increase: 0,
            display_output,
            geometry: Default::default(),
            temporal_mvp: false,
            frame_pool: FramePool::new(PlanarFrame::new),
            mv_pool: MvPlanePool::new(MvPlane::new),
        }
    }

    /// Applies the sequence parameters. Pools are rebuilt when the picture format changes.
    ///
    /// `nb_extra_frames` frames are added on top of the arena size to cover pictures held by the
    /// client after output.
    pub fn configure(&mut self, sps: &SequenceParams, nb_extra_frames: usize) {
        self.set_params(&sps.dpb);
        self.temporal_mvp = sps.tools.temporal_mvp;

        let info = FrameInfo {
            resolution: sps.geometry.resolution,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: sps.bit_depth,
            min_num_frames: DPB_CAPACITY + nb_extra_frames,
        };

        if self.geometry != sps.geometry || self.frame_pool.num_free() == 0 {
            log::debug!(
                "Resizing DPB pools for {}x{}, {} frames",
                info.resolution.width,
                info.resolution.height,
                info.min_num_frames
            );
            self.geometry = sps.geometry;
            self.frame_pool.resize(&info);
            self.mv_pool.resize(&sps.geometry, 2 * DPB_CAPACITY);
        }
    }

    pub fn set_params(&mut self, params: &DpbParams) {
        self.max_nb_dpb_pic = params.max_dec_pic_buffering.clamp(1, DPB_CAPACITY - 1);
        self.max_nb_reorder_pic = params.max_num_reorder;
        self.max_latency_increase = params.max_latency_increase_plus1.saturating_sub(1);
    }

    pub fn pictures(&self) -> &[Arc<Picture>] {
        &self.pictures
    }

    pub fn get(&self, id: PicId) -> Option<&Arc<Picture>> {
        self.pictures.get(id)
    }

    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn cvs_id(&self) -> u8 {
        self.cvs_id
    }

    pub fn max_nb_dpb_pic(&self) -> usize {
        self.max_nb_dpb_pic
    }

    pub fn max_nb_reorder_pic(&self) -> usize {
        self.max_nb_reorder_pic
    }

    pub fn max_latency_increase(&self) -> u32 {
        self.max_latency_increase
    }

    pub fn geometry(&self) -> &PictureGeometry {
        &self.geometry
    }

    pub fn display_output(&self) -> bool {
        self.display_output
    }

    pub fn set_display_output(&mut self, display_output: bool) {
        self.display_output = display_output;
    }

    /// Snapshot of every slot.
    pub fn metas(&self) -> Vec<PicMeta> {
        self.pictures.iter().map(|p| p.meta()).collect()
    }

    /// Number of slots holding a picture.
    pub fn num_used(&self) -> usize {
        self.pictures.iter().filter(|p| p.is_used()).count()
    }

    /// Claims the first free slot and gives it a frame from the pool. Slots left without flags
    /// or references are reclaimed on the way.
    pub fn alloc(&self) -> Result<Arc<Picture>> {
        let Some(pic) = self.pictures.iter().find(|p| p.try_reclaim()) else {
            log::error!("DPB full");
            return Err(DpbError::CapacityExceeded);
        };

        let frame = self.frame_pool.alloc().ok_or(DpbError::OutOfMemory)?;
        log::trace!("Chose picture slot {}", pic.id());
        pic.claim(Arc::new(frame));

        let (nb_ctb_w, nb_ctb_h) = self.geometry.ctb_dims();
        pic.progress().resize(nb_ctb_w, nb_ctb_h);

        Ok(Arc::clone(pic))
    }

    /// Allocates the slot of the picture about to be decoded.
    pub fn init_current_pic(&self, poc: i32) -> Result<Arc<Picture>> {
        let duplicate = self
            .pictures
            .iter()
            .map(|p| p.meta())
            .any(|m| m.used && m.cvs_id == self.cvs_id && m.poc == poc);
        if duplicate {
            log::error!("Duplicate POC in a sequence: {}", poc);
            return Err(DpbError::DuplicateSequenceNumber {
                poc,
                cvs_id: self.cvs_id,
            });
        }

        let pic = self.alloc()?;
        pic.progress().reset();

        if self.display_output {
            pic.add_ref(PicFlags::OUTPUT);
        }
        pic.add_ref(PicFlags::IN_DECODING);

        let mut state = pic.state();
        state.poc = poc;
        state.cvs_id = self.cvs_id;
        drop(state);

        Ok(pic)
    }

    /// Reclaims the oldest unreferenced picture when the DPB is at capacity.
    pub fn clear_stale_references(&self) {
        log::debug!("Release reference pictures");
        if let Some(id) = select_stale(&self.metas(), self.max_nb_dpb_pic) {
            self.pictures[id].try_reclaim();
        }
    }

    /// Drops every picture.
    pub fn flush(&mut self) {
        log::debug!("Flushing the DPB");
        for pic in self.pictures.iter() {
            pic.reset_refs();
            pic.try_reclaim();
            pic.progress().report_frame();
        }
    }

    /// Sets up the DPB for a new picture whose first slice is `slice` and returns its slot.
    ///
    /// Refresh pictures start a new reference state and let the previous sequence be bumped out.
    /// Other pictures mark their reference lists. On error nothing stays allocated for the
    /// picture.
    pub fn init_picture(&mut self, slice: &SliceParams, sps: &SequenceParams) -> Result<Arc<Picture>> {
        let nalu_type = slice.nalu_type;
        let is_idr = nalu_type.is_idr();
        let is_cra = nalu_type.is_cra() || nalu_type.is_gdr();

        let poc = if is_idr {
            self.cvs_id = self.cvs_id.wrapping_add(1);
            0
        } else {
            derive_poc(slice.pic_order_cnt_lsb, sps.log2_max_poc_lsb, self.poc)
        };
        self.poc = poc;

        if is_idr || is_cra {
            self.clear_stale_references();
            let out_cvs = self.cvs_id.wrapping_sub(u8::from(is_idr));
            self.bump_picture(poc, out_cvs);
        }

        let pic = self.init_current_pic(poc)?;
        log::debug!("DPB start new picture POC: {}", poc);

        if !is_idr && !is_cra {
            self.mark_ref_pic_lists(slice, &pic);
        }

        if let Err(e) = self.init_tmvp_info(&pic, slice) {
            self.abort_picture(&pic);
            return Err(e);
        }

        Ok(pic)
    }

    /// Releases everything held by and for a picture whose initialization failed.
    pub fn abort_picture(&self, pic: &Picture) {
        self.unmark_reference_lists(pic);
        pic.reset_refs();
        pic.try_reclaim();
        pic.progress().report_frame();
    }

    /// Requests the motion planes of `pic` and derives its temporal prediction context.
    pub fn init_tmvp_info(&self, pic: &Picture, slice: &SliceParams) -> Result<()> {
        if self.temporal_mvp && !slice.slice_type.is_intra() {
            let mut plane0 = self.mv_pool.alloc().ok_or(DpbError::OutOfMemory)?;
            plane0.reset();
            let plane1 = if slice.slice_type.is_b() {
                let mut plane1 = self.mv_pool.alloc().ok_or(DpbError::OutOfMemory)?;
                plane1.reset();
                Some(plane1)
            } else {
                None
            };
            pic.state().mv_planes = [Some(plane0), plane1];
        }

        let (poc, rpl_info, rpl) = {
            let state = pic.state();
            (state.poc, state.rpl_info.clone(), state.rpl)
        };

        let slice = SliceParams {
            temporal_mvp_enabled: self.temporal_mvp && slice.temporal_mvp_enabled,
            ..slice.clone()
        };

        let info = TmvpInfo::derive(poc, &slice, &rpl_info, &rpl, |id| {
            let col = self.pictures.get(id)?;
            let state = col.state();
            Some((state.poc, state.rpl_info.clone()))
        });

        pic.state().tmvp = info;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::params::NaluType;
    use crate::codec::vvc::params::RefPicList;
    use crate::codec::vvc::params::SliceType;
    use crate::Resolution;

    fn sps(max_dec_pic_buffering: usize, max_num_reorder: usize) -> SequenceParams {
        SequenceParams {
            geometry: PictureGeometry::new(Resolution::from((64, 64)), 5),
            dpb: DpbParams {
                max_dec_pic_buffering,
                max_num_reorder,
                max_latency_increase_plus1: 0,
            },
            log2_max_poc_lsb: 4,
            bit_depth: 8,
            ..Default::default()
        }
    }

    fn dpb(max_dec_pic_buffering: usize) -> Dpb {
        let mut dpb = Dpb::new(true);
        dpb.configure(&sps(max_dec_pic_buffering, 0), 0);
        dpb
    }

    #[test]
    fn poc_msb_wraps() {
        // 16 LSB values.
        assert_eq!(derive_poc(3, 4, 1), 3);
        assert_eq!(derive_poc(1, 4, 14), 17);
        assert_eq!(derive_poc(15, 4, 17), 15);
        assert_eq!(derive_poc(8, 4, 0), 8);
        assert_eq!(derive_poc(9, 4, 0), -7);
    }

    #[test]
    fn duplicate_poc_is_rejected() {
        let dpb = dpb(4);
        let pic = dpb.init_current_pic(3).unwrap();
        assert_eq!(pic.flags(), PicFlags::OUTPUT | PicFlags::IN_DECODING);
        assert_eq!(pic.ref_count(), 2);

        assert_eq!(
            dpb.init_current_pic(3).unwrap_err(),
            DpbError::DuplicateSequenceNumber { poc: 3, cvs_id: 0 }
        );
        assert_eq!(dpb.num_used(), 1);
    }

    #[test]
    fn alloc_fails_when_arena_is_full() {
        let dpb = dpb(4);
        for poc in 0..DPB_CAPACITY as i32 {
            dpb.init_current_pic(poc).unwrap();
        }
        assert_eq!(dpb.alloc().unwrap_err(), DpbError::CapacityExceeded);
    }

    #[test]
    fn alloc_fails_when_pool_is_empty() {
        let dpb = Dpb::new(false);
        assert_eq!(dpb.alloc().unwrap_err(), DpbError::OutOfMemory);
    }

    #[test]
    fn stale_selection_takes_lowest_free_poc() {
        let meta = |id, poc, flags, ref_count| PicMeta {
            id,
            used: true,
            poc,
            cvs_id: 0,
            flags,
            ref_count,
        };
        let metas = [
            meta(0, 4, PicFlags::empty(), 0),
            meta(1, 1, PicFlags::SHORT_TERM, 0),
            meta(2, 2, PicFlags::empty(), 1),
            meta(3, 3, PicFlags::empty(), 0),
        ];
        assert_eq!(select_stale(&metas, 4), Some(3));
        assert_eq!(select_stale(&metas, 5), None);
    }

    #[test]
    fn idr_starts_new_sequence() {
        let mut dpb = dpb(4);
        let sps = sps(4, 0);
        let slice = SliceParams {
            nalu_type: NaluType::IdrNLp,
            slice_type: SliceType::I,
            ..Default::default()
        };

        let pic = dpb.init_picture(&slice, &sps).unwrap();
        assert_eq!(dpb.cvs_id(), 1);
        assert_eq!(pic.poc(), 0);
        assert_eq!(pic.state().cvs_id, 1);

        let slice = SliceParams {
            nalu_type: NaluType::Trail,
            slice_type: SliceType::P,
            pic_order_cnt_lsb: 1,
            rpl: [RefPicList::from_pocs(1, &[0], 1), RefPicList::default()],
            ..Default::default()
        };
        let next = dpb.init_picture(&slice, &sps).unwrap();
        assert_eq!(next.poc(), 1);
        assert_eq!(next.state().rpl[0][0], Some(pic.id()));
        assert_eq!(next.state().tmvp.dist_ref[0][0], 1);
        assert!(pic.flags().contains(PicFlags::SHORT_TERM));
    }

    #[test]
    fn refresh_bumps_a_full_dpb() {
        let mut dpb = dpb(4);
        let sps = sps(4, 0);
        // As many decoded pictures waiting for output as the DPB holds.
        for poc in [3, 1, 4, 2] {
            let pic = dpb.init_current_pic(poc).unwrap();
            pic.release(PicFlags::IN_DECODING);
        }
        assert_eq!(dpb.num_used(), dpb.max_nb_dpb_pic());

        let cra = SliceParams {
            nalu_type: NaluType::Cra,
            slice_type: SliceType::I,
            pic_order_cnt_lsb: 6,
            ..Default::default()
        };
        let current = dpb.init_picture(&cra, &sps).unwrap();
        assert_eq!(current.poc(), 6);

        let bumped: Vec<i32> = dpb
            .pictures()
            .iter()
            .filter(|p| p.flags().contains(PicFlags::BUMPED))
            .map(|p| p.poc())
            .collect();
        assert_eq!(bumped, vec![1]);

        let (pic, cvs) = dpb.output_next(0).unwrap();
        assert_eq!((pic.poc(), cvs), (1, 0));
        dpb.take_output(&pic).unwrap();
        assert!(!pic.is_used());

        // One slot left for the refresh picture.
        let others = dpb.num_used() - usize::from(current.is_used());
        assert_eq!(others, dpb.max_nb_dpb_pic() - 1);
        assert_eq!(dpb.num_used(), dpb.max_nb_dpb_pic());
    }

    #[test]
    fn flush_frees_every_slot() {
        let mut dpb = dpb(4);
        for poc in 0..3 {
            dpb.init_current_pic(poc).unwrap();
        }
        assert_eq!(dpb.num_used(), 3);
        dpb.flush();
        assert_eq!(dpb.num_used(), 0);
    }

    #[test]
    fn temporal_planes_follow_slice_type() {
        let mut dpb = Dpb::new(false);
        let mut sps = sps(4, 0);
        sps.tools.temporal_mvp = true;
        dpb.configure(&sps, 0);

        let pic = dpb.init_current_pic(0).unwrap();
        let slice = SliceParams {
            slice_type: SliceType::B,
            ..Default::default()
        };
        dpb.init_tmvp_info(&pic, &slice).unwrap();
        {
            let state = pic.state();
            assert!(state.mv_planes[0].is_some());
            assert!(state.mv_planes[1].is_some());
        }

        pic.reset_refs();
        assert!(pic.try_reclaim());
        assert!(pic.state().mv_planes[0].is_none());
    }
}
