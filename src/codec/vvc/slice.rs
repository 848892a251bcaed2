// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice decoding: walks the CTUs of a slice in raster order.

use anyhow::bail;

use crate::codec::vvc::coding_tree::TreeNode;
use crate::codec::vvc::coding_unit::CuMaps;
use crate::codec::vvc::coding_unit::QpState;
use crate::codec::vvc::entropy::EntropyDecoder;
use crate::codec::vvc::mvp::InterCtx;
use crate::codec::vvc::mvp::SliceRefs;
use crate::codec::vvc::params::SequenceParams;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::recon::Reconstructor;

/// Parsing and motion state of one slice.
pub struct SliceDecoder {
    pub(super) sps: SequenceParams,
    pub(super) slice: SliceParams,
    pub(super) inter: InterCtx,
    pub(super) maps: CuMaps,
    pub(super) qp: QpState,
}

impl SliceDecoder {
    pub fn new(sps: &SequenceParams, slice: &SliceParams) -> Self {
        Self {
            sps: sps.clone(),
            slice: slice.clone(),
            inter: InterCtx::new(&sps.geometry),
            maps: CuMaps::new(sps.geometry.resolution),
            qp: Default::default(),
        }
    }

    pub fn inter(&self) -> &InterCtx {
        &self.inter
    }

    pub fn maps(&self) -> &CuMaps {
        &self.maps
    }

    /// CTU addresses covered by the slice.
    fn ctb_range(&self) -> anyhow::Result<std::ops::Range<usize>> {
        let nb_ctbs = self.sps.geometry.nb_ctbs();
        let first = self.slice.first_ctb_addr;
        let end = match self.slice.nb_ctbs {
            0 => nb_ctbs,
            n => (first + n).min(nb_ctbs),
        };
        if first >= end {
            bail!("slice starts at CTU {} but the picture has {}", first, nb_ctbs);
        }
        Ok(first..end)
    }

    /// Decodes the slice into `pic`, reporting each finished CTU row segment on its progress.
    /// Inter blocks wait for the CTUs they read in `refs`.
    pub fn decode<E, R>(
        &mut self,
        pic: &Picture,
        refs: SliceRefs,
        ed: &mut E,
        recon: &mut R,
    ) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let range = self.ctb_range()?;
        let geometry = self.sps.geometry;
        let (nb_ctb_w, _) = geometry.ctb_dims();
        let log2_ctb = geometry.log2_ctb_size;

        log::debug!(
            "Decoding {:?} slice of POC {}, CTUs {:?}",
            self.slice.slice_type,
            pic.poc(),
            range
        );

        self.inter.start_slice(&self.slice, &self.sps, pic, refs);
        self.maps.reset();
        self.qp.start_slice(self.slice.slice_qp);

        let first = range.start;
        let last = range.end - 1;
        let mut row_start = 0;
        for addr in range {
            let ctb_x = (addr % nb_ctb_w as usize) as u32;
            let ctb_y = (addr / nb_ctb_w as usize) as u32;

            if addr == first || ctb_x == 0 {
                self.inter.start_row();
                row_start = ctb_x;
            }
            self.inter.start_ctu(ctb_x, ctb_y);

            let root = TreeNode::ctu(ctb_x << log2_ctb, ctb_y << log2_ctb, log2_ctb);
            self.coding_tree(ed, recon, &root)?;

            recon.deblocking_info(ctb_x, ctb_y, self.inter.dbf());
            self.inter.end_ctu(pic);

            if ctb_x + 1 == nb_ctb_w || addr == last {
                self.inter.end_row();
                pic.progress().report_line(ctb_y, row_start, ctb_x);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::codec::vvc::entropy::ScriptedBins;
    use crate::codec::vvc::mv::MergeInfo;
    use crate::codec::vvc::params::PictureGeometry;
    use crate::codec::vvc::params::SliceType;
    use crate::codec::vvc::recon::BlockRect;
    use crate::codec::vvc::recon::ReconCall;
    use crate::codec::vvc::recon::ReconLog;
    use crate::Resolution;

    fn sps() -> SequenceParams {
        SequenceParams {
            geometry: PictureGeometry::new(Resolution::from((64, 32)), 5),
            bit_depth: 8,
            log2_max_poc_lsb: 8,
            ..Default::default()
        }
    }

    fn p_slice() -> SliceParams {
        SliceParams {
            slice_type: SliceType::P,
            slice_qp: 32,
            max_num_merge_cand: 6,
            ..Default::default()
        }
    }

    #[test]
    fn skipped_p_slice() {
        let sps = sps();
        let pic = Picture::new(0);
        pic.progress().resize(2, 1);

        let mut decoder = SliceDecoder::new(&sps, &p_slice());
        // Per CTU: no split, skip, merge index 0.
        let mut ed = ScriptedBins::from_bits("0 1 0  0 1 0");
        let mut recon = ReconLog::default();
        decoder.decode(&pic, Default::default(), &mut ed, &mut recon).unwrap();

        assert_eq!(ed.remaining(), 0);
        assert_eq!(recon.calls.len(), 2);
        assert_eq!(
            recon.calls[1],
            ReconCall::MotionCompensate(BlockRect::new(32, 0, 5, 5), MergeInfo::uni(0, Default::default()))
        );

        let cu = decoder.maps().get(40, 8).unwrap();
        assert!(cu.skip);
        assert_eq!(cu.qp, 32);
        assert!(pic.progress().is_decoded(0, 0, 1));
    }

    #[test]
    fn inter_blocks_wait_for_their_reference() {
        let sps = sps();
        let pic = Arc::new(Picture::new(1));
        pic.progress().resize(2, 1);
        let reference = Arc::new(Picture::new(0));
        reference.progress().resize(2, 1);

        let mut refs = SliceRefs::default();
        refs.lists[0][0] = Some(Arc::clone(&reference));

        let worker = {
            let pic = Arc::clone(&pic);
            thread::spawn(move || {
                let mut decoder = SliceDecoder::new(&sps, &p_slice());
                let mut ed = ScriptedBins::from_bits("0 1 0  0 1 0");
                let mut recon = ReconLog::default();
                decoder
                    .decode(&pic, refs, &mut ed, &mut recon)
                    .map(|()| recon.calls)
            })
        };

        // The first CTU reads into the second CTU of the reference, which is not decoded yet.
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        assert!(!pic.progress().is_decoded(0, 0, 0));

        reference.progress().report_line(0, 0, 1);
        let calls = worker.join().unwrap().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(pic.progress().is_decoded(0, 0, 1));
    }

    #[test]
    fn skipped_128_cu_in_gpm_slice() {
        let mut sps = sps();
        sps.geometry = PictureGeometry::new(Resolution::from((128, 128)), 7);
        sps.tools.gpm = true;
        let pic = Picture::new(0);
        pic.progress().resize(1, 1);

        let slice = SliceParams {
            slice_type: SliceType::B,
            max_num_gpm_cand: 6,
            ..p_slice()
        };
        let mut decoder = SliceDecoder::new(&sps, &slice);
        // No split, skip, merge index 0. GPM needs both sides under 128, so no regular flag.
        let mut ed = ScriptedBins::from_bits("0 1 0");
        let mut recon = ReconLog::default();
        decoder.decode(&pic, Default::default(), &mut ed, &mut recon).unwrap();

        assert_eq!(ed.remaining(), 0);
        assert_eq!(recon.calls.len(), 1);
        assert!(matches!(
            recon.calls[0],
            ReconCall::MotionCompensate(blk, _) if blk == BlockRect::new(0, 0, 7, 7)
        ));
    }

    #[test]
    fn quad_split_intra_slice() {
        let sps = sps();
        let pic = Picture::new(0);
        pic.progress().resize(2, 1);

        let slice = SliceParams {
            slice_type: SliceType::I,
            slice_qp: 27,
            nb_ctbs: 1,
            ..Default::default()
        };
        let mut decoder = SliceDecoder::new(&sps, &slice);

        // Quad split of the 32x32 CTU, then four unsplit 16x16 CUs. Split flags of the
        // children are coded since they may still be split. Each CU: MPM flag, planar, derived
        // chroma, no coefficients.
        let cu = "0 1 0 0 000";
        let script = format!("1 1 {cu} {cu} {cu} {cu}");
        let mut ed = ScriptedBins::from_bits(&script);
        let mut recon = ReconLog::default();
        decoder.decode(&pic, Default::default(), &mut ed, &mut recon).unwrap();

        let intra_blocks: Vec<BlockRect> = recon
            .calls
            .iter()
            .filter_map(|c| match c {
                ReconCall::IntraPredict(blk, _) => Some(*blk),
                _ => None,
            })
            .collect();
        assert_eq!(
            intra_blocks,
            vec![
                BlockRect::new(0, 0, 4, 4),
                BlockRect::new(16, 0, 4, 4),
                BlockRect::new(0, 16, 4, 4),
                BlockRect::new(16, 16, 4, 4),
            ]
        );
        assert_eq!(decoder.maps().get(20, 20).map(|c| c.qt_depth), Some(1));
        assert!(decoder.maps().get(40, 0).is_none());
        // Only the first CTU of the row is done.
        assert!(pic.progress().is_decoded(0, 0, 0));
        assert!(!pic.progress().is_decoded(0, 1, 1));
        assert!(decoder.inter().dbf().bs2.left(4, 0));
    }

    #[test]
    fn slice_past_the_picture() {
        let slice = SliceParams {
            first_ctb_addr: 2,
            ..p_slice()
        };
        let mut decoder = SliceDecoder::new(&sps(), &slice);
        let pic = Picture::new(0);
        let mut ed = ScriptedBins::default();
        let mut recon = ReconLog::default();
        assert!(decoder.decode(&pic, Default::default(), &mut ed, &mut recon).is_err());
    }
}
