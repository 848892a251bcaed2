// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output ordering of decoded pictures.
//!
//! Selection works on [`PicMeta`] snapshots so that it can be reasoned about, and tested,
//! independently of the slots themselves.

use std::sync::Arc;

use crate::codec::vvc::dpb::Dpb;
use crate::codec::vvc::picture::PicFlags;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::PicMeta;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::picture::PictureFrame;

/// A picture handed to the client.
#[derive(Clone, Debug)]
pub struct OutputPicture {
    pub poc: i32,
    pub cvs_id: u8,
    pub frame: PictureFrame,
}

fn is_output(m: &PicMeta, cvs_id: u8) -> bool {
    m.used && m.cvs_id == cvs_id && m.flags.contains(PicFlags::OUTPUT)
}

/// Pictures to flag as bumped before a refresh picture at `poc` enters the DPB.
///
/// Once the flagged pictures of `output_cvs` other than the one at `poc` reach `capacity`,
/// every output picture of that sequence with the lowest pending POC or below is bumped.
pub fn select_bumped(metas: &[PicMeta], poc: i32, output_cvs: u8, capacity: usize) -> Vec<PicId> {
    let in_cvs = |m: &&PicMeta| m.used && m.cvs_id == output_cvs && m.poc != poc;

    let nb_pending = metas
        .iter()
        .filter(in_cvs)
        .filter(|m| !m.flags.is_empty())
        .count();
    if nb_pending < capacity {
        return vec![];
    }

    let min_poc = metas
        .iter()
        .filter(in_cvs)
        .filter(|m| m.flags.contains(PicFlags::OUTPUT))
        .map(|m| m.poc)
        .min()
        .unwrap_or(i32::MAX);

    metas
        .iter()
        .filter(|m| is_output(m, output_cvs) && m.poc <= min_poc)
        .map(|m| m.id)
        .collect()
}

/// Next picture to output, with the sequence it belongs to.
///
/// Pictures still being decoded are never output, and block every picture with a higher POC.
/// Within the current sequence, nothing is output while no more than `max_nb_reorder` decoded
/// pictures wait. Sequences before the current one are emptied first.
pub fn select_output(
    metas: &[PicMeta],
    mut output_cvs: u8,
    current_cvs: u8,
    max_nb_reorder: usize,
) -> Option<(PicId, u8)> {
    loop {
        let mut nb_output = 0;
        let mut min: Option<(i32, Option<PicId>)> = None;

        for m in metas.iter().filter(|m| is_output(m, output_cvs)) {
            let in_decoding = m.flags.contains(PicFlags::IN_DECODING);
            if !in_decoding {
                nb_output += 1;
            }
            if min.map_or(true, |(poc, _)| m.poc < poc) {
                min = Some((m.poc, (!in_decoding).then_some(m.id)));
            }
        }

        if output_cvs == current_cvs && nb_output <= max_nb_reorder {
            return None;
        }

        if let Some((_, Some(id))) = min {
            return Some((id, output_cvs));
        }

        if output_cvs == current_cvs {
            return None;
        }
        output_cvs = output_cvs.wrapping_add(1);
    }
}

/// Next picture to output at end of stream, regardless of the reorder depth.
pub fn select_drain(metas: &[PicMeta], mut output_cvs: u8, current_cvs: u8) -> Option<(PicId, u8)> {
    loop {
        let min = metas
            .iter()
            .filter(|m| is_output(m, output_cvs))
            .min_by_key(|m| m.poc);

        if let Some(m) = min {
            return Some((m.id, output_cvs));
        }

        if output_cvs == current_cvs {
            log::trace!("No picture to output");
            return None;
        }
        output_cvs = output_cvs.wrapping_add(1);
    }
}

impl Dpb {
    /// Flags pictures that must leave the DPB before a refresh picture at `poc`.
    pub fn bump_picture(&self, poc: i32, output_cvs: u8) {
        for id in select_bumped(&self.metas(), poc, output_cvs, self.max_nb_dpb_pic()) {
            let pic = &self.pictures()[id];
            log::debug!("Bumping picture with POC {}", pic.poc());
            pic.state().flags.insert(PicFlags::BUMPED);
        }
    }

    /// Next picture ready for output, and its sequence.
    pub fn output_next(&self, output_cvs: u8) -> Option<(Arc<Picture>, u8)> {
        let (id, cvs) = select_output(
            &self.metas(),
            output_cvs,
            self.cvs_id(),
            self.max_nb_reorder_pic(),
        )?;
        Some((Arc::clone(&self.pictures()[id]), cvs))
    }

    /// Next picture to output when draining, and its sequence.
    pub fn drain_next(&self, output_cvs: u8) -> Option<(Arc<Picture>, u8)> {
        let (id, cvs) = select_drain(&self.metas(), output_cvs, self.cvs_id())?;
        Some((Arc::clone(&self.pictures()[id]), cvs))
    }

    /// Hands the frame of `pic` to the client and drops the output marking.
    pub fn take_output(&self, pic: &Picture) -> Option<OutputPicture> {
        let (poc, cvs_id, frame) = {
            let state = pic.state();
            (state.poc, state.cvs_id, state.frame.clone()?)
        };

        log::debug!("Output picture with POC {}", poc);
        pic.release(PicFlags::OUTPUT | PicFlags::BUMPED);
        pic.try_reclaim();

        Some(OutputPicture { poc, cvs_id, frame })
    }
}
