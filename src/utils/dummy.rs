// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy header parser and slice backend whose only purpose is to let the
//! decoder run so we can test it in isolation.
//!
//! Their units use a made-up syntax. An SPS payload is
//! `[log2_ctb_size, width_in_ctbs, height_in_ctbs, max_dec_pic_buffering, max_num_reorder,
//! log2_max_poc_lsb]`. A slice payload is `[slice_type, poc_lsb, nb_refs, ref_poc...]` followed by
//! the slice data, whose bits are replayed as bins, most significant first. Both reference lists
//! hold the same POCs, all active.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;

use crate::codec::vvc::entropy::EntropyDecoder;
use crate::codec::vvc::entropy::ScriptedBins;
use crate::codec::vvc::params::DpbParams;
use crate::codec::vvc::params::NalUnit;
use crate::codec::vvc::params::PictureGeometry;
use crate::codec::vvc::params::RefPicList;
use crate::codec::vvc::params::SequenceParams;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::params::SliceType;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::recon::ReconLog;
use crate::codec::vvc::recon::Reconstructor;
use crate::decoder::vvc::HeaderParser;
use crate::decoder::vvc::SliceBackend;
use crate::Resolution;

pub struct DummyParser;

impl HeaderParser for DummyParser {
    fn parse_sps(&mut self, nalu: &NalUnit) -> anyhow::Result<SequenceParams> {
        let payload = nalu.payload();
        let &[log2_ctb, w, h, max_dec_pic_buffering, max_num_reorder, log2_max_poc_lsb] =
            payload.as_ref()
        else {
            return Err(anyhow!("dummy SPS needs 6 bytes, got {}", payload.len()));
        };

        let ctb = 1u32 << log2_ctb;
        Ok(SequenceParams {
            geometry: PictureGeometry::new(
                Resolution::from((u32::from(w) * ctb, u32::from(h) * ctb)),
                log2_ctb,
            ),
            dpb: DpbParams {
                max_dec_pic_buffering: max_dec_pic_buffering.into(),
                max_num_reorder: max_num_reorder.into(),
                max_latency_increase_plus1: 0,
            },
            log2_max_poc_lsb,
            bit_depth: 8,
            ..Default::default()
        })
    }

    fn parse_slice(&mut self, nalu: &NalUnit, _: &SequenceParams) -> anyhow::Result<(SliceParams, Bytes)> {
        let payload = nalu.payload();
        if payload.len() < 3 {
            return Err(anyhow!("dummy slice header is too short"));
        }
        let (slice_type, poc_lsb) = (payload[0], payload[1]);
        let nb_refs = usize::from(payload[2]);
        let rest = &payload[3..];
        if rest.len() < nb_refs {
            return Err(anyhow!("dummy slice lists {} references, has {}", nb_refs, rest.len()));
        }

        let slice_type =
            SliceType::n(slice_type).ok_or(anyhow!("invalid slice type {}", slice_type))?;
        let poc = i32::from(poc_lsb);
        let ref_pocs: Vec<i32> = rest[..nb_refs].iter().map(|&p| i32::from(p)).collect();
        let rpl = RefPicList::from_pocs(poc, &ref_pocs, nb_refs);

        let slice = SliceParams {
            nalu_type: nalu.header.type_,
            slice_type,
            pic_order_cnt_lsb: poc_lsb.into(),
            rpl: [rpl.clone(), rpl],
            slice_qp: 32,
            max_num_merge_cand: 6,
            ..Default::default()
        };

        Ok((slice, payload.slice(3 + nb_refs..)))
    }
}

/// Replays slice data as bins and records reconstruction calls.
#[derive(Default)]
pub struct DummyBackend {
    pub nb_slices: usize,
}

impl SliceBackend for DummyBackend {
    fn entropy_decoder(
        &mut self,
        _: &SliceParams,
        data: Bytes,
    ) -> anyhow::Result<Box<dyn EntropyDecoder + Send>> {
        self.nb_slices += 1;
        let bins = data
            .iter()
            .flat_map(|&byte| (0..8).rev().map(move |i| (byte >> i) & 1 != 0));
        Ok(Box::new(ScriptedBins::new(bins)))
    }

    fn reconstructor(
        &mut self,
        _: &Arc<Picture>,
        _: &SliceParams,
    ) -> anyhow::Result<Box<dyn Reconstructor + Send>> {
        Ok(Box::<ReconLog>::default())
    }
}
