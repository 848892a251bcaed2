// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture-level driver of the reconstruction core.
//!
//! [`VvcDecoder`] receives picture units, sets up each picture in the DPB and decodes its slices
//! on one of a fixed number of frame slots. With more than one frame thread, every slot decodes
//! on its own worker thread and pictures overlap, synchronized by their CTU progress. Decoded
//! pictures come back through [`VvcDecoder::receive_picture`] in output order.
//!
//! A slot that finished decoding keeps its picture marked as in decoding until the slot is
//! selected again, after the next picture has marked its own references. This keeps pictures
//! that are about to be referenced from being reclaimed in between.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;

use bytes::Bytes;

use crate::codec::vvc::dpb::Dpb;
use crate::codec::vvc::entropy::EntropyDecoder;
use crate::codec::vvc::mvp::SliceRefs;
use crate::codec::vvc::output::OutputPicture;
use crate::codec::vvc::params::NalUnit;
use crate::codec::vvc::params::NaluType;
use crate::codec::vvc::params::SequenceParams;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::PicFlags;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::recon::Reconstructor;
use crate::codec::vvc::slice::SliceDecoder;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::decoder::ReadyFramesQueue;
use crate::decoder::Result;
use crate::utils::lock;
use crate::utils::nalu::split_annex_b;

/// Parameter set and slice header parsing.
pub trait HeaderParser {
    /// Parses a sequence parameter set unit.
    fn parse_sps(&mut self, nalu: &NalUnit) -> anyhow::Result<SequenceParams>;

    /// Parses the header of a slice unit. Returns the header and the slice data that follows it.
    fn parse_slice(&mut self, nalu: &NalUnit, sps: &SequenceParams) -> anyhow::Result<(SliceParams, Bytes)>;
}

/// Provides what a slice needs to be decoded: an entropy decoder over its data and a
/// reconstructor writing into the current picture.
pub trait SliceBackend {
    fn entropy_decoder(
        &mut self,
        slice: &SliceParams,
        data: Bytes,
    ) -> anyhow::Result<Box<dyn EntropyDecoder + Send>>;

    fn reconstructor(
        &mut self,
        pic: &Arc<Picture>,
        slice: &SliceParams,
    ) -> anyhow::Result<Box<dyn Reconstructor + Send>>;
}

struct SliceJob {
    decoder: SliceDecoder,
    ed: Box<dyn EntropyDecoder + Send>,
    recon: Box<dyn Reconstructor + Send>,
}

/// Everything needed to decode one picture away from the submission thread.
struct PictureJob {
    pic: Arc<Picture>,
    refs: SliceRefs,
    slices: Vec<SliceJob>,
}

impl PictureJob {
    fn run(self) -> anyhow::Result<()> {
        let PictureJob { pic, refs, slices } = self;

        let mut result = Ok(());
        for mut job in slices {
            result = job
                .decoder
                .decode(&pic, refs.clone(), &mut *job.ed, &mut *job.recon);
            if result.is_err() {
                break;
            }
        }

        // Pictures waiting on this one must not stall on CTUs that will never be reported.
        pic.progress().report_frame();
        result
    }
}

enum SlotState {
    Idle,
    Decoding,
    Finished(anyhow::Result<()>),
}

struct FrameSlot {
    pic: Option<Arc<Picture>>,
    state: SlotState,
    worker: Option<JoinHandle<()>>,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            pic: None,
            state: SlotState::Idle,
            worker: None,
        }
    }
}

/// A slot handed back by [`FrameSlots::reap`].
struct FinishedSlot {
    pic: Arc<Picture>,
    result: anyhow::Result<()>,
    worker: Option<JoinHandle<()>>,
}

/// The frame slots, shared with the worker threads.
struct FrameSlots {
    slots: Mutex<Vec<FrameSlot>>,
    cond: Condvar,
}

impl FrameSlots {
    fn new(nb_slots: usize) -> Self {
        Self {
            slots: Mutex::new((0..nb_slots.max(1)).map(|_| FrameSlot::new()).collect()),
            cond: Condvar::new(),
        }
    }

    /// Waits for a slot that is not decoding and returns its index.
    fn acquire(&self) -> usize {
        let mut slots = lock(&self.slots);
        loop {
            if let Some(idx) = slots.iter().position(|s| !matches!(s.state, SlotState::Decoding)) {
                return idx;
            }
            slots = self
                .cond
                .wait(slots)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn assign(&self, idx: usize, pic: Arc<Picture>) {
        let mut slots = lock(&self.slots);
        let slot = &mut slots[idx];
        slot.pic = Some(pic);
        slot.state = SlotState::Decoding;
    }

    fn set_worker(&self, idx: usize, worker: JoinHandle<()>) {
        lock(&self.slots)[idx].worker = Some(worker);
    }

    /// Returns a slot whose worker could not be started to idle.
    fn release(&self, idx: usize) {
        lock(&self.slots)[idx] = FrameSlot::new();
        self.cond.notify_all();
    }

    fn complete(&self, idx: usize, result: anyhow::Result<()>) {
        lock(&self.slots)[idx].state = SlotState::Finished(result);
        self.cond.notify_all();
    }

    /// Takes every finished slot back to idle.
    fn reap(&self) -> Vec<FinishedSlot> {
        let mut slots = lock(&self.slots);
        let mut finished = vec![];
        for slot in slots.iter_mut() {
            if !matches!(slot.state, SlotState::Finished(_)) {
                continue;
            }

            let slot = std::mem::replace(slot, FrameSlot::new());
            if let (Some(pic), SlotState::Finished(result)) = (slot.pic, slot.state) {
                finished.push(FinishedSlot {
                    pic,
                    result,
                    worker: slot.worker,
                });
            }
        }
        finished
    }

    /// Waits until no slot is decoding.
    fn wait_idle(&self) {
        let mut slots = lock(&self.slots);
        while slots.iter().any(|s| matches!(s.state, SlotState::Decoding)) {
            slots = self
                .cond
                .wait(slots)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

/// Decoder for a VVC elementary stream.
pub struct VvcDecoder<P, B>
where
    P: HeaderParser,
    B: SliceBackend,
{
    parser: P,
    backend: B,
    config: DecoderConfig,
    /// Created with the first sequence parameters.
    dpb: Option<Dpb>,
    sps: Option<SequenceParams>,
    slots: Arc<FrameSlots>,
    nb_frame_threads: usize,
    /// Sequence the next output picture is taken from.
    output_cvs: u8,
    ready_queue: ReadyFramesQueue<OutputPicture>,
}

impl<P, B> VvcDecoder<P, B>
where
    P: HeaderParser,
    B: SliceBackend,
{
    pub fn new(parser: P, backend: B, config: DecoderConfig) -> Self {
        let nb_frame_threads = config.frame_threads();
        log::debug!(
            "Creating decoder with {} frame threads, {} entry threads",
            nb_frame_threads,
            config.nb_entry_threads
        );

        Self {
            parser,
            backend,
            config,
            dpb: None,
            sps: None,
            slots: Arc::new(FrameSlots::new(nb_frame_threads)),
            nb_frame_threads,
            output_cvs: 0,
            ready_queue: Default::default(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn dpb(&self) -> Option<&Dpb> {
        self.dpb.as_ref()
    }

    /// Submits the NAL units of one picture unit: optional parameter sets followed by the
    /// slices of a single picture.
    pub fn submit_picture_unit(&mut self, units: &[NalUnit]) -> Result<()> {
        let mut slices = vec![];

        for nalu in units {
            match nalu.header.type_ {
                NaluType::Sps => {
                    let sps = self.parser.parse_sps(nalu).map_err(DecodeError::Header)?;
                    self.activate_sps(sps);
                }
                NaluType::Eos | NaluType::Eob => {
                    log::debug!("End of sequence, waiting for pending pictures");
                    self.slots.wait_idle();
                    self.finish_slots();
                }
                type_ if type_.is_vcl() => {
                    let sps = self.sps.as_ref().ok_or(DecodeError::NoDpb)?;
                    if nalu.header.layer_id != 0 {
                        log::error!("Ignoring slice of layer {}", nalu.header.layer_id);
                        continue;
                    }
                    let slice = self.parser.parse_slice(nalu, sps).map_err(DecodeError::Header)?;
                    slices.push(slice);
                }
                type_ => log::trace!("Skipping {:?} unit", type_),
            }
        }

        if slices.is_empty() {
            return Ok(());
        }

        self.decode_picture(slices)?;
        self.collect_output();
        Ok(())
    }

    /// Submits a whole Annex B byte stream holding one picture unit.
    pub fn submit_bitstream(&mut self, stream: Bytes) -> Result<()> {
        let units = split_annex_b(stream).map_err(DecodeError::Header)?;
        self.submit_picture_unit(&units)
    }

    fn activate_sps(&mut self, sps: SequenceParams) {
        log::debug!(
            "Activating sequence parameters for {}x{}",
            sps.geometry.resolution.width,
            sps.geometry.resolution.height
        );

        let display_output = self.config.display_output;
        let dpb = self.dpb.get_or_insert_with(|| Dpb::new(display_output));
        // Pictures held by slots still decoding come on top of the DPB size.
        dpb.configure(&sps, self.nb_frame_threads);
        self.sps = Some(sps);
    }

    fn decode_picture(&mut self, slices: Vec<(SliceParams, Bytes)>) -> Result<()> {
        let sps = self.sps.clone().ok_or(DecodeError::NoDpb)?;
        let Some((first, _)) = slices.first() else {
            return Ok(());
        };

        let idx = self.slots.acquire();

        let dpb = self.dpb.as_mut().ok_or(DecodeError::NoDpb)?;
        let pic = dpb.init_picture(first, &sps)?;

        // Only now may the pictures of finished slots lose their decoding mark, since the new
        // picture holds its references.
        self.finish_slots();

        let job = match self.build_job(&sps, &pic, slices) {
            Ok(job) => job,
            Err(e) => {
                if let Some(dpb) = self.dpb.as_ref() {
                    dpb.abort_picture(&pic);
                }
                return Err(DecodeError::DecoderError(e));
            }
        };

        self.slots.assign(idx, Arc::clone(&pic));
        if self.nb_frame_threads > 1 {
            let slots = Arc::clone(&self.slots);
            let spawned = std::thread::Builder::new()
                .name(format!("vvc-frame-{}", idx))
                .spawn(move || slots.complete(idx, job.run()));

            match spawned {
                Ok(worker) => self.slots.set_worker(idx, worker),
                Err(e) => {
                    self.slots.release(idx);
                    if let Some(dpb) = self.dpb.as_ref() {
                        dpb.abort_picture(&pic);
                    }
                    return Err(DecodeError::DecoderError(e.into()));
                }
            }
        } else {
            self.slots.complete(idx, job.run());
        }

        Ok(())
    }

    fn build_job(
        &mut self,
        sps: &SequenceParams,
        pic: &Arc<Picture>,
        slices: Vec<(SliceParams, Bytes)>,
    ) -> anyhow::Result<PictureJob> {
        let refs = {
            let state = pic.state();
            let lookup =
                |id: Option<PicId>| id.and_then(|id| self.dpb.as_ref()?.get(id).cloned());
            SliceRefs {
                lists: state.rpl.map(|ids| ids.map(&lookup)),
                collocated: lookup(state.tmvp.collocated),
            }
        };

        let slices = slices
            .into_iter()
            .map(|(slice, data)| {
                let recon = self.backend.reconstructor(pic, &slice)?;
                let ed = self.backend.entropy_decoder(&slice, data)?;
                Ok(SliceJob {
                    decoder: SliceDecoder::new(sps, &slice),
                    ed,
                    recon,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(PictureJob {
            pic: Arc::clone(pic),
            refs,
            slices,
        })
    }

    /// Releases the pictures of the slots that finished decoding.
    fn finish_slots(&mut self) {
        for slot in self.slots.reap() {
            if let Some(worker) = slot.worker {
                if worker.join().is_err() {
                    log::error!("Worker of picture POC {} panicked", slot.pic.poc());
                }
            }

            if let Err(e) = &slot.result {
                log::error!("Error while decoding picture POC {}: {:#}", slot.pic.poc(), e);
            }

            log::trace!("Picture POC {} leaves decoding", slot.pic.poc());
            slot.pic.release(PicFlags::IN_DECODING);
            if let Some(dpb) = self.dpb.as_ref() {
                dpb.unmark_reference_lists(&slot.pic);
            }
            slot.pic.try_reclaim();
        }
    }

    /// Moves the pictures the DPB allows out into the ready queue.
    fn collect_output(&mut self) {
        let Some(dpb) = self.dpb.as_ref() else {
            return;
        };

        while let Some((pic, cvs)) = dpb.output_next(self.output_cvs) {
            self.output_cvs = cvs;
            match dpb.take_output(&pic) {
                Some(out) => self.ready_queue.push(out),
                None => {
                    log::warn!("Output picture POC {} has no frame", pic.poc());
                    pic.release(PicFlags::OUTPUT | PicFlags::BUMPED);
                }
            }
        }
    }

    /// Returns the next picture in output order, if the reorder constraints allow one.
    pub fn receive_picture(&mut self) -> Result<Option<OutputPicture>> {
        self.collect_output();
        Ok((&mut self.ready_queue).next())
    }

    /// Returns the next picture in output order at end of stream, regardless of the reorder
    /// constraints. Waits for pictures still decoding.
    pub fn drain_picture(&mut self) -> Result<Option<OutputPicture>> {
        if let Some(out) = (&mut self.ready_queue).next() {
            return Ok(Some(out));
        }

        self.slots.wait_idle();
        self.finish_slots();

        let Some(dpb) = self.dpb.as_ref() else {
            return Ok(None);
        };

        while let Some((pic, cvs)) = dpb.drain_next(self.output_cvs) {
            self.output_cvs = cvs;
            match dpb.take_output(&pic) {
                Some(out) => return Ok(Some(out)),
                None => pic.release(PicFlags::OUTPUT | PicFlags::BUMPED),
            }
        }

        Ok(None)
    }

    /// Drops every picture, waiting for the ones still decoding.
    pub fn reset(&mut self) {
        log::debug!("Resetting decoder");
        self.slots.wait_idle();
        self.finish_slots();
        (&mut self.ready_queue).for_each(drop);
        if let Some(dpb) = self.dpb.as_mut() {
            dpb.flush();
            self.output_cvs = dpb.cvs_id();
        }
    }
}

impl<P, B> Drop for VvcDecoder<P, B>
where
    P: HeaderParser,
    B: SliceBackend,
{
    fn drop(&mut self) {
        self.slots.wait_idle();
        self.finish_slots();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::params::DpbParams;
    use crate::codec::vvc::params::PictureGeometry;
    use crate::codec::vvc::params::RefPicList;
    use crate::codec::vvc::params::SliceType;
    use crate::utils::dummy::DummyBackend;
    use crate::utils::dummy::DummyParser;
    use crate::Resolution;

    fn sps_unit() -> NalUnit {
        // SPS, 64x32 in 32x32 CTUs, 4 pictures, no reordering.
        NalUnit::new(Bytes::from_static(&[0x00, 0x79, 5, 2, 1, 4, 0, 8])).unwrap()
    }

    fn slice_unit(type_: u8, payload: &[u8]) -> NalUnit {
        let mut data = vec![0x00, (type_ << 3) | 1];
        data.extend_from_slice(payload);
        NalUnit::new(Bytes::from(data)).unwrap()
    }

    fn decoder(nb_frame_threads: i32) -> VvcDecoder<DummyParser, DummyBackend> {
        let config = DecoderConfig {
            nb_frame_threads,
            ..Default::default()
        };
        VvcDecoder::new(DummyParser, DummyBackend::default(), config)
    }

    #[test]
    fn slice_before_sps() {
        let mut decoder = decoder(1);
        // IDR_N_LP, intra, POC 0, no reference, empty slice data.
        let idr = slice_unit(8, &[2, 0, 0]);
        assert!(matches!(
            decoder.submit_picture_unit(&[idr]),
            Err(DecodeError::NoDpb)
        ));
    }

    #[test]
    fn sps_configures_dpb() {
        let mut decoder = decoder(1);
        decoder.submit_picture_unit(&[sps_unit()]).unwrap();
        let dpb = decoder.dpb().unwrap();
        assert_eq!(dpb.max_nb_dpb_pic(), 4);
        assert_eq!(
            *dpb.geometry(),
            PictureGeometry::new(Resolution::from((64, 32)), 5)
        );
    }

    #[test]
    fn intra_picture_is_output_after_next_picture() {
        let mut decoder = decoder(1);
        let idr = slice_unit(8, &[2, 0, 0]);
        decoder.submit_picture_unit(&[sps_unit(), idr]).unwrap();

        // Still marked as in decoding until its slot is selected again.
        assert!(decoder.receive_picture().unwrap().is_none());

        let trail = slice_unit(0, &[1, 1, 1, 0]);
        decoder.submit_picture_unit(&[trail]).unwrap();
        assert_eq!(decoder.receive_picture().unwrap().map(|p| p.poc), Some(0));
        assert!(decoder.receive_picture().unwrap().is_none());

        assert_eq!(decoder.drain_picture().unwrap().map(|p| p.poc), Some(1));
        assert!(decoder.drain_picture().unwrap().is_none());
    }

    #[test]
    fn failing_picture_init_releases_nothing() {
        let mut decoder = decoder(1);
        let idr = slice_unit(8, &[2, 0, 0]);
        decoder.submit_picture_unit(&[sps_unit(), idr]).unwrap();
        let used = decoder.dpb().unwrap().num_used();

        // Same POC in the same sequence, through a non refresh picture.
        let dup = slice_unit(0, &[2, 0, 0]);
        assert!(matches!(
            decoder.submit_picture_unit(&[dup]),
            Err(DecodeError::Dpb(_))
        ));
        assert_eq!(decoder.dpb().unwrap().num_used(), used);
    }

    #[test]
    fn frame_threads_decode_in_parallel_slots() {
        let mut decoder = decoder(2);
        decoder.submit_picture_unit(&[sps_unit()]).unwrap();

        let idr = slice_unit(8, &[2, 0, 0]);
        decoder.submit_picture_unit(&[idr]).unwrap();
        for poc in 1..4u8 {
            let trail = slice_unit(0, &[1, poc, 1, poc - 1]);
            decoder.submit_picture_unit(&[trail]).unwrap();
        }

        let mut pocs = vec![];
        while let Some(pic) = decoder.receive_picture().unwrap() {
            pocs.push(pic.poc);
        }
        while let Some(pic) = decoder.drain_picture().unwrap() {
            pocs.push(pic.poc);
        }
        assert_eq!(pocs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reset_empties_the_dpb() {
        let mut decoder = decoder(1);
        let idr = slice_unit(8, &[2, 0, 0]);
        decoder.submit_picture_unit(&[sps_unit(), idr]).unwrap();
        decoder.reset();
        assert_eq!(decoder.dpb().unwrap().num_used(), 0);
        assert!(decoder.drain_picture().unwrap().is_none());
    }

    #[test]
    fn dummy_parser_reads_reference_pocs() {
        let mut parser = DummyParser;
        let sps = parser.parse_sps(&sps_unit()).unwrap();
        assert_eq!(
            sps.dpb,
            DpbParams {
                max_dec_pic_buffering: 4,
                max_num_reorder: 0,
                max_latency_increase_plus1: 0,
            }
        );

        let (slice, data) = parser
            .parse_slice(&slice_unit(0, &[0, 4, 2, 2, 0, 0xa5]), &sps)
            .unwrap();
        assert_eq!(slice.slice_type, SliceType::B);
        assert_eq!(slice.pic_order_cnt_lsb, 4);
        assert_eq!(slice.rpl[0], RefPicList::from_pocs(4, &[2, 0], 2));
        assert_eq!(slice.rpl[1], slice.rpl[0]);
        assert_eq!(data.as_ref(), &[0xa5]);
    }
}
