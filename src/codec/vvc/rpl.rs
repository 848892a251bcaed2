// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list resolution and DPB marking.

use std::sync::Arc;

use crate::codec::vvc::dpb::Dpb;
use crate::codec::vvc::params::RefPicList;
use crate::codec::vvc::params::SliceParams;
use crate::codec::vvc::picture::PicFlags;
use crate::codec::vvc::picture::PicId;
use crate::codec::vvc::picture::Picture;
use crate::codec::vvc::picture::RefInfo;
use crate::codec::vvc::picture::RefType;
use crate::codec::vvc::picture::RplInfo;
use crate::codec::vvc::MAX_NUM_REF;

/// Resolves the POC of every entry of `rpl` for the picture at `poc`.
///
/// Short-term entries are coded relative to the previous entry. Long-term entries only carry
/// their POC LSBs, which are used as is. Inter-layer references are not supported and resolve
/// to POC 0.
pub fn resolve_poc(rpl: &RefPicList, poc: i32) -> RplInfo {
    let mut info = RplInfo::default();
    let mut base = poc;

    for (entry, dst) in rpl.entries.iter().take(MAX_NUM_REF).zip(info.refs.iter_mut()) {
        let (ref_poc, type_) = if entry.st_ref_pic_flag {
            let delta = entry.abs_delta_poc_st as i32 + 1;
            let ref_poc = if entry.strp_entry_sign_flag {
                base - delta
            } else {
                base + delta
            };
            (ref_poc, RefType::ShortTerm)
        } else if entry.inter_layer_ref_pic_flag {
            log::error!("Unsupported inter layer reference");
            (0, RefType::InterLayer)
        } else {
            log::warn!("Partially supported long term reference");
            (entry.rpls_poc_lsb_lt, RefType::LongTerm)
        };

        *dst = RefInfo {
            poc: ref_poc,
            type_,
        };
        base = ref_poc;
    }

    info.nb_refs = rpl.len();
    info
}

impl Dpb {
    /// Slot holding `poc`, preferring the current coded video sequence.
    fn find_by_poc(&self, poc: i32) -> Option<&Arc<Picture>> {
        let cvs_id = self.cvs_id();
        let mut fallback = None;

        for pic in self.pictures() {
            let meta = pic.meta();
            if !meta.used || meta.poc != poc {
                continue;
            }
            if meta.cvs_id == cvs_id {
                return Some(pic);
            }
            fallback.get_or_insert(pic);
        }

        fallback
    }

    /// Builds a stand-in for a reference missing from the DPB.
    fn generate_missing_reference(&self, poc: i32) -> Option<Arc<Picture>> {
        log::warn!(
            "Generating missing reference {} for picture {}",
            poc,
            self.poc()
        );

        let pic = match self.alloc() {
            Ok(pic) => pic,
            Err(e) => {
                log::error!("Could not generate reference {}: {}", poc, e);
                return None;
            }
        };

        pic.progress().report_frame();
        {
            let mut state = pic.state();
            state.poc = poc;
            state.cvs_id = self.cvs_id();
            state.flags = PicFlags::empty();
        }

        Some(pic)
    }

    /// Takes a reference on the picture of each of the first `nb_active` entries of `info` and
    /// returns their slots. Missing pictures are synthesized.
    pub fn mark_active_references(
        &self,
        info: &RplInfo,
        nb_active: usize,
    ) -> [Option<PicId>; MAX_NUM_REF] {
        let mut ids = [None; MAX_NUM_REF];

        for (i, r) in info.iter().take(nb_active).enumerate() {
            let flag = r.type_.flag();

            if let Some(pic) = self.find_by_poc(r.poc) {
                log::trace!(
                    "Mark active reference {} for picture {}",
                    r.poc,
                    self.poc()
                );
                pic.state().flags.remove(PicFlags::REFERENCE);
                pic.add_ref(flag);
                ids[i] = Some(pic.id());
            } else if let Some(pic) = self.generate_missing_reference(r.poc) {
                pic.add_ref(PicFlags::SHORT_TERM);
                ids[i] = Some(pic.id());
            }
        }

        ids
    }

    /// Flags the pictures of the entries after the first `nb_active` ones as references, without
    /// holding them.
    pub fn mark_non_active_references(&self, info: &RplInfo, nb_active: usize) {
        for r in info.iter().skip(nb_active) {
            if let Some(pic) = self.find_by_poc(r.poc) {
                log::trace!(
                    "Mark non active reference {} for picture {}",
                    r.poc,
                    self.poc()
                );
                let mut state = pic.state();
                state.flags.remove(PicFlags::REFERENCE);
                state.flags.insert(r.type_.flag());
            }
        }
    }

    /// Resolves and marks the reference lists of `current`.
    ///
    /// Reference flags of every other picture are dropped first, so that pictures absent from
    /// both lists stop being references.
    pub fn mark_ref_pic_lists(&self, slice: &SliceParams, current: &Picture) {
        let (poc, cvs_id) = {
            let state = current.state();
            (state.poc, state.cvs_id)
        };

        for pic in self.pictures() {
            if pic.id() == current.id() {
                continue;
            }
            let mut state = pic.state();
            if state.cvs_id == cvs_id && state.poc == poc {
                continue;
            }
            state.flags.remove(PicFlags::REFERENCE);
        }

        let nb_lists = if slice.slice_type.is_b() { 2 } else { 1 };
        for list in 0..nb_lists {
            let info = resolve_poc(&slice.rpl[list], poc);
            let nb_active = slice.num_active(list);
            let ids = self.mark_active_references(&info, nb_active);
            self.mark_non_active_references(&info, nb_active);

            let mut state = current.state();
            state.rpl_info[list] = info;
            state.rpl[list] = ids;
        }

        self.clear_stale_references();
    }

    /// Releases the references taken by [`Dpb::mark_ref_pic_lists`] for `pic`.
    pub fn unmark_reference_lists(&self, pic: &Picture) {
        let (rpl_info, rpl) = {
            let mut state = pic.state();
            let rpl = std::mem::take(&mut state.rpl);
            (state.rpl_info.clone(), rpl)
        };

        for (info, ids) in rpl_info.iter().zip(rpl.iter()) {
            for (r, id) in info.iter().zip(ids.iter()) {
                match id.and_then(|id| self.get(id)) {
                    Some(ref_pic) => {
                        log::trace!("Unmark active reference {}", r.poc);
                        ref_pic.release(r.type_.flag());
                    }
                    None => log::trace!("Unmark non active reference {}", r.poc),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vvc::params::PictureGeometry;
    use crate::codec::vvc::params::RefPicListEntry;
    use crate::codec::vvc::params::SequenceParams;
    use crate::codec::vvc::params::SliceType;
    use crate::Resolution;

    fn dpb() -> Dpb {
        let mut dpb = Dpb::new(false);
        dpb.configure(
            &SequenceParams {
                geometry: PictureGeometry::new(Resolution::from((32, 32)), 5),
                bit_depth: 8,
                ..Default::default()
            },
            0,
        );
        dpb
    }

    #[test]
    fn short_term_chain() {
        let rpl = RefPicList {
            entries: vec![
                RefPicListEntry::short_term(-1),
                RefPicListEntry::short_term(-2),
                RefPicListEntry::short_term(5),
            ],
            num_active: 2,
        };
        let info = resolve_poc(&rpl, 8);
        let pocs: Vec<i32> = info.iter().map(|r| r.poc).collect();

        // Each entry is relative to the previous resolved POC.
        let mut expected = vec![];
        let mut base = 8;
        for d in [-1, -2, 5] {
            base += d;
            expected.push(base);
        }
        assert_eq!(pocs, expected);
        assert_eq!(pocs, vec![7, 5, 10]);
    }

    #[test]
    fn long_term_and_inter_layer_entries() {
        let rpl = RefPicList {
            entries: vec![
                RefPicListEntry::long_term(3),
                RefPicListEntry {
                    inter_layer_ref_pic_flag: true,
                    ..Default::default()
                },
                RefPicListEntry::short_term(-1),
            ],
            num_active: 3,
        };
        let info = resolve_poc(&rpl, 20);
        assert_eq!(info.refs[0].type_, RefType::LongTerm);
        assert_eq!(info.refs[0].poc, 3);
        assert_eq!(info.refs[1].type_, RefType::InterLayer);
        assert_eq!(info.refs[1].poc, 0);
        // Chained from the inter-layer entry.
        assert_eq!(info.refs[2].poc, -1);
    }

    #[test]
    fn active_marking_holds_references() {
        let dpb = dpb();
        let r0 = dpb.init_current_pic(0).unwrap();
        r0.release(PicFlags::IN_DECODING);
        let cur = dpb.init_current_pic(2).unwrap();

        let slice = SliceParams {
            slice_type: SliceType::P,
            rpl: [RefPicList::from_pocs(2, &[0], 1), RefPicList::default()],
            ..Default::default()
        };
        dpb.mark_ref_pic_lists(&slice, &cur);

        assert_eq!(r0.flags(), PicFlags::SHORT_TERM);
        assert_eq!(r0.ref_count(), 1);
        assert_eq!(cur.state().rpl[0][0], Some(r0.id()));

        dpb.unmark_reference_lists(&cur);
        assert_eq!(r0.flags(), PicFlags::empty());
        assert_eq!(r0.ref_count(), 0);
        assert!(cur.state().rpl[0][0].is_none());
    }

    #[test]
    fn missing_reference_is_synthesized() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dpb = dpb();
        let cur = dpb.init_current_pic(4).unwrap();
        let slice = SliceParams {
            slice_type: SliceType::P,
            rpl: [RefPicList::from_pocs(4, &[3], 1), RefPicList::default()],
            ..Default::default()
        };
        dpb.mark_ref_pic_lists(&slice, &cur);

        let id = cur.state().rpl[0][0].unwrap();
        let generated = dpb.get(id).unwrap();
        assert_eq!(generated.poc(), 3);
        assert_eq!(generated.flags(), PicFlags::SHORT_TERM);
        assert!(generated.progress().is_decoded(0, 0, 0));
        assert_eq!(dpb.num_used(), 2);
    }

    #[test]
    fn non_active_entries_are_flagged_only() {
        let dpb = dpb();
        let r0 = dpb.init_current_pic(0).unwrap();
        r0.release(PicFlags::IN_DECODING);
        let r1 = dpb.init_current_pic(1).unwrap();
        r1.release(PicFlags::IN_DECODING);
        let cur = dpb.init_current_pic(2).unwrap();

        let slice = SliceParams {
            slice_type: SliceType::P,
            rpl: [RefPicList::from_pocs(2, &[1, 0], 1), RefPicList::default()],
            ..Default::default()
        };
        dpb.mark_ref_pic_lists(&slice, &cur);

        assert_eq!(r1.ref_count(), 1);
        assert_eq!(r0.ref_count(), 0);
        assert_eq!(r0.flags(), PicFlags::SHORT_TERM);
        // Still flagged, so not reclaimed.
        assert!(r0.is_used());
    }
}
