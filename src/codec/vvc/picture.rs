// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bitflags::bitflags;

use crate::codec::vvc::progress::CtuProgress;
use crate::codec::vvc::tmvp::MvPlane;
use crate::codec::vvc::tmvp::TmvpInfo;
use crate::codec::vvc::MAX_NUM_REF;
use crate::utils::lock;
use crate::video_frame::frame_pool::Pooled;
use crate::video_frame::frame_pool::PooledVideoFrame;
use crate::video_frame::PlanarFrame;

/// Index of a picture slot in the DPB arena.
pub type PicId = usize;

/// Frame buffer owned by a picture. Shared with the client once the picture is output.
pub type PictureFrame = Arc<PooledVideoFrame<PlanarFrame>>;

bitflags! {
    /// Reasons for a picture to stay in the DPB.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PicFlags: u8 {
        const SHORT_TERM = 0x01;
        const LONG_TERM = 0x02;
        const OUTPUT = 0x04;
        const BUMPED = 0x08;
        const IN_DECODING = 0x10;

        const REFERENCE = Self::SHORT_TERM.bits() | Self::LONG_TERM.bits();
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

impl PicFlags {
    /// Replaces the reference marking. A picture is never both short and long term.
    pub fn set_reference(&mut self, reference: Reference) {
        self.remove(PicFlags::REFERENCE);
        match reference {
            Reference::None => (),
            Reference::ShortTerm => self.insert(PicFlags::SHORT_TERM),
            Reference::LongTerm => self.insert(PicFlags::LONG_TERM),
        }
    }

    pub fn reference(&self) -> Reference {
        if self.contains(PicFlags::SHORT_TERM) {
            Reference::ShortTerm
        } else if self.contains(PicFlags::LONG_TERM) {
            Reference::LongTerm
        } else {
            Reference::None
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RefType {
    #[default]
    ShortTerm,
    LongTerm,
    InterLayer,
}

impl RefType {
    /// Marking applied to a picture referenced through an entry of this type.
    pub fn flag(&self) -> PicFlags {
        match self {
            RefType::ShortTerm => PicFlags::SHORT_TERM,
            RefType::LongTerm | RefType::InterLayer => PicFlags::LONG_TERM,
        }
    }
}

/// A resolved reference list entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefInfo {
    pub poc: i32,
    pub type_: RefType,
}

/// Reference list of a picture, resolved once at picture init.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RplInfo {
    pub refs: [RefInfo; MAX_NUM_REF],
    pub nb_refs: usize,
}

impl RplInfo {
    pub fn as_slice(&self) -> &[RefInfo] {
        &self.refs[..self.nb_refs.min(MAX_NUM_REF)]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RefInfo> {
        self.as_slice().iter()
    }

    pub fn get(&self, idx: usize) -> Option<&RefInfo> {
        self.as_slice().get(idx)
    }
}

/// Mutable part of a picture slot.
#[derive(Debug, Default)]
pub struct PictureState {
    pub flags: PicFlags,
    pub poc: i32,
    pub cvs_id: u8,
    pub frame: Option<PictureFrame>,
    pub rpl_info: [RplInfo; 2],
    /// Slots referenced by the active entries of each list.
    pub rpl: [[Option<PicId>; MAX_NUM_REF]; 2],
    pub tmvp: TmvpInfo,
    pub mv_planes: [Option<Pooled<MvPlane>>; 2],
}

impl PictureState {
    pub fn is_used(&self) -> bool {
        self.frame.is_some()
    }
}

/// Point-in-time view of a slot, used by the eviction and output selection functions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicMeta {
    pub id: PicId,
    pub used: bool,
    pub poc: i32,
    pub cvs_id: u8,
    pub flags: PicFlags,
    pub ref_count: u32,
}

/// One slot of the DPB arena.
#[derive(Debug)]
pub struct Picture {
    id: PicId,
    ref_count: AtomicU32,
    state: Mutex<PictureState>,
    progress: CtuProgress,
}

impl Picture {
    pub fn new(id: PicId) -> Self {
        Self {
            id,
            ref_count: AtomicU32::new(0),
            state: Mutex::new(Default::default()),
            progress: Default::default(),
        }
    }

    pub fn id(&self) -> PicId {
        self.id
    }

    pub fn state(&self) -> MutexGuard<'_, PictureState> {
        lock(&self.state)
    }

    pub fn progress(&self) -> &CtuProgress {
        &self.progress
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn poc(&self) -> i32 {
        self.state().poc
    }

    pub fn flags(&self) -> PicFlags {
        self.state().flags
    }

    pub fn is_used(&self) -> bool {
        self.state().is_used()
    }

    pub fn frame(&self) -> Option<PictureFrame> {
        self.state().frame.clone()
    }

    pub fn meta(&self) -> PicMeta {
        let state = self.state();
        PicMeta {
            id: self.id,
            used: state.is_used(),
            poc: state.poc,
            cvs_id: state.cvs_id,
            flags: state.flags,
            ref_count: self.ref_count(),
        }
    }

    /// Takes a reference for `mask`.
    pub fn add_ref(&self, mask: PicFlags) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.state().flags |= mask;
    }

    /// Drops a reference taken with [`Picture::add_ref`] and clears `mask`. No-op on a free slot.
    pub fn release(&self, mask: PicFlags) {
        {
            let mut state = self.state();
            if !state.is_used() {
                return;
            }
            state.flags.remove(mask);
        }

        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if previous.is_err() {
            log::warn!("Released picture slot {} with no reference held", self.id);
        }
    }

    /// Frees the frame and motion planes once the slot carries no flag and no reference.
    /// Returns whether the slot is free afterwards.
    pub fn try_reclaim(&self) -> bool {
        let mut state = self.state();
        if !state.is_used() {
            return true;
        }

        if !state.flags.is_empty() || self.ref_count() != 0 {
            return false;
        }

        log::trace!("Release picture with POC {}", state.poc);
        state.frame = None;
        state.mv_planes = [None, None];
        for info in state.rpl_info.iter_mut() {
            info.nb_refs = 0;
        }
        state.rpl = Default::default();
        state.tmvp = Default::default();
        true
    }

    /// Clears flags and reference count unconditionally.
    pub fn reset_refs(&self) {
        let mut state = self.state();
        state.flags = PicFlags::empty();
        self.ref_count.store(0, Ordering::Release);
    }

    /// Hands the slot a fresh frame and clears its references.
    pub(crate) fn claim(&self, frame: PictureFrame) {
        let mut state = self.state();
        state.frame = Some(frame);
        state.flags = PicFlags::empty();
        self.ref_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::video_frame::frame_pool::FramePool;
    use crate::video_frame::FrameInfo;
    use crate::Resolution;

    fn pool() -> FramePool<PlanarFrame> {
        let mut pool = FramePool::new(PlanarFrame::new);
        pool.resize(&FrameInfo {
            resolution: Resolution::from((16, 16)),
            bit_depth: 8,
            min_num_frames: 2,
            ..Default::default()
        });
        pool
    }

    fn claimed(pool: &FramePool<PlanarFrame>) -> Picture {
        let pic = Picture::new(0);
        pic.claim(Arc::new(pool.alloc().unwrap()));
        pic
    }

    #[test]
    fn reference_setter_is_exclusive() {
        let mut flags = PicFlags::OUTPUT;
        flags.set_reference(Reference::ShortTerm);
        assert_eq!(flags.reference(), Reference::ShortTerm);
        flags.set_reference(Reference::LongTerm);
        assert!(!flags.contains(PicFlags::SHORT_TERM));
        assert!(flags.contains(PicFlags::OUTPUT | PicFlags::LONG_TERM));
        flags.set_reference(Reference::None);
        assert_eq!(flags, PicFlags::OUTPUT);
    }

    #[test]
    fn reclaim_waits_for_flags_and_refs() {
        let pool = pool();
        let pic = claimed(&pool);

        pic.add_ref(PicFlags::OUTPUT);
        pic.add_ref(PicFlags::SHORT_TERM);
        assert!(!pic.try_reclaim());

        pic.release(PicFlags::OUTPUT);
        assert!(!pic.try_reclaim());
        assert_eq!(pic.ref_count(), 1);

        pic.release(PicFlags::SHORT_TERM);
        assert!(pic.try_reclaim());
        assert!(!pic.is_used());
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn release_on_free_slot_is_noop() {
        let pic = Picture::new(3);
        pic.release(PicFlags::all());
        assert_eq!(pic.ref_count(), 0);
        assert!(pic.try_reclaim());
    }

    #[test]
    fn flags_without_refs_still_pin_the_slot() {
        let pool = pool();
        let pic = claimed(&pool);
        pic.state().flags.insert(PicFlags::LONG_TERM);
        assert!(!pic.try_reclaim());
        pic.reset_refs();
        assert!(pic.try_reclaim());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8),
        Release(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..5).prop_map(Op::Add),
            (0u8..5).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn slot_is_freed_only_when_unreferenced(ops in prop::collection::vec(op(), 0..40)) {
            let pool = pool();
            let pic = claimed(&pool);
            let mut held: Vec<PicFlags> = vec![];

            for op in ops {
                match op {
                    Op::Add(bit) => {
                        let flag = PicFlags::from_bits_truncate(1 << bit);
                        pic.add_ref(flag);
                        held.push(flag);
                    }
                    Op::Release(bit) => {
                        let flag = PicFlags::from_bits_truncate(1 << bit);
                        if let Some(pos) = held.iter().position(|f| *f == flag) {
                            held.remove(pos);
                            pic.release(flag);
                        }
                    }
                }

                let flags = pic.flags();
                let reclaimable = flags.is_empty() && pic.ref_count() == 0;
                prop_assert_eq!(pic.ref_count() as usize, held.len());
                if !reclaimable {
                    prop_assert!(!pic.try_reclaim());
                    prop_assert!(pic.is_used());
                }
            }
        }
    }
}
