// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-picture record of decoded CTUs, used to let inter prediction of one picture start before
//! its references are fully reconstructed.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::utils::lock;

const LOG2_WORD_BITS: u32 = 6;
const WORD_BITS: u32 = 1 << LOG2_WORD_BITS;

/// How readers of a picture wait for its CTUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Readers block until the requested CTUs are reported.
    #[default]
    Blocking,
    /// Every CTU is known to be decoded, readers never wait.
    AlreadyComplete,
}

#[derive(Debug, Default)]
struct DecodedMask {
    /// One row of 64-bit words per CTU row.
    rows: Vec<Vec<u64>>,
    words_per_row: usize,
    strategy: SyncStrategy,
}

impl DecodedMask {
    fn covers(&self, y_min: u32, y_max: u32, wanted: &[u64]) -> bool {
        (y_min..=y_max).all(|y| {
            self.rows
                .get(y as usize)
                .map(|row| row.iter().zip(wanted).all(|(have, want)| have & want == *want))
                .unwrap_or(true)
        })
    }
}

/// Bitmap of decoded CTUs, one bit per CTU, guarded by a mutex and a condition variable.
///
/// Bits only go from 0 to 1 between a `reset` and the next one.
#[derive(Debug, Default)]
pub struct CtuProgress {
    mask: Mutex<DecodedMask>,
    cond: Condvar,
}

/// Builds the mask words covering CTU columns `x_min..=x_max`. Words outside the range are 0.
pub fn xctu_to_mask(words_per_row: usize, x_min: u32, x_max: u32) -> Vec<u64> {
    let mut mask = vec![0u64; words_per_row];
    let first = (x_min >> LOG2_WORD_BITS) as usize;
    let last = ((x_max >> LOG2_WORD_BITS) as usize).min(words_per_row.saturating_sub(1));

    for (i, word) in mask.iter_mut().enumerate().take(last + 1).skip(first) {
        let word_start = (i as u32) << LOG2_WORD_BITS;
        let lo = if x_min > word_start { x_min % WORD_BITS } else { 0 };
        let hi = if x_max < word_start + WORD_BITS {
            x_max % WORD_BITS
        } else {
            WORD_BITS - 1
        };
        for bit in lo..=hi {
            *word |= 1u64 << bit;
        }
    }

    mask
}

impl CtuProgress {
    pub fn new(nb_ctb_w: u32, nb_ctb_h: u32) -> Self {
        let progress = Self::default();
        progress.resize(nb_ctb_w, nb_ctb_h);
        progress
    }

    /// Resizes the bitmap for a new picture geometry. All bits are cleared.
    pub fn resize(&self, nb_ctb_w: u32, nb_ctb_h: u32) {
        let mut mask = lock(&self.mask);
        mask.words_per_row = ((nb_ctb_w >> LOG2_WORD_BITS) + 1) as usize;
        mask.rows = vec![vec![0; mask.words_per_row]; nb_ctb_h as usize];
        mask.strategy = SyncStrategy::Blocking;
    }

    pub fn strategy(&self) -> SyncStrategy {
        lock(&self.mask).strategy
    }

    /// Marks CTUs `x_min..=x_max` of CTU row `y` as decoded and wakes up waiters.
    pub fn report_line(&self, y: u32, x_min: u32, x_max: u32) {
        let mut mask = lock(&self.mask);
        let bits = xctu_to_mask(mask.words_per_row, x_min, x_max);
        if let Some(row) = mask.rows.get_mut(y as usize) {
            for (word, bits) in row.iter_mut().zip(bits) {
                *word |= bits;
            }
        }
        self.cond.notify_all();
    }

    /// Marks the whole picture as decoded. Later waits return immediately.
    pub fn report_frame(&self) {
        let mut mask = lock(&self.mask);
        for row in mask.rows.iter_mut() {
            row.fill(u64::MAX);
        }
        mask.strategy = SyncStrategy::AlreadyComplete;
        self.cond.notify_all();
    }

    /// Clears every bit before the slot is reused for a new picture.
    pub fn reset(&self) {
        let mut mask = lock(&self.mask);
        for row in mask.rows.iter_mut() {
            row.fill(0);
        }
        mask.strategy = SyncStrategy::Blocking;
    }

    /// Blocks until every CTU of the rectangle `tl..=br` (in CTU coordinates) is decoded.
    pub fn wait_for_region(&self, tl: (u32, u32), br: (u32, u32)) {
        let mut mask: MutexGuard<'_, DecodedMask> = lock(&self.mask);
        if mask.strategy == SyncStrategy::AlreadyComplete {
            return;
        }

        let wanted = xctu_to_mask(mask.words_per_row, tl.0, br.0);
        while mask.strategy == SyncStrategy::Blocking && !mask.covers(tl.1, br.1, &wanted) {
            mask = self
                .cond
                .wait(mask)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits for the CTUs a temporal candidate of CTU `(ctb_x, ctb_y)` can read: the collocated
    /// CTU, its right neighbour and the row below.
    pub fn wait_for_collocated(&self, ctb_x: u32, ctb_y: u32, nb_ctb_w: u32, nb_ctb_h: u32) {
        let br_x = (ctb_x + 1).min(nb_ctb_w.saturating_sub(1));
        let br_y = (ctb_y + 1).min(nb_ctb_h.saturating_sub(1));
        self.wait_for_region((ctb_x, ctb_y), (br_x, br_y));
    }

    /// Whether every CTU of row `y` in `x_min..=x_max` has been reported.
    pub fn is_decoded(&self, y: u32, x_min: u32, x_max: u32) -> bool {
        let mask = lock(&self.mask);
        let wanted = xctu_to_mask(mask.words_per_row, x_min, x_max);
        mask.strategy == SyncStrategy::AlreadyComplete || mask.covers(y, y, &wanted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn mask_spans_words() {
        assert_eq!(xctu_to_mask(2, 0, 2), vec![0b111, 0]);
        assert_eq!(xctu_to_mask(2, 62, 65), vec![0b11 << 62, 0b11]);
        assert_eq!(xctu_to_mask(2, 64, 64), vec![0, 1]);
        assert_eq!(xctu_to_mask(1, 0, 63), vec![u64::MAX]);
    }

    #[test]
    fn report_and_query() {
        let progress = CtuProgress::new(10, 4);
        assert!(!progress.is_decoded(0, 0, 3));
        progress.report_line(0, 0, 3);
        assert!(progress.is_decoded(0, 0, 3));
        assert!(!progress.is_decoded(0, 0, 4));

        progress.report_frame();
        assert_eq!(progress.strategy(), SyncStrategy::AlreadyComplete);
        assert!(progress.is_decoded(3, 0, 9));

        progress.reset();
        assert_eq!(progress.strategy(), SyncStrategy::Blocking);
        assert!(!progress.is_decoded(0, 0, 0));
    }

    #[test]
    fn wait_returns_once_region_is_decoded() {
        let progress = Arc::new(CtuProgress::new(4, 4));

        let writers: Vec<_> = (0..4u32)
            .map(|y| {
                let progress = Arc::clone(&progress);
                thread::spawn(move || {
                    for x in 0..4 {
                        progress.report_line(y, x, x);
                    }
                })
            })
            .collect();

        progress.wait_for_region((1, 1), (3, 3));
        for y in 1..4 {
            assert!(progress.is_decoded(y, 1, 3));
        }

        for w in writers {
            w.join().unwrap();
        }
    }

    #[test]
    fn collocated_wait_clamps_to_picture() {
        let progress = CtuProgress::new(2, 2);
        progress.report_line(1, 1, 1);
        // Bottom-right CTU only needs itself.
        progress.wait_for_collocated(1, 1, 2, 2);
    }

    #[test]
    fn report_frame_unblocks_waiters() {
        let progress = Arc::new(CtuProgress::new(3, 3));
        let waiter = {
            let progress = Arc::clone(&progress);
            thread::spawn(move || progress.wait_for_region((0, 0), (2, 2)))
        };
        progress.report_frame();
        waiter.join().unwrap();
    }
}
