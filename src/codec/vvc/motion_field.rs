// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-CTU neighbour motion buffers.
//!
//! Positions are expressed in 4x4 units relative to the CTU origin. The buffers carry a one-unit
//! border on the top and left sides (plus the above-right unit) holding the motion of the
//! neighbouring CTUs, so every spatial candidate of a block inside the CTU is addressable.
//!
//! Availability is tracked with two sets of bitfields:
//! - `hfield[y + 1]` bit `x + 1` is set when unit `(x, y)` carries motion for this list,
//! - `vfield[x + 1]` bit `y + 1` is set for the same unit.
//!
//! so `hfield[y]` describes the row above a block starting at row `y` and `vfield[x]` the column
//! on its left.

use crate::codec::vvc::mv::Mv;

/// Number of entries of a bitfield array, and stride of the motion buffer.
pub const FIELD_STRIDE: usize = 34;

const FIELD_ORIGIN: i32 = FIELD_STRIDE as i32 + 1;

/// Mask of `w` consecutive units starting at bit 0.
pub fn unit_mask(w: u32) -> u64 {
    if w >= 64 {
        u64::MAX
    } else {
        (1u64 << w) - 1
    }
}

/// Bit of a position in a bitfield whose bit 0 is the unit at index -1.
fn pos_mask(pos: i32, w: i32) -> u64 {
    1u64 << (pos + 1 + w)
}

/// Which spatial neighbours of a block carry motion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Neighbours {
    /// Below-left.
    pub a0: bool,
    /// Left.
    pub a1: bool,
    /// Above-right.
    pub b0: bool,
    /// Above.
    pub b1: bool,
    /// Above-left.
    pub b2: bool,
}

/// Motion of one reference list for the current CTU.
#[derive(Clone, Debug)]
pub struct MvField {
    pub hfield: [u64; FIELD_STRIDE],
    pub vfield: [u64; FIELD_STRIDE],
    mvs: Vec<Mv>,
}

impl Default for MvField {
    fn default() -> Self {
        Self {
            hfield: [0; FIELD_STRIDE],
            vfield: [0; FIELD_STRIDE],
            mvs: vec![Mv::default(); FIELD_STRIDE * FIELD_STRIDE],
        }
    }
}

impl MvField {
    /// Buffer index of unit `(x, y)`, both allowed to be -1.
    pub fn buf_pos(x: i32, y: i32) -> usize {
        (FIELD_ORIGIN + x + y * FIELD_STRIDE as i32) as usize
    }

    pub fn mv(&self, x: i32, y: i32) -> Mv {
        self.mvs[Self::buf_pos(x, y)]
    }

    pub fn set_mv(&mut self, x: i32, y: i32, mv: Mv) {
        self.mvs[Self::buf_pos(x, y)] = mv;
    }

    /// Whether unit `(x, y)` carries motion.
    pub fn is_available(&self, x: i32, y: i32) -> bool {
        self.hfield[(y + 1) as usize] & pos_mask(x, 0) != 0
    }

    /// Clears availability. Motion values are left as they are, they are only read behind a set
    /// availability bit.
    pub fn clear(&mut self) {
        self.hfield = [0; FIELD_STRIDE];
        self.vfield = [0; FIELD_STRIDE];
    }

    /// Marks the `w`x`h` units at `(x, y)` as carrying motion.
    pub fn set_rect(&mut self, x: i32, y: i32, w: i32, h: i32) {
        let row_mask = unit_mask(w as u32) << (x + 1);
        let col_mask = unit_mask(h as u32) << (y + 1);
        for j in 0..h {
            self.hfield[(y + j + 1) as usize] |= row_mask;
        }
        for i in 0..w {
            self.vfield[(x + i + 1) as usize] |= col_mask;
        }
    }

    /// Stores `mv` for the `w`x`h` units at `(x, y)`.
    pub fn fill(&mut self, mv: Mv, x: i32, y: i32, w: i32, h: i32) {
        self.set_rect(x, y, w, h);
        for j in 0..h {
            let start = Self::buf_pos(x, y + j);
            self.mvs[start..start + w as usize].fill(mv);
        }
    }

    pub fn neighbours(&self, x: i32, y: i32, w: i32, h: i32) -> Neighbours {
        let lft_col = self.vfield[x as usize];
        let abv_row = self.hfield[y as usize];

        Neighbours {
            a0: lft_col & pos_mask(y, h) != 0,
            a1: lft_col & pos_mask(y, h - 1) != 0,
            b0: abv_row & pos_mask(x, w) != 0,
            b1: abv_row & pos_mask(x, w - 1) != 0,
            b2: abv_row & pos_mask(x - 1, 0) != 0,
        }
    }

    /// A0, A1, B0, B1 and B2 positions of a block.
    pub fn a0_pos(x: i32, y: i32, _w: i32, h: i32) -> (i32, i32) {
        (x - 1, y + h)
    }

    pub fn a1_pos(x: i32, y: i32, _w: i32, h: i32) -> (i32, i32) {
        (x - 1, y + h - 1)
    }

    pub fn b0_pos(x: i32, y: i32, w: i32, _h: i32) -> (i32, i32) {
        (x + w, y - 1)
    }

    pub fn b1_pos(x: i32, y: i32, w: i32, _h: i32) -> (i32, i32) {
        (x + w - 1, y - 1)
    }

    pub fn b2_pos(x: i32, y: i32, _w: i32, _h: i32) -> (i32, i32) {
        (x - 1, y - 1)
    }
}

/// Motion carried between CTUs of a slice for one list: the bottom row of the previous CTU row
/// and the right column of the previous CTU.
#[derive(Clone, Debug, Default)]
pub struct MotionLineBuffer {
    above_avail: Vec<bool>,
    above_mvs: Vec<Mv>,
    current_avail: Vec<bool>,
    current_mvs: Vec<Mv>,
    left_avail: u64,
    left_mvs: Vec<Mv>,
}

impl MotionLineBuffer {
    /// Buffer for a picture `nb_units_w` 4x4 units wide.
    pub fn new(nb_units_w: usize) -> Self {
        Self {
            above_avail: vec![false; nb_units_w],
            above_mvs: vec![Mv::default(); nb_units_w],
            current_avail: vec![false; nb_units_w],
            current_mvs: vec![Mv::default(); nb_units_w],
            left_avail: 0,
            left_mvs: vec![Mv::default(); FIELD_STRIDE],
        }
    }

    /// Forgets the left CTU, at the start of a CTU row.
    pub fn start_row(&mut self) {
        self.left_avail = 0;
    }

    /// The row just decoded becomes the row above.
    pub fn end_row(&mut self) {
        std::mem::swap(&mut self.above_avail, &mut self.current_avail);
        std::mem::swap(&mut self.above_mvs, &mut self.current_mvs);
        self.current_avail.fill(false);
    }

    /// Prepares `field` for the CTU at column `ctb_x`.
    pub fn load_ctu(&self, field: &mut MvField, ctb_x: usize, nb_unit_ctb: usize) {
        field.clear();

        field.vfield[0] = self.left_avail;
        for y in 0..nb_unit_ctb {
            if self.left_avail & (1 << (y + 1)) != 0 {
                field.hfield[y + 1] |= 1;
                field.set_mv(-1, y as i32, self.left_mvs[y]);
            }
        }

        let base = (ctb_x * nb_unit_ctb) as i64;
        for i in -1..=(nb_unit_ctb as i64) {
            let col = base + i;
            if col < 0 || col as usize >= self.above_avail.len() {
                continue;
            }
            let col = col as usize;
            if self.above_avail[col] {
                field.hfield[0] |= 1 << (i + 1);
                field.set_mv(i as i32, -1, self.above_mvs[col]);
            }
        }
    }

    /// Saves the right column and bottom row of the CTU at column `ctb_x`.
    pub fn save_ctu(&mut self, field: &MvField, ctb_x: usize, nb_unit_ctb: usize) {
        let last = nb_unit_ctb as i32 - 1;

        self.left_avail = field.vfield[nb_unit_ctb] & (unit_mask(nb_unit_ctb as u32) << 1);
        for y in 0..nb_unit_ctb {
            self.left_mvs[y] = field.mv(last, y as i32);
        }

        let base = ctb_x * nb_unit_ctb;
        let bottom = field.hfield[nb_unit_ctb];
        for i in 0..nb_unit_ctb {
            let col = base + i;
            if col >= self.current_avail.len() {
                break;
            }
            self.current_avail[col] = bottom & (1 << (i + 1)) != 0;
            self.current_mvs[col] = field.mv(i as i32, last);
        }
    }
}
