// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Motion vector values and the arithmetic shared by every prediction path.

use bitflags::bitflags;
use enumn::N;

use crate::utils::clip3;
use crate::utils::floor_log2;

const MV_BITS: u32 = 18;
pub const MV_MAX: i32 = (1 << (MV_BITS - 1)) - 1;
pub const MV_MIN: i32 = -(1 << (MV_BITS - 1));

const MV_MANTISSA_BITCOUNT: i32 = 6;
const MV_MANTISSA_UPPER_LIMIT: i32 = (1 << (MV_MANTISSA_BITCOUNT - 1)) - 1;
const MV_MANTISSA_LIMIT: i32 = 1 << (MV_MANTISSA_BITCOUNT - 1);

/// Motion vector resolution, as log2 of the number of steps per four luma samples.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MvPrecision {
    FourPel = 0,
    Int = 2,
    Half = 3,
    #[default]
    Quarter = 4,
    Sixteenth = 6,
}

impl MvPrecision {
    /// Resolution motion vectors are stored and predicted with.
    pub const INTERNAL: MvPrecision = MvPrecision::Sixteenth;

    fn shift_to(self, dst: MvPrecision) -> i32 {
        dst as i32 - self as i32
    }
}

bitflags! {
    /// Prediction lists used by a block.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InterDir: u8 {
        const L0 = 0x1;
        const L1 = 0x2;
        const BI = Self::L0.bits() | Self::L1.bits();
    }
}

impl InterDir {
    /// Direction of a block from its per-list availability.
    pub fn from_lists(l0: bool, l1: bool) -> Self {
        let mut dir = InterDir::empty();
        dir.set(InterDir::L0, l0);
        dir.set(InterDir::L1, l1);
        dir
    }

    pub fn list(idx: usize) -> Self {
        if idx == 0 {
            InterDir::L0
        } else {
            InterDir::L1
        }
    }
}

/// One motion vector together with the side information stored next to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mv {
    pub x: i32,
    pub y: i32,
    pub ref_idx: u8,
    /// Bi-prediction weight index plus one, 0 when not explicitly coded.
    pub bcw_idx_plus1: u8,
    /// Resolution of the MVD the vector was coded with. Governs the half-sample filter choice.
    pub prec: MvPrecision,
}

impl Mv {
    pub const fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            ref_idx: 0,
            bcw_idx_plus1: 0,
            prec: MvPrecision::Quarter,
        }
    }

    pub const fn with_ref(x: i32, y: i32, ref_idx: u8) -> Self {
        let mut mv = Self::new(x, y);
        mv.ref_idx = ref_idx;
        mv
    }

    /// Same displacement.
    pub fn same_vector(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }

    /// Same displacement and reference.
    pub fn same_motion(&self, other: &Self) -> bool {
        self.same_vector(other) && self.ref_idx == other.ref_idx
    }

    /// Drops the fields that candidates derived from stored motion never inherit.
    pub fn reset_side_info(mut self) -> Self {
        self.bcw_idx_plus1 = 0;
        self.prec = MvPrecision::default();
        self
    }

    pub fn add(mut self, delta: Mv) -> Self {
        self.x += delta.x;
        self.y += delta.y;
        self
    }

    /// Converts between resolutions, rounding half away from zero when reducing it.
    pub fn change_precision(mut self, src: MvPrecision, dst: MvPrecision) -> Self {
        let shift = src.shift_to(dst);
        if shift >= 0 {
            self.x <<= shift;
            self.y <<= shift;
        } else {
            let shift = -shift;
            let offset = 1 << (shift - 1);
            let round = |v: i32| {
                if v >= 0 {
                    (v + offset - 1) >> shift
                } else {
                    (v + offset) >> shift
                }
            };
            self.x = round(self.x);
            self.y = round(self.y);
        }
        self
    }

    /// Rounds the vector to the grid of `dst` while keeping it expressed in `src` units.
    pub fn round_to_precision(self, src: MvPrecision, dst: MvPrecision) -> Self {
        self.change_precision(src, dst).change_precision(dst, src)
    }

    /// Scales by a POC distance ratio in 1/256 units and clips to the MV range.
    pub fn scale(mut self, scale: i32) -> Self {
        let scale_component = |v: i32| {
            let s = scale * v;
            clip3(MV_MIN, MV_MAX, (s + 128 - i32::from(s >= 0)) >> 8)
        };
        self.x = scale_component(self.x);
        self.y = scale_component(self.y);
        self
    }

    /// Lossy mantissa/exponent round trip applied to temporal motion.
    pub fn compress(mut self) -> Self {
        self.x = round_mv_component(self.x);
        self.y = round_mv_component(self.y);
        self
    }
}

/// Compresses `val` to a 6-bit mantissa with exponent and back.
pub fn round_mv_component(val: i32) -> i32 {
    let sign = val >> 31;

    if (val ^ sign) - i32::from(sign != 0) <= 31 {
        return val;
    }

    let scale = floor_log2(((val ^ sign) | MV_MANTISSA_UPPER_LIMIT) as u32) as i32
        - (MV_MANTISSA_BITCOUNT - 1);
    let round = (1 << scale) >> 1;
    let n = (val + round) >> scale;
    let exponent = scale + ((n ^ sign) >> (MV_MANTISSA_BITCOUNT - 1));
    let mantissa = (n & MV_MANTISSA_UPPER_LIMIT) | (sign << (MV_MANTISSA_BITCOUNT - 1));
    (mantissa ^ MV_MANTISSA_LIMIT) << (exponent - i32::from(exponent != 0))
}

/// Distance ratio between the current and the collocated POC distances, in 1/256 units.
pub fn compute_scale(dist_current: i32, dist_col: i32) -> i32 {
    if dist_current == dist_col || dist_col == 0 {
        return 256;
    }

    let dist_current = clip3(-128, 127, dist_current);
    let dist_col = clip3(-128, 127, dist_col);

    let tx = (0x4000 + (dist_col >> 1).abs()) / dist_col;
    clip3(-4096, 4095, (dist_current * tx + 32) >> 6)
}

/// Motion of one block for both lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeInfo {
    pub inter_dir: InterDir,
    pub mv0: Mv,
    pub mv1: Mv,
}

impl MergeInfo {
    pub fn uni(list: usize, mv: Mv) -> Self {
        let mut info = Self {
            inter_dir: InterDir::list(list),
            ..Default::default()
        };
        *info.mv_mut(list) = mv;
        info
    }

    pub fn mv(&self, list: usize) -> &Mv {
        if list == 0 {
            &self.mv0
        } else {
            &self.mv1
        }
    }

    pub fn mv_mut(&mut self, list: usize) -> &mut Mv {
        if list == 0 {
            &mut self.mv0
        } else {
            &mut self.mv1
        }
    }

    /// Same direction and, for each used list, same vector and reference.
    pub fn same_motion(&self, other: &Self) -> bool {
        if self.inter_dir != other.inter_dir {
            return false;
        }

        (!self.inter_dir.contains(InterDir::L0) || self.mv0.same_motion(&other.mv0))
            && (!self.inter_dir.contains(InterDir::L1) || self.mv1.same_motion(&other.mv1))
    }

    pub fn reset_side_info(mut self) -> Self {
        self.mv0 = self.mv0.reset_side_info();
        self.mv1 = self.mv1.reset_side_info();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_conversion() {
        let mv = Mv::new(3, -3);
        let up = mv.change_precision(MvPrecision::Quarter, MvPrecision::INTERNAL);
        assert_eq!((up.x, up.y), (12, -12));

        // 1/16 to integer: 8/16 rounds to 0 (positive half is biased down), -8/16 rounds to -0.
        let mv = Mv::new(8, -8);
        let down = mv.change_precision(MvPrecision::INTERNAL, MvPrecision::Int);
        assert_eq!((down.x, down.y), (0, 0));

        let mv = Mv::new(9, -9);
        let down = mv.change_precision(MvPrecision::INTERNAL, MvPrecision::Int);
        assert_eq!((down.x, down.y), (1, -1));

        let mv = Mv::new(25, -25);
        let rounded = mv.round_to_precision(MvPrecision::INTERNAL, MvPrecision::Int);
        assert_eq!((rounded.x, rounded.y), (32, -32));
    }

    #[test]
    fn scale_identity() {
        for d in [-128, -3, -1, 1, 2, 64, 127] {
            assert_eq!(compute_scale(d, d), 256);
            assert_eq!(compute_scale(d, 0), 256);
        }
        let mv = Mv::new(100, -100);
        assert_eq!(mv.scale(256), mv);
    }

    #[test]
    fn scale_halves_and_mirrors() {
        // Half distance.
        assert_eq!(compute_scale(1, 2), 128);
        // Opposite direction.
        assert_eq!(compute_scale(-1, 1), -256);
        let mv = Mv::new(64, -64).scale(128);
        assert_eq!((mv.x, mv.y), (32, -32));
        let mv = Mv::new(64, -64).scale(-256);
        assert_eq!((mv.x, mv.y), (-64, 64));
    }

    #[test]
    fn scale_clips_to_mv_range() {
        let mv = Mv::new(MV_MAX, MV_MIN).scale(4095);
        assert_eq!((mv.x, mv.y), (MV_MAX, MV_MIN));
    }

    #[test]
    fn compression_keeps_small_values() {
        for v in -31..=31 {
            assert_eq!(round_mv_component(v), v);
        }
        // 6-bit mantissa: 33 is not representable with 5 magnitude bits above 32.
        assert_eq!(round_mv_component(32), 32);
        assert_eq!(round_mv_component(65), 66);
        assert_eq!(round_mv_component(1000), 1024);
        assert_eq!(round_mv_component(-1000), -1024);
    }

    #[test]
    fn merge_info_comparison() {
        let a = MergeInfo {
            inter_dir: InterDir::L0,
            mv0: Mv::with_ref(4, 4, 0),
            mv1: Mv::with_ref(7, 7, 1),
        };
        let mut b = a;
        b.mv1 = Mv::default();
        // Unused list is ignored.
        assert!(a.same_motion(&b));
        b.inter_dir = InterDir::BI;
        assert!(!a.same_motion(&b));
        assert_eq!(InterDir::from_lists(true, true), InterDir::BI);
    }
}
