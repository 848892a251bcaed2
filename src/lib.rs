// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconstruction core of a VVC/H.266 decoder.
//!
//! The crate keeps the temporal state of a decoding session: the decoded picture buffer and its
//! reference/output bookkeeping, the motion vector prediction engine and the coding-unit syntax
//! state machine that drives it. Entropy decoding, parameter-set parsing and pixel-domain
//! operations are consumed through the traits in [`codec::vvc::entropy`],
//! [`decoder::vvc::HeaderParser`] and [`codec::vvc::recon`].

pub mod codec;
pub mod decoder;
pub mod utils;
pub mod video_frame;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Number of `1 << log2_size` blocks needed to cover each dimension.
    pub fn blocks(&self, log2_size: u8) -> (u32, u32) {
        let round = (1u32 << log2_size) - 1;
        (
            (self.width + round) >> log2_size,
            (self.height + round) >> log2_size,
        )
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_blocks_round_up() {
        let res = Resolution::from((1920, 1080));
        assert_eq!(res.blocks(7), (15, 9));
        assert_eq!(res.blocks(6), (30, 17));
        assert!(res.can_contain(Resolution::from((1280, 720))));
        assert!(!res.can_contain(Resolution::from((1280, 1440))));
    }
}
