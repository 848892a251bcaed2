// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bin source of the syntax parser.
//!
//! The arithmetic decoding engine and its context tables live outside of this crate. The parser
//! only names the context a bin is coded with, as a syntax element and an increment.

use std::collections::VecDeque;

/// Syntax elements coded with context models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyntaxElement {
    SplitCuFlag,
    SplitQtFlag,
    MttSplitCuVerticalFlag,
    MttSplitCuBinaryFlag,
    CuSkipFlag,
    PredModeFlag,
    GeneralMergeFlag,
    MergeSubblockFlag,
    MergeSubblockIdx,
    RegularMergeFlag,
    MmvdMergeFlag,
    MmvdCandFlag,
    MmvdDistanceIdx,
    CiipFlag,
    MergeIdx,
    InterPredIdc,
    InterAffineFlag,
    CuAffineTypeFlag,
    SymMvdFlag,
    RefIdx,
    MvpFlag,
    AbsMvdGreater0Flag,
    AbsMvdGreater1Flag,
    AmvrFlag,
    AmvrPrecisionIdx,
    BcwIdx,
    CuCodedFlag,
    TuYCodedFlag,
    TuCbCodedFlag,
    TuCrCodedFlag,
    CuQpDeltaAbs,
    IntraMipFlag,
    IntraLumaRefIdx,
    IntraSubpartitionsModeFlag,
    IntraSubpartitionsSplitFlag,
    IntraLumaMpmFlag,
    IntraLumaNotPlanarFlag,
    CclmModeFlag,
    CclmModeIdx,
    IntraChromaPredMode,
}

/// Context of a bin: the element it belongs to and the increment selecting the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId {
    pub elem: SyntaxElement,
    pub inc: u8,
}

impl ContextId {
    pub const fn new(elem: SyntaxElement, inc: u8) -> Self {
        Self { elem, inc }
    }
}

impl From<SyntaxElement> for ContextId {
    fn from(elem: SyntaxElement) -> Self {
        Self::new(elem, 0)
    }
}

/// Source of decoded bins.
pub trait EntropyDecoder {
    /// Decodes a bin with the context model `ctx`.
    fn read_bin(&mut self, ctx: ContextId) -> bool;

    /// Decodes an equiprobable bin.
    fn read_bypass(&mut self) -> bool;

    /// Truncated unary value of at most `max`, in bypass bins.
    fn read_truncated(&mut self, max: u32) -> u32 {
        let mut val = 0;
        while val < max && self.read_bypass() {
            val += 1;
        }
        val
    }

    /// `n` bypass bins, most significant first.
    fn read_bypass_bits(&mut self, n: u32) -> u32 {
        (0..n).fold(0, |acc, _| (acc << 1) | u32::from(self.read_bypass()))
    }

    /// Exp-Golomb value of order `k`, in bypass bins.
    fn read_exp_golomb(&mut self, mut k: u32) -> u32 {
        let mut val = 0u32;
        while k < 31 && self.read_bypass() {
            val += 1 << k;
            k += 1;
        }
        val + self.read_bypass_bits(k)
    }

    /// Truncated binary value in `0..=max`, in bypass bins.
    fn read_truncated_binary(&mut self, max: u32) -> u32 {
        let n = max + 1;
        let k = 31 - n.leading_zeros();
        let u = (1 << (k + 1)) - n;
        let val = self.read_bypass_bits(k);
        if val < u {
            val
        } else {
            ((val << 1) | u32::from(self.read_bypass())) - u
        }
    }
}

impl<T: EntropyDecoder + ?Sized> EntropyDecoder for Box<T> {
    fn read_bin(&mut self, ctx: ContextId) -> bool {
        (**self).read_bin(ctx)
    }

    fn read_bypass(&mut self) -> bool {
        (**self).read_bypass()
    }
}

/// Bins replayed from a script, for driving the parser without an arithmetic decoder.
///
/// Reads past the end of the script return 0. Every read is logged with its context, `None`
/// for bypass bins.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBins {
    bins: VecDeque<bool>,
    log: Vec<Option<ContextId>>,
}

impl ScriptedBins {
    pub fn new(bins: impl IntoIterator<Item = bool>) -> Self {
        Self {
            bins: bins.into_iter().collect(),
            log: vec![],
        }
    }

    /// Script from a string of `0` and `1`. Other characters are ignored so that bins can be
    /// grouped with spaces.
    pub fn from_bits(bits: &str) -> Self {
        Self::new(bits.chars().filter_map(|c| match c {
            '0' => Some(false),
            '1' => Some(true),
            _ => None,
        }))
    }

    pub fn push(&mut self, bin: bool) {
        self.bins.push_back(bin);
    }

    pub fn remaining(&self) -> usize {
        self.bins.len()
    }

    /// Contexts of the bins read so far.
    pub fn log(&self) -> &[Option<ContextId>] {
        &self.log
    }

    fn next(&mut self, ctx: Option<ContextId>) -> bool {
        self.log.push(ctx);
        self.bins.pop_front().unwrap_or_else(|| {
            log::trace!("Bin script exhausted");
            false
        })
    }
}

impl EntropyDecoder for ScriptedBins {
    fn read_bin(&mut self, ctx: ContextId) -> bool {
        self.next(Some(ctx))
    }

    fn read_bypass(&mut self) -> bool {
        self.next(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_unary() {
        let mut ed = ScriptedBins::from_bits("110 1111");
        assert_eq!(ed.read_truncated(4), 2);
        // The terminating 0 is omitted at the maximum.
        assert_eq!(ed.read_truncated(4), 4);
        assert_eq!(ed.remaining(), 0);
    }

    #[test]
    fn exp_golomb() {
        // k = 1: prefix 10, suffix over 2 bits.
        let mut ed = ScriptedBins::from_bits("10 11");
        assert_eq!(ed.read_exp_golomb(1), 2 + 3);

        let mut ed = ScriptedBins::from_bits("0 1");
        assert_eq!(ed.read_exp_golomb(1), 1);

        let mut ed = ScriptedBins::from_bits("0");
        assert_eq!(ed.read_exp_golomb(0), 0);
    }

    #[test]
    fn truncated_binary() {
        // 61 symbols: 5 bits for the first three values, 6 bits for the others.
        let mut ed = ScriptedBins::from_bits("00010");
        assert_eq!(ed.read_truncated_binary(60), 2);
        let mut ed = ScriptedBins::from_bits("000110");
        assert_eq!(ed.read_truncated_binary(60), 3);
        let mut ed = ScriptedBins::from_bits("111111");
        assert_eq!(ed.read_truncated_binary(60), 60);

        // Powers of two are plain fixed length.
        let mut ed = ScriptedBins::from_bits("101");
        assert_eq!(ed.read_truncated_binary(7), 5);
    }

    #[test]
    fn script_logs_contexts() {
        let mut ed = ScriptedBins::from_bits("1");
        let ctx = ContextId::new(SyntaxElement::CuSkipFlag, 2);
        assert!(ed.read_bin(ctx));
        assert!(!ed.read_bypass());
        assert_eq!(ed.log(), &[Some(ctx), None]);

        let mut boxed: Box<dyn EntropyDecoder> = Box::new(ScriptedBins::from_bits("01"));
        assert_eq!(boxed.read_bypass_bits(2), 1);
    }
}
