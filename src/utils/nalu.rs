// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B byte stream splitting.

use anyhow::anyhow;
use anyhow::Result;
use bytes::Bytes;

use crate::codec::vvc::params::NalUnit;

fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
    data.get(offset..)?
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])
}

/// Iterator over the NAL units of an Annex B byte stream.
///
/// Units share the memory of the stream.
pub struct AnnexBReader {
    stream: Bytes,
    pos: usize,
}

impl AnnexBReader {
    pub fn new(stream: Bytes) -> Self {
        Self { stream, pos: 0 }
    }

    /// Find the next NAL unit. `Ok(None)` once the stream is exhausted.
    pub fn next_unit(&mut self) -> Result<Option<NalUnit>> {
        let data = self.stream.as_ref();
        let Some(sc) = find_start_code(data, self.pos) else {
            if data[self.pos.min(data.len())..].iter().any(|&b| b != 0) {
                return Err(anyhow!("data without a start code at offset {}", self.pos));
            }
            self.pos = data.len();
            return Ok(None);
        };

        // Skip the start code.
        let nalu_offset = self.pos + sc + 3;

        let mut end = match find_start_code(data, nalu_offset) {
            Some(next) => nalu_offset + next,
            // Whatever data is left must be part of the current unit.
            None => data.len(),
        };

        // Discard trailing_zero_8bits and the zero_byte of a four byte start code.
        while end > nalu_offset && data[end - 1] == 0x00 {
            end -= 1;
        }

        self.pos = end;
        NalUnit::new(self.stream.slice(nalu_offset..end)).map(Some)
    }
}

impl Iterator for AnnexBReader {
    type Item = Result<NalUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_unit().transpose()
    }
}

/// Splits a whole byte stream.
pub fn split_annex_b(stream: Bytes) -> Result<Vec<NalUnit>> {
    AnnexBReader::new(stream).collect()
}
