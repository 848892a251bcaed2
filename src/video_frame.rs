// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::Resolution;

pub mod frame_pool;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

/// Chroma sampling of a decoded picture, from `sps_chroma_format_idc`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    pub fn num_planes(&self) -> usize {
        match self {
            ChromaFormat::Monochrome => 1,
            _ => 3,
        }
    }

    pub fn horizontal_subsampling(&self, plane_idx: usize) -> usize {
        match self {
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422 if plane_idx != Y_PLANE => 2,
            _ => 1,
        }
    }

    pub fn vertical_subsampling(&self, plane_idx: usize) -> usize {
        match self {
            ChromaFormat::Yuv420 if plane_idx != Y_PLANE => 2,
            _ => 1,
        }
    }
}

/// Parameters a frame allocator needs to produce frames for a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub resolution: Resolution,
    pub chroma_format: ChromaFormat,
    pub bit_depth: u8,
    /// Number of frames the pool is filled with.
    pub min_num_frames: usize,
}

// Abstraction over frame storage handed out by the decoder.
pub trait VideoFrame: Send + Sync + Sized + Debug + 'static {
    // Outputs visible resolution. Use pitch and plane size for coded resolution calculations.
    fn resolution(&self) -> Resolution;

    fn chroma_format(&self) -> ChromaFormat;

    fn bit_depth(&self) -> u8;

    fn num_planes(&self) -> usize {
        self.chroma_format().num_planes()
    }

    // Pitch of each plane, in samples.
    fn get_plane_pitch(&self) -> Vec<usize>;

    // Size of each plane, in samples.
    fn get_plane_size(&self) -> Vec<usize>;
}

/// Frame with one sample buffer per plane, each behind its own lock so that reference reads
/// and reconstruction writes of different pictures never contend.
#[derive(Debug)]
pub struct PlanarFrame {
    resolution: Resolution,
    chroma_format: ChromaFormat,
    bit_depth: u8,
    pitches: Vec<usize>,
    planes: Vec<RwLock<Vec<u16>>>,
}

impl PlanarFrame {
    pub fn new(info: &FrameInfo) -> Self {
        let format = info.chroma_format;
        let mut pitches = vec![];
        let mut planes = vec![];
        for plane_idx in 0..format.num_planes() {
            let hs = format.horizontal_subsampling(plane_idx);
            let vs = format.vertical_subsampling(plane_idx);
            let pitch = (info.resolution.width as usize).div_ceil(hs);
            let height = (info.resolution.height as usize).div_ceil(vs);
            pitches.push(pitch);
            planes.push(RwLock::new(vec![0u16; pitch * height]));
        }

        Self {
            resolution: info.resolution,
            chroma_format: format,
            bit_depth: info.bit_depth,
            pitches,
            planes,
        }
    }

    /// Read access to plane `plane_idx`.
    ///
    /// Panics if `plane_idx` is out of range for the chroma format.
    pub fn read_plane(&self, plane_idx: usize) -> RwLockReadGuard<'_, Vec<u16>> {
        self.planes[plane_idx]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to plane `plane_idx`.
    ///
    /// Panics if `plane_idx` is out of range for the chroma format.
    pub fn write_plane(&self, plane_idx: usize) -> RwLockWriteGuard<'_, Vec<u16>> {
        self.planes[plane_idx]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl VideoFrame for PlanarFrame {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn chroma_format(&self) -> ChromaFormat {
        self.chroma_format
    }

    fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    fn get_plane_pitch(&self) -> Vec<usize> {
        self.pitches.clone()
    }

    fn get_plane_size(&self) -> Vec<usize> {
        self.planes
            .iter()
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).len())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_frame_layout() {
        let frame = PlanarFrame::new(&FrameInfo {
            resolution: Resolution::from((33, 17)),
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: 10,
            min_num_frames: 1,
        });

        assert_eq!(frame.num_planes(), 3);
        assert_eq!(frame.get_plane_pitch(), vec![33, 17, 17]);
        assert_eq!(frame.get_plane_size(), vec![33 * 17, 17 * 9, 17 * 9]);

        frame.write_plane(Y_PLANE)[0] = 512;
        assert_eq!(frame.read_plane(Y_PLANE)[0], 512);
    }

    #[test]
    fn monochrome_has_one_plane() {
        let frame = PlanarFrame::new(&FrameInfo {
            resolution: Resolution::from((16, 16)),
            chroma_format: ChromaFormat::Monochrome,
            bit_depth: 8,
            min_num_frames: 1,
        });
        assert_eq!(frame.num_planes(), 1);
        assert_eq!(ChromaFormat::Yuv422.vertical_subsampling(U_PLANE), 1);
        assert_eq!(ChromaFormat::Yuv422.horizontal_subsampling(V_PLANE), 2);
    }
}
