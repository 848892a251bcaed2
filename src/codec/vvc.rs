// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VVC/H.266 reconstruction state: picture buffer, motion prediction and coding-unit parsing.

pub mod affine;
pub mod coding_tree;
pub mod coding_unit;
pub mod dbf;
pub mod dpb;
pub mod entropy;
pub mod gpm;
pub mod hmvp;
pub mod mmvd;
pub mod motion_field;
pub mod mv;
pub mod mvp;
pub mod output;
pub mod params;
pub mod picture;
pub mod progress;
pub mod recon;
pub mod rpl;
pub mod slice;
pub mod tmvp;

/// Maximum number of entries of a reference picture list.
pub const MAX_NUM_REF: usize = 16;

/// Number of picture slots of the DPB arena, the current picture included.
pub const DPB_CAPACITY: usize = MAX_NUM_REF + 1;

/// Log2 of the motion storage granularity in luma samples.
pub const LOG2_MIN_CU_S: u8 = 2;

/// Log2 of the largest CTU the motion buffers are sized for.
pub const LOG2_MAX_CTB_S: u8 = 7;
