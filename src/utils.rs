// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

pub mod dummy;
pub mod nalu;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Clips `z` to the inclusive range `[x, y]`.
pub fn clip3(x: i32, y: i32, z: i32) -> i32 {
    if z < x {
        x
    } else if z > y {
        y
    } else {
        z
    }
}

/// Position of the most significant set bit of `v`, or 0 if `v` is 0.
pub fn floor_log2(v: u32) -> u32 {
    31 - (v | 1).leading_zeros()
}

/// Locks `mutex`, carrying on with the inner data if a previous holder panicked.
///
/// Every structure guarded this way is left consistent between statements, so the state seen
/// after a poisoning is as valid as the state seen before it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip3_bounds() {
        assert_eq!(clip3(-128, 127, 300), 127);
        assert_eq!(clip3(-128, 127, -300), -128);
        assert_eq!(clip3(-128, 127, 5), 5);
    }

    #[test]
    fn floor_log2_values() {
        assert_eq!(floor_log2(0), 0);
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(31), 4);
        assert_eq!(floor_log2(32), 5);
        assert_eq!(floor_log2(u32::MAX), 31);
    }
}
