// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deblocking side information produced while deriving motion.
//!
//! Edges are stored per CTU with the same one-unit border convention as the motion field:
//! `hor[y]` bit `x + 1` is the edge above 4x4 unit `(x, y)`, `ver[x]` bit `y + 1` the edge on
//! its left. Applying the filter is left to the [`crate::codec::vvc::recon::Reconstructor`].

use crate::codec::vvc::motion_field::unit_mask;
use crate::codec::vvc::motion_field::MvField;
use crate::codec::vvc::motion_field::FIELD_STRIDE;
use crate::codec::vvc::mv::Mv;
use crate::codec::vvc::MAX_NUM_REF;

/// Half a luma sample in internal MV precision.
const LF_MV_THRESHOLD: i32 = 8;

/// POC distances of the references of each list, used to tell whether two vectors point at the
/// same picture.
pub type RefDistances = [[i32; MAX_NUM_REF]; 2];

/// Edges of one boundary strength.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeMap {
    pub hor: [u64; FIELD_STRIDE],
    pub ver: [u64; FIELD_STRIDE],
}

impl Default for EdgeMap {
    fn default() -> Self {
        Self {
            hor: [0; FIELD_STRIDE],
            ver: [0; FIELD_STRIDE],
        }
    }
}

impl EdgeMap {
    pub fn clear(&mut self) {
        self.hor.fill(0);
        self.ver.fill(0);
    }

    /// Edge above unit `(x, y)`.
    pub fn above(&self, x: i32, y: i32) -> bool {
        self.hor[y as usize] & (1 << (x + 1)) != 0
    }

    /// Edge on the left of unit `(x, y)`.
    pub fn left(&self, x: i32, y: i32) -> bool {
        self.ver[x as usize] & (1 << (y + 1)) != 0
    }

    /// Marks every edge around the `w`x`h` block at `(x, y)`.
    pub fn mark_block(&mut self, x: i32, y: i32, w: i32, h: i32) {
        let row = unit_mask(w as u32) << (x + 1);
        let col = unit_mask(h as u32) << (y + 1);
        self.hor[y as usize] |= row;
        self.hor[(y + h) as usize] |= row;
        self.ver[x as usize] |= col;
        self.ver[(x + w) as usize] |= col;
    }
}

/// Deblocking maps of the CTU being decoded.
#[derive(Clone, Debug)]
pub struct DbfInfo {
    /// Edges with at least boundary strength 1 from motion or coded residuals.
    pub bs1: EdgeMap,
    /// Edges touching an intra or CIIP block.
    pub bs2: EdgeMap,
    /// Luma QP of each 4x4 unit.
    pub qp: Vec<i8>,
}

impl Default for DbfInfo {
    fn default() -> Self {
        Self {
            bs1: Default::default(),
            bs2: Default::default(),
            qp: vec![0; FIELD_STRIDE * FIELD_STRIDE],
        }
    }
}

fn threshold(a: &Mv, b: &Mv) -> bool {
    (a.x - b.x).abs() >= LF_MV_THRESHOLD || (a.y - b.y).abs() >= LF_MV_THRESHOLD
}

/// Boundary strength between two uni-predicted units.
fn uni_strength(dist_p: &[i32], dist_q: &[i32], p: &Mv, q: &Mv) -> bool {
    if dist_p[p.ref_idx as usize] == dist_q[q.ref_idx as usize] {
        threshold(q, p)
    } else {
        true
    }
}

/// Boundary strength between two bi-predicted units.
fn bi_strength(dist: &RefDistances, p0: &Mv, p1: &Mv, q0: &Mv, q1: &Mv) -> bool {
    let ref0_p = dist[0][p0.ref_idx as usize];
    let ref1_p = dist[1][p1.ref_idx as usize];
    let ref0_q = dist[0][q0.ref_idx as usize];
    let ref1_q = dist[1][q1.ref_idx as usize];

    let paired = ref0_p == ref0_q && ref1_p == ref1_q;
    let swapped = ref0_p == ref1_q && ref1_p == ref0_q;
    let coupled = ref0_p == ref1_p;

    if coupled && paired {
        (threshold(q0, p0) || threshold(q1, p1)) && (threshold(q1, p0) || threshold(q0, p1))
    } else if paired {
        threshold(q0, p0) || threshold(q1, p1)
    } else if swapped {
        threshold(q1, p0) || threshold(q0, p1)
    } else {
        true
    }
}

/// Iterates over the set bits of `mask`.
fn set_bits(mut mask: u64) -> impl Iterator<Item = i32> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let k = mask.trailing_zeros() as i32;
        mask &= mask - 1;
        Some(k)
    })
}

/// One side of a block: the units across its top or its left edge.
#[derive(Clone, Copy)]
enum Side {
    Above,
    Left,
}

impl Side {
    fn neighbours(self, field: &MvField, x: i32, y: i32, len: i32) -> u64 {
        let msk = unit_mask(len as u32);
        match self {
            Side::Above => (field.hfield[y as usize] >> (x + 1)) & msk,
            Side::Left => (field.vfield[x as usize] >> (y + 1)) & msk,
        }
    }

    fn neighbour_pos(self, x: i32, y: i32, k: i32) -> (i32, i32) {
        match self {
            Side::Above => (x + k, y - 1),
            Side::Left => (x - 1, y + k),
        }
    }

    fn edges(self, map: &mut EdgeMap, x: i32, y: i32) -> &mut u64 {
        match self {
            Side::Above => &mut map.hor[y as usize],
            Side::Left => &mut map.ver[x as usize],
        }
    }

    fn shift(self, x: i32, y: i32) -> i32 {
        match self {
            Side::Above => x + 1,
            Side::Left => y + 1,
        }
    }
}

impl DbfInfo {
    pub fn reset(&mut self) {
        self.bs1.clear();
        self.bs2.clear();
    }

    /// Marks an intra or CIIP block.
    pub fn mark_bs2(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.bs2.mark_block(x, y, w, h);
    }

    /// Records the QP used by the `w`x`h` block at `(x, y)`.
    pub fn fill_qp(&mut self, qp: i8, x: i32, y: i32, w: i32, h: i32) {
        for j in y..y + h {
            let start = MvField::buf_pos(x, j);
            self.qp[start..start + w as usize].fill(qp);
        }
    }

    pub fn qp(&self, x: i32, y: i32) -> i8 {
        self.qp[MvField::buf_pos(x, y)]
    }

    fn uni_side(
        &mut self,
        side: Side,
        fields: &[MvField; 2],
        dist: &RefDistances,
        list: usize,
        mv: &Mv,
        (x, y, len): (i32, i32, i32),
    ) {
        let own = side.neighbours(&fields[list], x, y, len);
        let other = side.neighbours(&fields[1 - list], x, y, len);
        let shift = side.shift(x, y);
        let msk = unit_mask(len as u32);

        let done = (*side.edges(&mut self.bs1, x, y) >> shift) & msk;
        let chk = (own ^ other) & !done;
        let mut dst = !chk & msk;

        for k in set_bits(chk) {
            let p_list = if own & (1 << k) != 0 { list } else { 1 - list };
            let (px, py) = side.neighbour_pos(x, y, k);
            let p = fields[p_list].mv(px, py);
            if uni_strength(&dist[p_list], &dist[list], &p, mv) {
                dst |= 1 << k;
            }
        }

        *side.edges(&mut self.bs1, x, y) |= (done | dst) << shift;
    }

    fn bi_side(
        &mut self,
        side: Side,
        fields: &[MvField; 2],
        dist: &RefDistances,
        (mv0, mv1): (&Mv, &Mv),
        (x, y, len): (i32, i32, i32),
    ) {
        let n0 = side.neighbours(&fields[0], x, y, len);
        let n1 = side.neighbours(&fields[1], x, y, len);
        let shift = side.shift(x, y);
        let msk = unit_mask(len as u32);

        let done = (*side.edges(&mut self.bs1, x, y) >> shift) & msk;
        let chk = n0 & n1 & !done;
        let mut dst = !chk & msk;

        for k in set_bits(chk) {
            let (px, py) = side.neighbour_pos(x, y, k);
            let p0 = fields[0].mv(px, py);
            let p1 = fields[1].mv(px, py);
            if bi_strength(dist, &p0, &p1, mv0, mv1) {
                dst |= 1 << k;
            }
        }

        *side.edges(&mut self.bs1, x, y) |= dst << shift;
    }

    /// Computes the top and left edges of a block predicted from `list` only.
    #[allow(clippy::too_many_arguments)]
    pub fn check_uni(
        &mut self,
        fields: &[MvField; 2],
        dist: &RefDistances,
        list: usize,
        mv: &Mv,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    ) {
        self.uni_side(Side::Above, fields, dist, list, mv, (x, y, w));
        self.uni_side(Side::Left, fields, dist, list, mv, (x, y, h));
    }

    /// Computes the top and left edges of a bi-predicted block.
    #[allow(clippy::too_many_arguments)]
    pub fn check_bi(
        &mut self,
        fields: &[MvField; 2],
        dist: &RefDistances,
        mv0: &Mv,
        mv1: &Mv,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    ) {
        self.bi_side(Side::Above, fields, dist, (mv0, mv1), (x, y, w));
        self.bi_side(Side::Left, fields, dist, (mv0, mv1), (x, y, h));
    }

    /// Computes the top and left edges of a block whose motion varies per 4x4 unit, once the
    /// motion field holds it.
    pub fn check_units(
        &mut self,
        fields: &[MvField; 2],
        dist: &RefDistances,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    ) {
        let units = (0..w)
            .map(|i| (Side::Above, x + i, y))
            .chain((0..h).map(|j| (Side::Left, x, y + j)));

        for (side, ux, uy) in units {
            let l0 = fields[0].is_available(ux, uy);
            let l1 = fields[1].is_available(ux, uy);
            let mv0 = fields[0].mv(ux, uy);
            let mv1 = fields[1].mv(ux, uy);

            match (l0, l1) {
                (true, true) => self.bi_side(side, fields, dist, (&mv0, &mv1), (ux, uy, 1)),
                (true, false) => self.uni_side(side, fields, dist, 0, &mv0, (ux, uy, 1)),
                (false, true) => self.uni_side(side, fields, dist, 1, &mv1, (ux, uy, 1)),
                (false, false) => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist() -> RefDistances {
        let mut dist = [[0; MAX_NUM_REF]; 2];
        dist[0][..2].copy_from_slice(&[1, 2]);
        dist[1][..2].copy_from_slice(&[-1, 1]);
        dist
    }

    #[test]
    fn uni_edges_follow_mv_difference() {
        let mut fields: [MvField; 2] = Default::default();
        // Above neighbours: unit 0 close vector, unit 1 far vector, unit 2 other reference.
        fields[0].fill(Mv::with_ref(4, 0, 0), 0, 0, 1, 1);
        fields[0].fill(Mv::with_ref(16, 0, 0), 1, 0, 1, 1);
        fields[0].fill(Mv::with_ref(0, 0, 1), 2, 0, 1, 1);
        // Unit 3 predicted from list 1 toward a picture at the same distance as l0 ref 0.
        fields[1].fill(Mv::with_ref(0, 0, 1), 3, 0, 1, 1);

        let mut dbf = DbfInfo::default();
        let mv = Mv::with_ref(0, 0, 0);
        dbf.check_uni(&fields, &dist(), 0, &mv, 0, 1, 4, 1);

        assert!(!dbf.bs1.above(0, 1));
        assert!(dbf.bs1.above(1, 1));
        assert!(dbf.bs1.above(2, 1));
        assert!(!dbf.bs1.above(3, 1));
        // No motion on the left: edge kept for the intra/border path.
        assert!(dbf.bs1.left(0, 1));
    }

    #[test]
    fn bi_edges_accept_swapped_lists() {
        let mut fields: [MvField; 2] = Default::default();
        let mut dist = [[0; MAX_NUM_REF]; 2];
        dist[0][0] = 1;
        dist[1][0] = -1;
        fields[0].fill(Mv::with_ref(0, 0, 0), 0, 0, 2, 1);
        fields[1].fill(Mv::with_ref(32, 0, 0), 0, 0, 2, 1);

        let mut dbf = DbfInfo::default();
        // Same references, same vectors.
        dbf.check_bi(
            &fields,
            &dist,
            &Mv::with_ref(0, 0, 0),
            &Mv::with_ref(32, 0, 0),
            0,
            1,
            1,
            1,
        );
        assert!(!dbf.bs1.above(0, 1));

        // Second list vector differs by a full sample.
        dbf.check_bi(
            &fields,
            &dist,
            &Mv::with_ref(0, 0, 0),
            &Mv::with_ref(48, 0, 0),
            1,
            1,
            1,
            1,
        );
        assert!(dbf.bs1.above(1, 1));
    }

    #[test]
    fn bi_strength_with_coupled_references() {
        let mut dist = [[0; MAX_NUM_REF]; 2];
        dist[0][0] = 2;
        dist[1][0] = 2;
        let p0 = Mv::with_ref(0, 0, 0);
        let p1 = Mv::with_ref(64, 0, 0);
        // Lists swapped on the other side: one of the pairings matches.
        assert!(!bi_strength(&dist, &p0, &p1, &p1, &p0));
        assert!(bi_strength(&dist, &p0, &p1, &p0, &p0));
    }

    #[test]
    fn bs2_marks_block_outline() {
        let mut dbf = DbfInfo::default();
        dbf.mark_bs2(2, 2, 2, 1);
        assert!(dbf.bs2.above(2, 2) && dbf.bs2.above(3, 2));
        assert!(dbf.bs2.above(2, 3));
        assert!(dbf.bs2.left(2, 2) && dbf.bs2.left(4, 2));
        assert!(!dbf.bs2.left(3, 2));

        dbf.fill_qp(30, 0, 0, 2, 2);
        assert_eq!(dbf.qp(1, 1), 30);
        assert_eq!(dbf.qp(2, 1), 0);
    }
}
