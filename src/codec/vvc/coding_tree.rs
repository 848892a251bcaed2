// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coding tree: recursive quad, binary and ternary splits of a CTU down to coding units.

use crate::codec::vvc::coding_unit::CuRecord;
use crate::codec::vvc::entropy::ContextId;
use crate::codec::vvc::entropy::EntropyDecoder;
use crate::codec::vvc::entropy::SyntaxElement;
use crate::codec::vvc::params::PictureGeometry;
use crate::codec::vvc::recon::BlockRect;
use crate::codec::vvc::recon::Reconstructor;
use crate::codec::vvc::slice::SliceDecoder;

/// Log2 of the side of a quantization group.
const LOG2_QG_SIZE: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    None,
    Qt,
    BtHor,
    BtVer,
    TtHor,
    TtVer,
}

/// A node of the coding tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeNode {
    pub x0: u32,
    pub y0: u32,
    pub log2_w: u8,
    pub log2_h: u8,
    pub qt_depth: u8,
    pub mtt_depth: u8,
}

impl TreeNode {
    pub fn ctu(x0: u32, y0: u32, log2_ctb_size: u8) -> Self {
        Self {
            x0,
            y0,
            log2_w: log2_ctb_size,
            log2_h: log2_ctb_size,
            qt_depth: 0,
            mtt_depth: 0,
        }
    }

    pub fn rect(&self) -> BlockRect {
        BlockRect::new(self.x0, self.y0, self.log2_w, self.log2_h)
    }

    fn child(&self, dx: u32, dy: u32, log2_w: u8, log2_h: u8) -> Self {
        Self {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            log2_w,
            log2_h,
            ..*self
        }
    }

    /// Nodes resulting from `split`, in decoding order.
    pub fn children(&self, split: SplitMode) -> Vec<TreeNode> {
        let (lw, lh) = (self.log2_w, self.log2_h);
        let (w, h) = (1u32 << lw, 1u32 << lh);

        let mut children = match split {
            SplitMode::None => return vec![],
            SplitMode::Qt => {
                let mut children = vec![
                    self.child(0, 0, lw - 1, lh - 1),
                    self.child(w / 2, 0, lw - 1, lh - 1),
                    self.child(0, h / 2, lw - 1, lh - 1),
                    self.child(w / 2, h / 2, lw - 1, lh - 1),
                ];
                for c in children.iter_mut() {
                    c.qt_depth += 1;
                }
                return children;
            }
            SplitMode::BtHor => vec![self.child(0, 0, lw, lh - 1), self.child(0, h / 2, lw, lh - 1)],
            SplitMode::BtVer => vec![self.child(0, 0, lw - 1, lh), self.child(w / 2, 0, lw - 1, lh)],
            SplitMode::TtHor => vec![
                self.child(0, 0, lw, lh - 2),
                self.child(0, h / 4, lw, lh - 1),
                self.child(0, 3 * h / 4, lw, lh - 2),
            ],
            SplitMode::TtVer => vec![
                self.child(0, 0, lw - 2, lh),
                self.child(w / 4, 0, lw - 1, lh),
                self.child(3 * w / 4, 0, lw - 2, lh),
            ],
        };

        for c in children.iter_mut() {
            c.mtt_depth += 1;
        }
        children
    }

    /// Whether the node lies entirely inside the picture.
    fn is_inside(&self, geometry: &PictureGeometry) -> bool {
        self.x0 + (1 << self.log2_w) <= geometry.resolution.width
            && self.y0 + (1 << self.log2_h) <= geometry.resolution.height
    }
}

/// Splits a node may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllowedSplits {
    pub qt: bool,
    pub bt_hor: bool,
    pub bt_ver: bool,
    pub tt_hor: bool,
    pub tt_ver: bool,
}

impl AllowedSplits {
    pub fn derive(node: &TreeNode, geometry: &PictureGeometry) -> Self {
        let g = geometry;
        let (lw, lh) = (node.log2_w, node.log2_h);
        let min_cb = g.log2_min_cb_size;
        let max_tb = g.log2_max_tb_size;

        let qt = lw == lh && lw > g.log2_min_qt_size && node.mtt_depth == 0;

        if !node.is_inside(g) {
            // Across the picture boundary: only the splits that move the node back inside.
            let right_out = node.x0 + (1 << lw) > g.resolution.width;
            let bottom_out = node.y0 + (1 << lh) > g.resolution.height;
            return Self {
                qt: qt || (lw == lh && lw > min_cb && node.mtt_depth == 0),
                bt_hor: bottom_out && lh > min_cb,
                bt_ver: right_out && !bottom_out && lw > min_cb,
                tt_hor: false,
                tt_ver: false,
            };
        }

        let mtt = node.mtt_depth < g.max_mtt_depth;
        let bt = mtt && lw <= g.log2_max_bt_size && lh <= g.log2_max_bt_size;
        let tt = mtt && lw <= g.log2_max_tt_size && lh <= g.log2_max_tt_size && lw <= max_tb && lh <= max_tb;

        Self {
            qt,
            bt_hor: bt && lh > min_cb && !(lw > max_tb && lh <= max_tb),
            bt_ver: bt && lw > min_cb && !(lw <= max_tb && lh > max_tb),
            tt_hor: tt && lh > min_cb + 1,
            tt_ver: tt && lw > min_cb + 1,
        }
    }

    fn nb_mtt(&self) -> u8 {
        u8::from(self.bt_hor) + u8::from(self.bt_ver) + u8::from(self.tt_hor) + u8::from(self.tt_ver)
    }

    pub fn any(&self) -> bool {
        self.qt || self.nb_mtt() > 0
    }

    pub fn any_mtt(&self) -> bool {
        self.nb_mtt() > 0
    }
}

/// Context increment of `split_cu_flag`.
pub fn split_cu_ctx(node: &TreeNode, allowed: &AllowedSplits, left: Option<&CuRecord>, above: Option<&CuRecord>) -> u8 {
    let cond_l = left.map_or(false, |l| l.log2_h < node.log2_h);
    let cond_a = above.map_or(false, |a| a.log2_w < node.log2_w);
    let nb = allowed.nb_mtt() + 2 * u8::from(allowed.qt);
    let set = (nb.saturating_sub(1) / 2).min(2);
    u8::from(cond_l) + u8::from(cond_a) + 3 * set
}

/// Context increment of `split_qt_flag`.
pub fn split_qt_ctx(node: &TreeNode, left: Option<&CuRecord>, above: Option<&CuRecord>) -> u8 {
    let cond_l = left.map_or(false, |l| l.qt_depth > node.qt_depth);
    let cond_a = above.map_or(false, |a| a.qt_depth > node.qt_depth);
    u8::from(cond_l) + u8::from(cond_a) + 3 * u8::from(node.qt_depth >= 2)
}

/// Context increment of `mtt_split_cu_vertical_flag`.
pub fn mtt_vertical_ctx(
    node: &TreeNode,
    allowed: &AllowedSplits,
    left: Option<&CuRecord>,
    above: Option<&CuRecord>,
) -> u8 {
    let nb_ver = u8::from(allowed.bt_ver) + u8::from(allowed.tt_ver);
    let nb_hor = u8::from(allowed.bt_hor) + u8::from(allowed.tt_hor);

    if nb_ver > nb_hor {
        return 4;
    }
    if nb_ver < nb_hor {
        return 3;
    }

    match (left, above) {
        (Some(l), Some(a)) => {
            // Log2 of width over above width against height over left height.
            let d_a = i32::from(node.log2_w) - i32::from(a.log2_w);
            let d_l = i32::from(node.log2_h) - i32::from(l.log2_h);
            match d_a.cmp(&d_l) {
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Less => 1,
                std::cmp::Ordering::Greater => 2,
            }
        }
        _ => 0,
    }
}

impl SliceDecoder {
    fn read_split_mode<E: EntropyDecoder + ?Sized>(&self, ed: &mut E, node: &TreeNode) -> SplitMode {
        let geometry = &self.sps.geometry;
        let allowed = AllowedSplits::derive(node, geometry);
        let left = self.maps.get(node.x0 as i64 - 1, node.y0 as i64);
        let above = self.maps.get(node.x0 as i64, node.y0 as i64 - 1);

        let split = if !node.is_inside(geometry) {
            true
        } else if allowed.any() {
            let ctx = split_cu_ctx(node, &allowed, left, above);
            ed.read_bin(ContextId::new(SyntaxElement::SplitCuFlag, ctx))
        } else {
            false
        };
        if !split {
            return SplitMode::None;
        }

        if !allowed.any() {
            // Boundary node that cannot be split further along the boundary.
            return if node.log2_w >= node.log2_h {
                SplitMode::BtVer
            } else {
                SplitMode::BtHor
            };
        }

        let qt = if allowed.qt && allowed.any_mtt() {
            let ctx = split_qt_ctx(node, left, above);
            ed.read_bin(ContextId::new(SyntaxElement::SplitQtFlag, ctx))
        } else {
            allowed.qt
        };
        if qt {
            return SplitMode::Qt;
        }

        let can_ver = allowed.bt_ver || allowed.tt_ver;
        let can_hor = allowed.bt_hor || allowed.tt_hor;
        let vertical = if can_ver && can_hor {
            let ctx = mtt_vertical_ctx(node, &allowed, left, above);
            ed.read_bin(ContextId::new(SyntaxElement::MttSplitCuVerticalFlag, ctx))
        } else {
            can_ver
        };

        let (bt, tt) = if vertical {
            (allowed.bt_ver, allowed.tt_ver)
        } else {
            (allowed.bt_hor, allowed.tt_hor)
        };
        let binary = if bt && tt {
            let ctx = 2 * u8::from(vertical) + u8::from(node.mtt_depth <= 1);
            ed.read_bin(ContextId::new(SyntaxElement::MttSplitCuBinaryFlag, ctx))
        } else {
            bt
        };

        match (vertical, binary) {
            (true, true) => SplitMode::BtVer,
            (true, false) => SplitMode::TtVer,
            (false, true) => SplitMode::BtHor,
            (false, false) => SplitMode::TtHor,
        }
    }

    /// Parses the coding tree rooted at `node`, decoding every coding unit inside the picture.
    pub(super) fn coding_tree<E, R>(&mut self, ed: &mut E, recon: &mut R, node: &TreeNode) -> anyhow::Result<()>
    where
        E: EntropyDecoder + ?Sized,
        R: Reconstructor + ?Sized,
    {
        let log2_qg = LOG2_QG_SIZE.min(self.sps.geometry.log2_ctb_size);
        if node.log2_w + node.log2_h >= 2 * log2_qg {
            self.start_quantization_group(node.x0, node.y0);
        }

        let split = self.read_split_mode(ed, node);
        if split == SplitMode::None {
            return self.coding_unit(ed, recon, node);
        }

        let (width, height) = (
            self.sps.geometry.resolution.width,
            self.sps.geometry.resolution.height,
        );
        for child in node.children(split) {
            if child.x0 < width && child.y0 < height {
                self.coding_tree(ed, recon, &child)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn geometry() -> PictureGeometry {
        PictureGeometry::new(Resolution::from((128, 128)), 7)
    }

    #[test]
    fn children_of_each_split() {
        let node = TreeNode::ctu(0, 0, 5);

        let qt = node.children(SplitMode::Qt);
        assert_eq!(qt.len(), 4);
        assert_eq!((qt[3].x0, qt[3].y0, qt[3].log2_w), (16, 16, 4));
        assert!(qt.iter().all(|c| c.qt_depth == 1 && c.mtt_depth == 0));

        let tt = node.children(SplitMode::TtVer);
        let widths: Vec<u32> = tt.iter().map(|c| 1 << c.log2_w).collect();
        assert_eq!(widths, vec![8, 16, 8]);
        assert_eq!(tt[2].x0, 24);
        assert!(tt.iter().all(|c| c.mtt_depth == 1));

        let bt = node.children(SplitMode::BtHor);
        assert_eq!((bt[1].y0, bt[1].log2_h), (16, 4));
    }

    #[test]
    fn allowed_splits_follow_size_limits() {
        let g = geometry();

        // 128x128 CTU: quad split or binary splits, ternary is limited to 64.
        let ctu = TreeNode::ctu(0, 0, 7);
        let allowed = AllowedSplits::derive(&ctu, &g);
        assert!(allowed.qt);
        assert!(!allowed.tt_hor && !allowed.tt_ver);

        // After a binary split, no quad split.
        let node = ctu.children(SplitMode::BtVer)[0].children(SplitMode::BtHor)[0];
        let allowed = AllowedSplits::derive(&node, &g);
        assert!(!allowed.qt);
        assert!(allowed.tt_ver && allowed.tt_hor);

        // Smallest blocks cannot split.
        let node = TreeNode {
            log2_w: 2,
            log2_h: 2,
            ..ctu
        };
        assert!(!AllowedSplits::derive(&node, &g).any());

        // 8x4: only a vertical binary split is left at the minimum height.
        let node = TreeNode {
            log2_w: 3,
            log2_h: 2,
            mtt_depth: 1,
            ..ctu
        };
        let allowed = AllowedSplits::derive(&node, &g);
        assert!(allowed.bt_ver && !allowed.bt_hor && !allowed.tt_ver);
    }

    #[test]
    fn boundary_nodes() {
        let g = PictureGeometry::new(Resolution::from((96, 64)), 7);
        let ctu = TreeNode::ctu(0, 0, 7);
        let allowed = AllowedSplits::derive(&ctu, &g);
        assert!(allowed.qt);
        assert!(allowed.bt_hor);
        assert!(!allowed.tt_hor && !allowed.tt_ver);
    }

    #[test]
    fn split_contexts() {
        let node = TreeNode::ctu(0, 0, 5);
        let allowed = AllowedSplits {
            qt: true,
            bt_hor: true,
            bt_ver: true,
            tt_hor: true,
            tt_ver: true,
        };
        let small = CuRecord {
            log2_w: 3,
            log2_h: 3,
            qt_depth: 2,
            ..Default::default()
        };

        assert_eq!(split_cu_ctx(&node, &allowed, None, None), 6);
        assert_eq!(split_cu_ctx(&node, &allowed, Some(&small), Some(&small)), 8);
        assert_eq!(split_qt_ctx(&node, Some(&small), None), 1);

        let only_ver = AllowedSplits {
            bt_ver: true,
            ..Default::default()
        };
        assert_eq!(mtt_vertical_ctx(&node, &only_ver, None, None), 4);
        assert_eq!(mtt_vertical_ctx(&node, &allowed, Some(&small), Some(&small)), 0);
    }
}
