// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Values produced by the header parser and consumed by the reconstruction core.
//!
//! Parsing parameter sets and slice headers is not done here. These are plain data holders,
//! filled by a [`crate::decoder::vvc::HeaderParser`] implementation.

use anyhow::anyhow;
use bytes::Bytes;
use enumn::N;

use crate::codec::vvc::MAX_NUM_REF;
use crate::Resolution;

/// NAL unit types, Table 5 of the H.266 specification.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NaluType {
    #[default]
    Trail = 0,
    Stsa = 1,
    Radl = 2,
    Rasl = 3,
    RsvVcl4 = 4,
    RsvVcl5 = 5,
    RsvVcl6 = 6,
    IdrWRadl = 7,
    IdrNLp = 8,
    Cra = 9,
    Gdr = 10,
    RsvIrap11 = 11,
    Opi = 12,
    Dci = 13,
    Vps = 14,
    Sps = 15,
    Pps = 16,
    PrefixAps = 17,
    SuffixAps = 18,
    Ph = 19,
    Aud = 20,
    Eos = 21,
    Eob = 22,
    PrefixSei = 23,
    SuffixSei = 24,
    Fd = 25,
    RsvNvcl26 = 26,
    RsvNvcl27 = 27,
    Unspec28 = 28,
    Unspec29 = 29,
    Unspec30 = 30,
    Unspec31 = 31,
}

impl NaluType {
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    pub fn is_cra(&self) -> bool {
        matches!(self, Self::Cra)
    }

    pub fn is_gdr(&self) -> bool {
        matches!(self, Self::Gdr)
    }

    /// IRAP pictures, plus GDR which resets the reference state the same way.
    pub fn starts_refresh(&self) -> bool {
        self.is_idr() || self.is_cra() || self.is_gdr()
    }

    pub fn is_vcl(&self) -> bool {
        (*self as u8) < 12
    }
}

/// Two-byte NAL unit header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub layer_id: u8,
    pub temporal_id_plus1: u8,
}

impl NaluHeader {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 2 {
            return Err(anyhow!("NAL unit header needs 2 bytes, got {}", data.len()));
        }

        if data[0] & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let layer_id = data[0] & 0x3f;
        let type_ = data[1] >> 3;
        let temporal_id_plus1 = data[1] & 0x7;
        if temporal_id_plus1 == 0 {
            return Err(anyhow!("nuh_temporal_id_plus1 must not be 0"));
        }

        Ok(Self {
            type_: NaluType::n(type_).ok_or(anyhow!("Invalid NALU type {}", type_))?,
            layer_id,
            temporal_id_plus1,
        })
    }
}

/// A NAL unit without its start code. `data` includes the two header bytes.
#[derive(Clone, Debug)]
pub struct NalUnit {
    pub header: NaluHeader,
    pub data: Bytes,
}

impl NalUnit {
    pub fn new(data: Bytes) -> anyhow::Result<Self> {
        let header = NaluHeader::parse(&data)?;
        Ok(Self { header, data })
    }

    /// The RBSP bytes following the header.
    pub fn payload(&self) -> Bytes {
        self.data.slice(2..)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceType {
    #[default]
    B = 0,
    P = 1,
    I = 2,
}

impl SliceType {
    pub fn is_b(&self) -> bool {
        matches!(self, Self::B)
    }

    pub fn is_p(&self) -> bool {
        matches!(self, Self::P)
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I)
    }
}

/// One `ref_pic_list_struct` entry as signalled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefPicListEntry {
    pub st_ref_pic_flag: bool,
    pub inter_layer_ref_pic_flag: bool,
    pub abs_delta_poc_st: u32,
    pub strp_entry_sign_flag: bool,
    pub rpls_poc_lsb_lt: i32,
}

impl RefPicListEntry {
    /// A short-term entry `delta` away from the previously resolved POC. `delta` must not be 0.
    pub fn short_term(delta: i32) -> Self {
        Self {
            st_ref_pic_flag: true,
            abs_delta_poc_st: delta.unsigned_abs().saturating_sub(1),
            strp_entry_sign_flag: delta < 0,
            ..Default::default()
        }
    }

    pub fn long_term(poc_lsb: i32) -> Self {
        Self {
            rpls_poc_lsb_lt: poc_lsb,
            ..Default::default()
        }
    }
}

/// A reference picture list and its number of active entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicList {
    pub entries: Vec<RefPicListEntry>,
    pub num_active: usize,
}

impl RefPicList {
    /// Builds a short-term list whose entries resolve to `pocs` given the current `poc`.
    pub fn from_pocs(poc: i32, pocs: &[i32], num_active: usize) -> Self {
        let mut base = poc;
        let entries = pocs
            .iter()
            .map(|&ref_poc| {
                let entry = RefPicListEntry::short_term(ref_poc - base);
                base = ref_poc;
                entry
            })
            .collect();

        Self {
            entries,
            num_active,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len().min(MAX_NUM_REF)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sequence-level coding tool switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ToolFlags {
    pub temporal_mvp: bool,
    pub sbtmvp: bool,
    pub affine: bool,
    pub six_param_affine: bool,
    pub affine_amvr: bool,
    pub amvr: bool,
    pub mmvd: bool,
    pub ciip: bool,
    pub gpm: bool,
    pub bcw: bool,
    pub smvd: bool,
    pub bdof: bool,
    pub dmvr: bool,
    pub mip: bool,
    pub mrl: bool,
    pub isp: bool,
    pub cclm: bool,
    pub cu_qp_delta: bool,
}

/// DPB sizing for the highest temporal sub-layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DpbParams {
    pub max_dec_pic_buffering: usize,
    pub max_num_reorder: usize,
    pub max_latency_increase_plus1: u32,
}

impl Default for DpbParams {
    fn default() -> Self {
        Self {
            max_dec_pic_buffering: MAX_NUM_REF,
            max_num_reorder: 0,
            max_latency_increase_plus1: 0,
        }
    }
}

/// Picture size and block size limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureGeometry {
    pub resolution: Resolution,
    pub log2_ctb_size: u8,
    pub log2_min_cb_size: u8,
    pub log2_min_qt_size: u8,
    pub log2_max_bt_size: u8,
    pub log2_max_tt_size: u8,
    pub max_mtt_depth: u8,
    pub log2_max_tb_size: u8,
}

impl Default for PictureGeometry {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            log2_ctb_size: 7,
            log2_min_cb_size: 2,
            log2_min_qt_size: 3,
            log2_max_bt_size: 7,
            log2_max_tt_size: 6,
            max_mtt_depth: 3,
            log2_max_tb_size: 6,
        }
    }
}

impl PictureGeometry {
    pub fn new(resolution: Resolution, log2_ctb_size: u8) -> Self {
        Self {
            resolution,
            log2_ctb_size,
            log2_max_bt_size: log2_ctb_size,
            log2_max_tt_size: log2_ctb_size.min(6),
            ..Default::default()
        }
    }

    pub fn ctb_size(&self) -> u32 {
        1 << self.log2_ctb_size
    }

    /// CTU columns and rows.
    pub fn ctb_dims(&self) -> (u32, u32) {
        self.resolution.blocks(self.log2_ctb_size)
    }

    pub fn nb_ctbs(&self) -> usize {
        let (w, h) = self.ctb_dims();
        (w * h) as usize
    }
}

/// Sequence-wide values: everything that stays fixed within a CVS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceParams {
    pub geometry: PictureGeometry,
    pub tools: ToolFlags,
    pub dpb: DpbParams,
    pub log2_max_poc_lsb: u8,
    pub bit_depth: u8,
}

/// Slice header values used by the reconstruction core.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceParams {
    pub nalu_type: NaluType,
    pub slice_type: SliceType,
    pub pic_order_cnt_lsb: u32,
    pub rpl: [RefPicList; 2],
    pub temporal_mvp_enabled: bool,
    pub collocated_from_l0: bool,
    pub collocated_ref_idx: usize,
    pub mvd_l1_zero: bool,
    pub slice_qp: i32,
    pub max_num_merge_cand: u8,
    pub max_num_gpm_cand: u8,
    pub max_num_subblock_merge_cand: u8,
    pub fpel_mmvd: bool,
    pub dmvr_disabled: bool,
    pub bdof_disabled: bool,
    pub first_ctb_addr: usize,
    pub nb_ctbs: usize,
}

impl SliceParams {
    pub fn num_active(&self, list: usize) -> usize {
        match (self.slice_type, list) {
            (SliceType::I, _) | (SliceType::P, 1) => 0,
            _ => self.rpl[list].num_active.min(self.rpl[list].len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nalu_header() {
        // IDR_N_LP, layer 0, tid 0.
        let hdr = NaluHeader::parse(&[0x00, 0x41]).unwrap();
        assert_eq!(hdr.type_, NaluType::IdrNLp);
        assert_eq!(hdr.temporal_id_plus1, 1);
        assert!(hdr.type_.is_idr());
        assert!(hdr.type_.is_vcl());

        // SPS.
        let hdr = NaluHeader::parse(&[0x00, 0x79]).unwrap();
        assert_eq!(hdr.type_, NaluType::Sps);
        assert!(!hdr.type_.is_vcl());

        assert!(NaluHeader::parse(&[0x80, 0x41]).is_err());
        assert!(NaluHeader::parse(&[0x00, 0x40]).is_err());
        assert!(NaluHeader::parse(&[0x00]).is_err());
    }

    #[test]
    fn short_term_entry_encoding() {
        let e = RefPicListEntry::short_term(-1);
        assert!(e.st_ref_pic_flag);
        assert!(e.strp_entry_sign_flag);
        assert_eq!(e.abs_delta_poc_st, 0);

        let e = RefPicListEntry::short_term(3);
        assert!(!e.strp_entry_sign_flag);
        assert_eq!(e.abs_delta_poc_st, 2);
    }

    #[test]
    fn num_active_by_slice_type() {
        let mut slice = SliceParams {
            slice_type: SliceType::P,
            rpl: [
                RefPicList::from_pocs(4, &[3, 2], 2),
                RefPicList::from_pocs(4, &[8], 1),
            ],
            ..Default::default()
        };
        assert_eq!(slice.num_active(0), 2);
        assert_eq!(slice.num_active(1), 0);

        slice.slice_type = SliceType::B;
        assert_eq!(slice.num_active(1), 1);
    }
}
