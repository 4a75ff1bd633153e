// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set and header data consumed by the reference management code.
//!
//! These structures are filled by the bitstream parser. Only the syntax elements that the DPB and
//! the reference picture list construction need are kept here; field names retain the meaning
//! they have in the H.266 specification.

/// Maximum number of temporal sub-layers.
pub const MAX_SUB_LAYERS: usize = 7;

/// Maximum number of entries in a `ref_pic_list_struct()`.
pub const MAX_REF_ENTRIES: usize = 15;

const MAX_LOG2_POC_LSB_MINUS4: u8 = 12;
const MAX_LOG2_CTU_SIZE_MINUS5: u8 = 2;

/// The reference picture list to use, L0 or L1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefPicListName {
    L0 = 0,
    L1 = 1,
}

impl RefPicListName {
    pub const ALL: [RefPicListName; 2] = [RefPicListName::L0, RefPicListName::L1];
}

/// One entry of a `ref_pic_list_struct()`. See 7.3.10.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RplEntry {
    /// A short-term reference, expressed as a POC delta from the previous short-term entry (or
    /// from the current picture for the first one).
    ShortTerm {
        abs_delta_poc_st: u32,
        strp_entry_sign_flag: bool,
    },
    /// A long-term reference. `rpls_poc_lsb_lt` is only meaningful when `ltrp_in_header_flag` is
    /// not set for the list; otherwise the LSBs are carried in the header.
    LongTerm { rpls_poc_lsb_lt: u32 },
    /// An inter-layer reference.
    InterLayer { ilrp_idx: u8 },
}

/// See 7.3.10 "Reference picture list structure syntax".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListStruct {
    pub entries: Vec<RplEntry>,
    pub ltrp_in_header_flag: bool,
}

impl RefPicListStruct {
    pub fn num_ref_entries(&self) -> usize {
        self.entries.len()
    }

    /// Number of long-term entries in the list.
    pub fn num_ltrp_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, RplEntry::LongTerm { .. }))
            .count()
    }
}

/// See 7.3.9 "Reference picture lists syntax". Arrays are indexed by list, then by long-term
/// entry index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicLists {
    pub rpl_ref_list: [RefPicListStruct; 2],
    pub poc_lsb_lt: [Vec<u32>; 2],
    pub delta_poc_msb_cycle_present_flag: [Vec<bool>; 2],
    pub delta_poc_msb_cycle_lt: [Vec<u32>; 2],
}

/// The subset of the SPS used by the reference management code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub sps_max_sublayers_minus1: u8,
    /// `dpb_max_dec_pic_buffering_minus1` from `dpb_parameters()`, per sub-layer.
    pub dpb_max_dec_pic_buffering_minus1: [u8; MAX_SUB_LAYERS],
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub pic_width_max_in_luma_samples: u32,
    pub pic_height_max_in_luma_samples: u32,
    pub log2_ctu_size_minus5: u8,
    pub bitdepth_minus8: u8,
    pub chroma_format_idc: u8,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            sps_max_sublayers_minus1: 0,
            dpb_max_dec_pic_buffering_minus1: [0; MAX_SUB_LAYERS],
            log2_max_pic_order_cnt_lsb_minus4: 4,
            weighted_pred_flag: false,
            weighted_bipred_flag: false,
            pic_width_max_in_luma_samples: 0,
            pic_height_max_in_luma_samples: 0,
            log2_ctu_size_minus5: 2,
            bitdepth_minus8: 0,
            chroma_format_idc: 1,
        }
    }
}

impl Sps {
    /// `MaxPicOrderCntLsb`, see 7-8. `log2_max_pic_order_cnt_lsb_minus4` is clamped to its
    /// legal range of 0..=12.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (u32::from(self.log2_max_pic_order_cnt_lsb_minus4.min(MAX_LOG2_POC_LSB_MINUS4)) + 4)
    }

    /// The number of pictures the DPB must be able to hold for the highest sub-layer.
    pub fn dpb_capacity(&self) -> usize {
        let highest_tid = usize::from(self.sps_max_sublayers_minus1).min(MAX_SUB_LAYERS - 1);
        usize::from(self.dpb_max_dec_pic_buffering_minus1[highest_tid]) + 1
    }

    /// `CtbLog2SizeY`. `sps_log2_ctu_size_minus5` is clamped to its legal range of 0..=2.
    pub fn ctb_log2_size_y(&self) -> u32 {
        u32::from(self.log2_ctu_size_minus5.min(MAX_LOG2_CTU_SIZE_MINUS5)) + 5
    }

    pub fn bit_depth(&self) -> u8 {
        self.bitdepth_minus8 + 8
    }

    /// Whether samples need more than one byte of storage.
    pub fn pixel_shift(&self) -> bool {
        self.bit_depth() > 8
    }

    /// Returns `(SubWidthC, SubHeightC)` as log2 shifts. See table 2.
    pub fn chroma_shifts(&self) -> (u32, u32) {
        match self.chroma_format_idc {
            1 => (1, 1),
            2 => (1, 0),
            _ => (0, 0),
        }
    }
}

/// Builder used mostly by tests and the parser glue to set up an `Sps`.
#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the DPB size of the highest sub-layer.
    pub fn dpb_capacity(mut self, capacity: u8) -> Self {
        let highest_tid = usize::from(self.0.sps_max_sublayers_minus1);
        self.0.dpb_max_dec_pic_buffering_minus1[highest_tid] = capacity.saturating_sub(1);
        self
    }

    pub fn log2_max_pic_order_cnt_lsb(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value.saturating_sub(4);
        self
    }

    pub fn weighted_pred(mut self, pred: bool, bipred: bool) -> Self {
        self.0.weighted_pred_flag = pred;
        self.0.weighted_bipred_flag = bipred;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.0.pic_width_max_in_luma_samples = width;
        self.0.pic_height_max_in_luma_samples = height;
        self
    }

    pub fn log2_ctu_size(mut self, value: u8) -> Self {
        self.0.log2_ctu_size_minus5 = value.saturating_sub(5);
        self
    }

    pub fn bit_depth(mut self, value: u8) -> Self {
        self.0.bitdepth_minus8 = value.saturating_sub(8);
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn build(self) -> Sps {
        self.0
    }
}

/// Conformance cropping window, in luma samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConformanceWindow {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// The subset of the PPS used by the reference management code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conf_win: ConformanceWindow,
    /// Whether the reference picture lists are carried in the picture header rather than in each
    /// slice header.
    pub rpl_info_in_ph_flag: bool,
}

impl Pps {
    fn ctb_count_1d(samples: u32, sps: &Sps) -> u32 {
        let ctb_size = 1 << sps.ctb_log2_size_y();
        samples.div_ceil(ctb_size)
    }

    /// `PicWidthInCtbsY`.
    pub fn ctb_width(&self, sps: &Sps) -> u32 {
        Self::ctb_count_1d(self.pic_width_in_luma_samples, sps)
    }

    /// `PicHeightInCtbsY`.
    pub fn ctb_height(&self, sps: &Sps) -> u32 {
        Self::ctb_count_1d(self.pic_height_in_luma_samples, sps)
    }

    /// Number of 4x4 luma blocks in the picture, i.e. the size of a motion vector field.
    pub fn min_pu_count(&self) -> usize {
        let w = self.pic_width_in_luma_samples.div_ceil(4) as usize;
        let h = self.pic_height_in_luma_samples.div_ceil(4) as usize;
        w * h
    }
}

/// Picture header data, as derived by the parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    /// `PicOrderCntVal` of the picture, see 8.3.1.
    pub poc: i32,
    pub pic_output_flag: bool,
    pub non_ref_pic_flag: bool,
    /// Set when `NoOutputBeforeRecoveryFlag` applies and the picture is a RASL picture or
    /// precedes the recovery point of a GDR picture. Such pictures are never output.
    pub no_output_before_recovery: bool,
    /// Number of slices in the picture.
    pub num_slices: usize,
    /// Only used when `pps.rpl_info_in_ph_flag` is set.
    pub ref_pic_lists: RefPicLists,
}

/// Slice header data, as derived by the parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Index of the slice within its picture.
    pub slice_idx: usize,
    /// Raster-scan addresses of the CTBs covered by the slice.
    pub ctb_addr_in_curr_slice: Vec<u32>,
    /// Only used when `pps.rpl_info_in_ph_flag` is not set.
    pub ref_pic_lists: RefPicLists,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
}

impl SliceHeader {
    /// The reference picture lists that apply to this slice.
    pub fn ref_pic_lists<'a>(&'a self, pps: &Pps, ph: &'a PictureHeader) -> &'a RefPicLists {
        if pps.rpl_info_in_ph_flag {
            &ph.ref_pic_lists
        } else {
            &self.ref_pic_lists
        }
    }

    /// The list the collocated picture is taken from.
    pub fn collocated_list(&self) -> RefPicListName {
        if self.collocated_from_l0_flag {
            RefPicListName::L0
        } else {
            RefPicListName::L1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpb_capacity_uses_highest_sublayer() {
        let mut sps = SpsBuilder::new().dpb_capacity(4).build();
        assert_eq!(sps.dpb_capacity(), 4);

        sps.sps_max_sublayers_minus1 = 2;
        sps.dpb_max_dec_pic_buffering_minus1[2] = 5;
        assert_eq!(sps.dpb_capacity(), 6);
    }

    #[test]
    fn ctb_grid() {
        let sps = SpsBuilder::new().log2_ctu_size(6).resolution(1920, 1080).build();
        let pps = Pps {
            pic_width_in_luma_samples: 1920,
            pic_height_in_luma_samples: 1080,
            ..Default::default()
        };

        assert_eq!(pps.ctb_width(&sps), 30);
        assert_eq!(pps.ctb_height(&sps), 17);
        assert_eq!(pps.min_pu_count(), 480 * 270);
    }

    #[test]
    fn max_poc_lsb() {
        let sps = SpsBuilder::new().log2_max_pic_order_cnt_lsb(8).build();
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);
    }

    #[test]
    fn out_of_range_shifts_are_clamped() {
        let mut sps = SpsBuilder::new().build();
        sps.log2_max_pic_order_cnt_lsb_minus4 = 200;
        sps.log2_ctu_size_minus5 = 200;

        assert_eq!(sps.max_pic_order_cnt_lsb(), 1 << 16);
        assert_eq!(sps.ctb_log2_size_y(), 7);
    }
}
