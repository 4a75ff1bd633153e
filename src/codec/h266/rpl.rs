// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list construction. See 8.3.2 "Decoding process for reference picture
//! lists construction".

use anyhow::anyhow;

use crate::codec::h266::dpb::Dpb;
use crate::codec::h266::dpb::DpbError;
use crate::codec::h266::dpb::DpbResult;
use crate::codec::h266::parser::PictureHeader;
use crate::codec::h266::parser::RefPicListName;
use crate::codec::h266::parser::RefPicLists;
use crate::codec::h266::parser::RplEntry;
use crate::codec::h266::parser::SliceHeader;
use crate::codec::h266::picture::FrameFlags;
use crate::codec::h266::picture::RefPicEntry;
use crate::codec::h266::picture::RefPicList;
use crate::codec::h266::picture::SliceRefPicLists;
use crate::codec::h266::picture::SlotHandle;
use crate::video_frame::DecodedPicture;

/// POC delta of the short-term entry `i` of a list. See 7-39.
fn delta_poc_st(abs_delta_poc_st: u32, sign: bool, i: usize, weighted_pred: bool) -> i32 {
    let mut abs_delta_poc_st = abs_delta_poc_st as i32;
    if !(weighted_pred && i != 0) {
        abs_delta_poc_st = abs_delta_poc_st.wrapping_add(1);
    }

    if sign {
        abs_delta_poc_st.wrapping_neg()
    } else {
        abs_delta_poc_st
    }
}

/// POC of the long-term entry `j` of list `lx`. `prev_delta_poc_msb` carries the MSB cycle
/// across the entries of the list. See 7-40 and 7-41.
fn poc_lt(
    prev_delta_poc_msb: &mut u32,
    poc: i32,
    ref_lists: &RefPicLists,
    lx: usize,
    j: usize,
    rpls_poc_lsb_lt: u32,
    max_poc_lsb: i32,
) -> DpbResult<i32> {
    let rpls = &ref_lists.rpl_ref_list[lx];
    let lsb = if rpls.ltrp_in_header_flag {
        *ref_lists.poc_lsb_lt[lx]
            .get(j)
            .ok_or_else(|| DpbError::InvalidData(format!("missing poc_lsb_lt[{}][{}]", lx, j)))?
    } else {
        rpls_poc_lsb_lt
    };
    if lsb >= max_poc_lsb as u32 {
        return Err(DpbError::InvalidData(format!(
            "long-term POC LSB {} out of range",
            lsb
        )));
    }

    let mut lt_poc = lsb as i32;
    if msb_present(ref_lists, lx, j) {
        let cycle = ref_lists.delta_poc_msb_cycle_lt[lx]
            .get(j)
            .copied()
            .unwrap_or(0);
        let delta = cycle.wrapping_add(*prev_delta_poc_msb);

        lt_poc = lt_poc
            .wrapping_add(poc)
            .wrapping_sub((delta as i32).wrapping_mul(max_poc_lsb))
            .wrapping_sub(poc & (max_poc_lsb - 1));
        *prev_delta_poc_msb = delta;
    }

    Ok(lt_poc)
}

fn msb_present(ref_lists: &RefPicLists, lx: usize, j: usize) -> bool {
    ref_lists.delta_poc_msb_cycle_present_flag[lx]
        .get(j)
        .copied()
        .unwrap_or(false)
}

impl<P: DecodedPicture> Dpb<P> {
    /// Builds the reference picture lists of a slice of the current picture.
    ///
    /// The first slice of a picture also refreshes the reference marking of the whole DPB.
    pub fn build_rpl(&mut self, ph: &PictureHeader, sh: &SliceHeader) -> DpbResult<()> {
        if sh.slice_idx == 0 {
            self.build_frame_rpl(ph, sh)
        } else {
            self.build_slice_rpl(ph, sh)
        }
    }

    /// Marks every picture but the current one as unused for reference, then builds the lists
    /// of `sh`, marking the pictures they contain. Pictures left with no use are released,
    /// even if building failed.
    pub fn build_frame_rpl(&mut self, ph: &PictureHeader, sh: &SliceHeader) -> DpbResult<()> {
        let current = self.current_index();
        for (index, slot) in self.slots_mut().iter_mut().enumerate() {
            if Some(index) != current && !slot.is_free() {
                slot.set_reference(FrameFlags::empty());
            }
        }

        let ret = self.build_slice_rpl(ph, sh);

        for index in 0..self.slots().len() {
            self.unref_index(index, FrameFlags::empty());
        }

        ret
    }

    /// Builds the reference picture lists of `sh` and stores them in the current picture.
    pub fn build_slice_rpl(&mut self, ph: &PictureHeader, sh: &SliceHeader) -> DpbResult<()> {
        let current = self
            .current_index()
            .ok_or_else(|| anyhow!("no picture is being decoded"))?;
        let (sps, pps) = self
            .sps()
            .zip(self.pps())
            .ok_or_else(|| anyhow!("no active parameter sets"))?;
        let max_poc_lsb = sps.max_pic_order_cnt_lsb();
        let weighted_pred = sps.weighted_pred_flag || sps.weighted_bipred_flag;
        let ref_lists = sh.ref_pic_lists(pps, ph);
        let poc = self.cur_poc();

        self.init_slice_rpl(current, sh)?;

        let mut lists: SliceRefPicLists<P> = Default::default();
        let mut collocated = None;

        for lx in RefPicListName::ALL {
            let rpls = &ref_lists.rpl_ref_list[lx as usize];
            let rpl = &mut lists[lx as usize];
            let mut poc_base = poc;
            let mut prev_delta_poc_msb = 0;
            let mut j = 0;

            for (i, entry) in rpls.entries.iter().enumerate() {
                let (ref_poc, reference, use_msb) = match *entry {
                    RplEntry::ShortTerm {
                        abs_delta_poc_st,
                        strp_entry_sign_flag,
                    } => {
                        let delta =
                            delta_poc_st(abs_delta_poc_st, strp_entry_sign_flag, i, weighted_pred);
                        poc_base = poc_base.wrapping_add(delta);
                        (poc_base, FrameFlags::SHORT_REF, true)
                    }
                    RplEntry::LongTerm { rpls_poc_lsb_lt } => {
                        let use_msb = msb_present(ref_lists, lx as usize, j);
                        let lt_poc = poc_lt(
                            &mut prev_delta_poc_msb,
                            poc,
                            ref_lists,
                            lx as usize,
                            j,
                            rpls_poc_lsb_lt,
                            max_poc_lsb,
                        )?;
                        j += 1;
                        (lt_poc, FrameFlags::LONG_REF, use_msb)
                    }
                    RplEntry::InterLayer { ilrp_idx } => {
                        log::warn!(
                            "Inter-layer reference (ilrp_idx {}) is not supported",
                            ilrp_idx
                        );
                        return Err(DpbError::UnsupportedFeature("inter-layer reference"));
                    }
                };

                self.add_candidate_ref(rpl, ref_poc, reference, use_msb)?;
            }

            if sh.collocated_list() == lx {
                match rpl.get(usize::from(sh.collocated_ref_idx)) {
                    Some(entry) => collocated = Some(entry.frame.handle()),
                    None => log::debug!(
                        "Collocated index {} out of range for {:?}",
                        sh.collocated_ref_idx,
                        lx
                    ),
                }
            }
        }

        let slot = &mut self.slots_mut()[current];
        slot.rpl[sh.slice_idx] = lists;
        if collocated.is_some() {
            slot.collocated_ref = collocated;
        }

        Ok(())
    }

    /// Points the CTBs of `sh` to its reference picture lists record.
    fn init_slice_rpl(&mut self, current: usize, sh: &SliceHeader) -> DpbResult<()> {
        let slot = &mut self.slots_mut()[current];

        if sh.slice_idx >= slot.rpl.len() {
            return Err(DpbError::InvalidData(format!(
                "slice index {} out of range, the picture has {} slices",
                sh.slice_idx,
                slot.rpl.len()
            )));
        }

        let rpl_tab = slot
            .rpl_tab
            .as_mut()
            .ok_or_else(|| anyhow!("current picture has no reference list table"))?;
        for &ctb_addr_rs in &sh.ctb_addr_in_curr_slice {
            let entry = rpl_tab.get_mut(ctb_addr_rs as usize).ok_or_else(|| {
                DpbError::InvalidData(format!("CTB address {} out of range", ctb_addr_rs))
            })?;
            *entry = sh.slice_idx as u32;
        }

        Ok(())
    }

    /// Adds the picture with `poc` to `list` and marks it with `reference`.
    fn add_candidate_ref(
        &mut self,
        list: &mut RefPicList<P>,
        poc: i32,
        reference: FrameFlags,
        use_msb: bool,
    ) -> DpbResult<()> {
        if list.is_full() {
            log::error!("Too many entries in reference picture list");
            return Err(DpbError::ReferenceOverflow(poc));
        }

        let handle = self.resolve(poc, use_msb)?;
        if Some(handle.index()) == self.current_index() {
            log::error!("Picture POC {} references itself", poc);
            return Err(DpbError::ReferenceOverflow(poc));
        }

        let slot = &mut self.slots_mut()[handle.index()];
        let frame = slot
            .frame_ref()
            .ok_or_else(|| anyhow!("reference slot {} holds no picture", handle.index()))?;

        list.push(RefPicEntry {
            poc,
            is_long_term: reference == FrameFlags::LONG_REF,
            frame,
        });
        slot.set_reference(reference);

        Ok(())
    }

    /// Finds the picture of the current decode sequence with `poc`, comparing only the LSBs
    /// unless `use_msb` is set.
    pub fn find_ref(&self, poc: i32, use_msb: bool) -> Option<SlotHandle> {
        let mask = if use_msb {
            !0
        } else {
            self.sps()?.max_pic_order_cnt_lsb() - 1
        };
        let seq_decode = self.seq_decode();

        self.slots()
            .iter()
            .find(|s| !s.is_free() && s.sequence() == seq_decode && (s.poc() & mask) == poc)
            .map(|s| s.handle())
    }

    /// Returns the picture with `poc`, synthesizing one if it is missing from the DPB.
    pub fn resolve(&mut self, poc: i32, use_msb: bool) -> DpbResult<SlotHandle> {
        match self.find_ref(poc, use_msb) {
            Some(handle) => Ok(handle),
            None => self.generate_missing_ref(poc),
        }
    }

    /// Creates a stand-in for a reference picture that is not in the DPB. The picture is
    /// filled with mid-grey and reported as fully decoded so nothing ever waits on it.
    fn generate_missing_ref(&mut self, poc: i32) -> DpbResult<SlotHandle> {
        log::warn!("Generating missing reference picture for POC {}", poc);

        let index = self.alloc_frame(1, true)?;
        let seq_decode = self.seq_decode();
        let slot = &mut self.slots_mut()[index];

        slot.poc = poc;
        slot.sequence = seq_decode;
        slot.flags = FrameFlags::empty();
        if let Some(progress) = slot.progress() {
            progress.report_finished();
        }

        Ok(slot.handle())
    }
}
