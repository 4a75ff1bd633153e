#![no_main]

use std::collections::HashSet;

use cros_vvc_refs::codec::h266::dpb::Dpb;
use cros_vvc_refs::codec::h266::dpb::Output;
use cros_vvc_refs::codec::h266::dpb::OutputFrame;
use cros_vvc_refs::codec::h266::parser::PictureHeader;
use cros_vvc_refs::codec::h266::parser::Pps;
use cros_vvc_refs::codec::h266::parser::RefPicListStruct;
use cros_vvc_refs::codec::h266::parser::RefPicLists;
use cros_vvc_refs::codec::h266::parser::RplEntry;
use cros_vvc_refs::codec::h266::parser::SliceHeader;
use cros_vvc_refs::codec::h266::parser::SpsBuilder;
use cros_vvc_refs::codec::h266::picture::FrameFlags;
use cros_vvc_refs::codec::h266::progress::ProgressKind;
use cros_vvc_refs::video_frame::PlanarFrame;
use libfuzzer_sys::fuzz_target;

/// Keeps the sequence counter from wrapping onto sequences still in the DPB.
const MAX_SEQUENCES: usize = 200;

/// Checks that pictures of a sequence come out in increasing POC order.
#[derive(Default)]
struct OutputOrder {
    last: Option<(u8, i32)>,
}

impl OutputOrder {
    fn push(&mut self, frame: &OutputFrame<PlanarFrame>) {
        if let Some((sequence, poc)) = self.last {
            if sequence == frame.sequence {
                assert!(frame.poc > poc, "POC {} output after {}", frame.poc, poc);
            }
        }
        self.last = Some((frame.sequence, frame.poc));
    }

    /// Whether a picture of `sequence` with `poc` could still be output in order.
    fn accepts(&self, sequence: u8, poc: i32) -> bool {
        !matches!(self.last, Some((s, p)) if s == sequence && poc <= p)
    }
}

fn check_unique_pocs(dpb: &Dpb<PlanarFrame>) {
    let mut seen = HashSet::new();
    for slot in dpb.slots().iter().filter(|s| !s.is_free()) {
        assert!(
            seen.insert((slot.poc(), slot.sequence())),
            "POC {} twice in sequence {}",
            slot.poc(),
            slot.sequence()
        );
    }
}

fn entry(b: u8) -> RplEntry {
    match b >> 6 {
        0 | 1 => RplEntry::ShortTerm {
            abs_delta_poc_st: u32::from(b & 0x1f),
            strp_entry_sign_flag: b & 0x20 != 0,
        },
        2 => RplEntry::LongTerm {
            rpls_poc_lsb_lt: u32::from(b & 0x3f),
        },
        _ => RplEntry::InterLayer { ilrp_idx: b & 0x3f },
    }
}

fn ref_lists(data: &mut impl Iterator<Item = u8>) -> RefPicLists {
    let mut lists = RefPicLists::default();
    for lx in 0..2 {
        let num = data.next().unwrap_or(0) % 18;
        let entries = data.by_ref().take(num as usize).map(entry).collect::<Vec<_>>();
        let num_lt = entries
            .iter()
            .filter(|e| matches!(e, RplEntry::LongTerm { .. }))
            .count();
        for _ in 0..num_lt {
            let b = data.next().unwrap_or(0);
            lists.delta_poc_msb_cycle_present_flag[lx].push(b & 1 != 0);
            lists.delta_poc_msb_cycle_lt[lx].push(u32::from(b >> 1));
        }
        lists.rpl_ref_list[lx] = RefPicListStruct {
            entries,
            ltrp_in_header_flag: false,
        };
    }
    lists
}

fuzz_target!(|data: &[u8]| {
    let mut data = data.iter().copied();
    let Some(config) = data.next() else {
        return;
    };

    let sps = SpsBuilder::new()
        .dpb_capacity(config % 16 + 1)
        .log2_max_pic_order_cnt_lsb(4 + (config >> 4) % 4)
        .log2_ctu_size(5)
        .resolution(64, 64)
        .build();
    let pps = Pps {
        pic_width_in_luma_samples: 64,
        pic_height_in_luma_samples: 64,
        ..Default::default()
    };
    let mut dpb = Dpb::with_planar_frames();
    dpb.set_params(sps, pps);

    let mut ph = PictureHeader::default();
    let mut handles = vec![];
    let mut order = OutputOrder::default();
    let mut num_sequences = 0;

    while let Some(op) = data.next() {
        match op % 10 {
            0 | 1 => {
                let poc = i32::from(data.next().unwrap_or(0) as i8);
                // A conforming stream never outputs a POC below one already output.
                let output = op & 0x10 != 0 && order.accepts(dpb.seq_decode(), poc);
                ph = PictureHeader {
                    poc,
                    pic_output_flag: output,
                    non_ref_pic_flag: op & 0x20 != 0,
                    no_output_before_recovery: op & 0x40 != 0,
                    num_slices: usize::from(op >> 6) + 1,
                    ref_pic_lists: Default::default(),
                };
                if let Ok(handle) = dpb.start_new_picture(&ph) {
                    handles.push(handle);
                }
            }
            2 | 3 => {
                let slice_idx = usize::from(data.next().unwrap_or(0) % 4);
                let sh = SliceHeader {
                    slice_idx,
                    ctb_addr_in_curr_slice: vec![u32::from(op >> 4)],
                    ref_pic_lists: ref_lists(&mut data),
                    collocated_from_l0_flag: op & 0x10 != 0,
                    collocated_ref_idx: op >> 5,
                };
                let _ = dpb.build_rpl(&ph, &sh);
            }
            4 => dpb.finish_picture(),
            5 => dpb.abort_picture(),
            6 => {
                if let Output::Frame(frame) = dpb.output_next(op & 0x10 != 0, op & 0x20 != 0) {
                    order.push(&frame);
                }
            }
            7 => dpb.bump(),
            8 => {
                if op & 0x10 != 0 && num_sequences < MAX_SEQUENCES {
                    num_sequences += 1;
                    dpb.new_sequence();
                } else {
                    dpb.clear_refs();
                }
            }
            _ => {
                let idx = usize::from(data.next().unwrap_or(0));
                if let Some(handle) = handles.get(idx % handles.len().max(1)) {
                    if let Some(frame) = dpb.frame_ref(*handle) {
                        frame.report_finished();
                        assert!(frame.check_progress(ProgressKind::Pixel, i32::MAX));
                    }
                    dpb.unref(*handle, FrameFlags::from_bits_truncate(op >> 4));
                }
            }
        }

        assert!(dpb.num_in_use() <= 17);
        check_unique_pocs(&dpb);
    }

    dpb.finish_picture();
    for frame in dpb.drain() {
        order.push(&frame);
    }
});
