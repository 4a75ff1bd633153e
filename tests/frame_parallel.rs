// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame-parallel decoding: a picture is reconstructed on one thread while another one decodes
//! a picture referencing it.

use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use cros_vvc_refs::codec::h266::dpb::Dpb;
use cros_vvc_refs::codec::h266::dpb::Output;
use cros_vvc_refs::codec::h266::parser::PictureHeader;
use cros_vvc_refs::codec::h266::parser::Pps;
use cros_vvc_refs::codec::h266::parser::RefPicListStruct;
use cros_vvc_refs::codec::h266::parser::RefPicLists;
use cros_vvc_refs::codec::h266::parser::RplEntry;
use cros_vvc_refs::codec::h266::parser::SliceHeader;
use cros_vvc_refs::codec::h266::parser::SpsBuilder;
use cros_vvc_refs::codec::h266::progress::FnListener;
use cros_vvc_refs::codec::h266::progress::ProgressKind;
use cros_vvc_refs::video_frame::PlanarFrame;

const HEIGHT: u32 = 128;

fn new_dpb() -> Dpb<PlanarFrame> {
    let _ = env_logger::try_init();

    let sps = SpsBuilder::new()
        .dpb_capacity(4)
        .log2_max_pic_order_cnt_lsb(8)
        .log2_ctu_size(5)
        .resolution(64, HEIGHT)
        .build();
    let pps = Pps {
        pic_width_in_luma_samples: 64,
        pic_height_in_luma_samples: HEIGHT,
        ..Default::default()
    };

    let mut dpb = Dpb::with_planar_frames();
    dpb.set_params(sps, pps);
    dpb
}

fn picture_header(poc: i32) -> PictureHeader {
    PictureHeader {
        poc,
        pic_output_flag: true,
        num_slices: 1,
        ..Default::default()
    }
}

/// A slice covering the whole picture and referencing the picture `delta` POCs away.
fn slice_referencing(delta: i32) -> SliceHeader {
    let entries = if delta == 0 {
        vec![]
    } else {
        vec![RplEntry::ShortTerm {
            abs_delta_poc_st: delta.unsigned_abs() - 1,
            strp_entry_sign_flag: delta < 0,
        }]
    };

    SliceHeader {
        ctb_addr_in_curr_slice: (0..8).collect(),
        ref_pic_lists: RefPicLists {
            rpl_ref_list: [
                RefPicListStruct {
                    entries,
                    ltrp_in_header_flag: false,
                },
                Default::default(),
            ],
            ..Default::default()
        },
        collocated_from_l0_flag: true,
        ..Default::default()
    }
}

#[test]
fn dependent_picture_waits_for_reference_rows() {
    let mut dpb = new_dpb();

    let ph = picture_header(0);
    let ref_handle = dpb.start_new_picture(&ph).unwrap();
    dpb.build_rpl(&ph, &slice_referencing(0)).unwrap();
    let reference = dpb.frame_ref(ref_handle).unwrap();

    let ph = picture_header(1);
    let cur_handle = dpb.start_new_picture(&ph).unwrap();
    dpb.build_rpl(&ph, &slice_referencing(-1)).unwrap();

    let lists = dpb.ref_lists_at(cur_handle, 0, 64).unwrap();
    let entry = lists[0].get(0).unwrap();
    assert!(entry.frame.ptr_eq(&reference));
    assert_eq!(dpb.collocated(cur_handle).unwrap().poc(), 0);

    let log = Arc::new(Mutex::new(Vec::new()));

    let dependent = {
        let frame = entry.frame.clone();
        let log = Arc::clone(&log);
        thread::spawn(move || {
            for y in [16, 48, 96] {
                frame.wait_progress(ProgressKind::Pixel, y);
                assert!(frame.progress().progress(ProgressKind::Pixel) > y);
                log.lock().unwrap().push(format!("used {}", y));
            }
        })
    };

    let producer = {
        let frame = reference.clone();
        let log = Arc::clone(&log);
        thread::spawn(move || {
            for y in (16..HEIGHT as i32).step_by(16) {
                log.lock().unwrap().push(format!("decoded {}", y));
                frame.report_progress(ProgressKind::Pixel, y);
            }
            frame.report_finished();
        })
    };

    producer.join().unwrap();
    dependent.join().unwrap();

    let log = log.lock().unwrap();
    let position = |s: &str| log.iter().position(|l| l == s).unwrap();
    assert!(position("decoded 32") < position("used 16"));
    assert!(position("decoded 64") < position("used 48"));
    assert!(position("decoded 112") < position("used 96"));
}

#[test]
fn listeners_fire_once_on_the_reporting_thread() {
    let mut dpb = new_dpb();
    let ph = picture_header(0);
    let handle = dpb.start_new_picture(&ph).unwrap();
    let frame = dpb.frame_ref(handle).unwrap();

    let (tx, rx) = mpsc::channel();
    for y in [0, 40, 80] {
        let tx = tx.clone();
        frame.add_listener(FnListener::new(ProgressKind::Mv, y, move || {
            tx.send((y, thread::current().id())).unwrap();
        }));
    }
    drop(tx);
    assert_eq!(frame.progress().num_pending(ProgressKind::Mv), 3);

    let reporter = {
        let frame = frame.clone();
        thread::spawn(move || {
            frame.report_progress(ProgressKind::Mv, 50);
            frame.report_progress(ProgressKind::Mv, 90);
            thread::current().id()
        })
    };
    let reporter_id = reporter.join().unwrap();

    let mut fired = rx.iter().collect::<Vec<_>>();
    fired.sort_by_key(|(y, _)| *y);
    assert_eq!(
        fired.iter().map(|(y, _)| *y).collect::<Vec<_>>(),
        vec![0, 40, 80]
    );
    assert!(fired.iter().all(|(_, id)| *id == reporter_id));
    assert_eq!(frame.progress().num_pending(ProgressKind::Mv), 0);
}

#[test]
fn output_frames_stay_valid_after_release() {
    let mut dpb = new_dpb();

    let ph = PictureHeader {
        non_ref_pic_flag: true,
        ..picture_header(0)
    };
    dpb.start_new_picture(&ph).unwrap();
    dpb.finish_picture();

    let frame = match dpb.output_next(false, true) {
        Output::Frame(frame) => frame,
        other => panic!("unexpected output {:?}", other),
    };
    assert_eq!(dpb.num_in_use(), 0);

    let consumer = thread::spawn(move || frame.picture.planes()[0].height);
    assert_eq!(consumer.join().unwrap(), HEIGHT as usize);
}
