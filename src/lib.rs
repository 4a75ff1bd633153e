// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture management for H.266/VVC decoders.
//!
//! [`codec::h266::dpb::Dpb`] keeps track of the decoded pictures, builds the reference picture
//! lists of each slice and decides when pictures are output. Decoded pictures can be shared with
//! other threads through [`codec::h266::picture::FrameRef`], whose progress tracker lets
//! frame-parallel decoders wait for the rows they reference.

pub mod codec;
pub mod video_frame;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
