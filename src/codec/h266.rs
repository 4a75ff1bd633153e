// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer and reference picture management for H.266/VVC.

pub mod dpb;
pub mod parser;
pub mod picture;
pub mod progress;
pub mod rpl;
