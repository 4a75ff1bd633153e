// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use bitflags::bitflags;

use crate::codec::h266::parser::ConformanceWindow;
use crate::codec::h266::parser::MAX_REF_ENTRIES;
use crate::codec::h266::progress::ProgressKind;
use crate::codec::h266::progress::ProgressListener;
use crate::codec::h266::progress::ProgressTracker;
use crate::video_frame::frame_pool::PooledBuffer;

bitflags! {
    /// Why a DPB slot is still in use. A slot with no flags set is free.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Waiting to be output.
        const OUTPUT = 1 << 0;
        const SHORT_REF = 1 << 1;
        const LONG_REF = 1 << 2;
        /// Selected for output ahead of the reordering delay to keep the DPB within bounds.
        const BUMPING = 1 << 3;
    }
}

impl FrameFlags {
    pub const REF: FrameFlags = FrameFlags::SHORT_REF.union(FrameFlags::LONG_REF);
}

/// Non-owning reference to a DPB slot. The generation lets us detect that the slot has been
/// recycled for another picture since the handle was taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Motion information of a 4x4 block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MvField {
    pub mv: [[i16; 2]; 2],
    pub ref_idx: [i8; 2],
    /// Bit 0 for L0, bit 1 for L1.
    pub pred_flag: u8,
}

/// A shared handle to a picture in the DPB, handed to the threads that use it as a reference.
///
/// Holding a `FrameRef` keeps the picture and its progress tracker alive even if the DPB slot
/// is recycled in the meantime.
pub struct FrameRef<P> {
    picture: Arc<P>,
    progress: Arc<ProgressTracker>,
    poc: i32,
    handle: SlotHandle,
}

impl<P> Clone for FrameRef<P> {
    fn clone(&self) -> Self {
        Self {
            picture: Arc::clone(&self.picture),
            progress: Arc::clone(&self.progress),
            poc: self.poc,
            handle: self.handle,
        }
    }
}

impl<P> FrameRef<P> {
    pub fn picture(&self) -> &Arc<P> {
        &self.picture
    }

    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn report_progress(&self, kind: ProgressKind, y: i32) {
        self.progress.report(kind, y)
    }

    pub fn report_finished(&self) {
        self.progress.report_finished()
    }

    pub fn check_progress(&self, kind: ProgressKind, y: i32) -> bool {
        self.progress.check(kind, y)
    }

    pub fn add_listener(&self, listener: Box<dyn ProgressListener>) {
        self.progress.add_listener(listener)
    }

    pub fn wait_progress(&self, kind: ProgressKind, y: i32) {
        self.progress.wait(kind, y)
    }

    /// Whether `self` and `other` designate the same picture.
    pub fn ptr_eq(&self, other: &FrameRef<P>) -> bool {
        Arc::ptr_eq(&self.picture, &other.picture)
    }
}

impl<P> std::fmt::Debug for FrameRef<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRef")
            .field("poc", &self.poc)
            .field("handle", &self.handle)
            .field("progress", &self.progress)
            .finish()
    }
}

pub struct RefPicEntry<P> {
    pub poc: i32,
    pub is_long_term: bool,
    pub frame: FrameRef<P>,
}

impl<P> Clone for RefPicEntry<P> {
    fn clone(&self) -> Self {
        Self {
            poc: self.poc,
            is_long_term: self.is_long_term,
            frame: self.frame.clone(),
        }
    }
}

impl<P> std::fmt::Debug for RefPicEntry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefPicEntry")
            .field("poc", &self.poc)
            .field("is_long_term", &self.is_long_term)
            .field("slot", &self.frame.handle)
            .finish()
    }
}

/// A reference picture list. Holds at most `MAX_REF_ENTRIES` entries.
pub struct RefPicList<P> {
    entries: Vec<RefPicEntry<P>>,
}

impl<P> Default for RefPicList<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P> Clone for RefPicList<P> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<P> std::fmt::Debug for RefPicList<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.entries).finish()
    }
}

impl<P> RefPicList<P> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_REF_ENTRIES
    }

    pub fn get(&self, idx: usize) -> Option<&RefPicEntry<P>> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RefPicEntry<P>> {
        self.entries.iter()
    }

    pub fn pocs(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.poc).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn push(&mut self, entry: RefPicEntry<P>) {
        debug_assert!(!self.is_full());
        self.entries.push(entry);
    }
}

/// The L0 and L1 lists of a slice.
pub type SliceRefPicLists<P> = [RefPicList<P>; 2];

/// One entry of the DPB.
pub struct FrameSlot<P> {
    index: usize,
    /// Bumped every time the slot is handed out to a new picture.
    generation: u32,
    picture: Option<Arc<P>>,
    progress: Option<Arc<ProgressTracker>>,
    pub(crate) poc: i32,
    pub(crate) sequence: u8,
    pub(crate) flags: FrameFlags,
    /// Reference picture lists, one record per slice.
    pub(crate) rpl: Vec<SliceRefPicLists<P>>,
    /// For each CTB in raster scan, the index of the slice record in `rpl`.
    pub(crate) rpl_tab: Option<PooledBuffer<u32>>,
    pub(crate) mvf: Option<PooledBuffer<MvField>>,
    pub(crate) collocated_ref: Option<SlotHandle>,
    pub(crate) ctb_count: usize,
    pub(crate) crop: ConformanceWindow,
}

impl<P> FrameSlot<P> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            generation: 0,
            picture: None,
            progress: None,
            poc: 0,
            sequence: 0,
            flags: FrameFlags::empty(),
            rpl: Vec::new(),
            rpl_tab: None,
            mvf: None,
            collocated_ref: None,
            ctb_count: 0,
            crop: Default::default(),
        }
    }

    /// Whether the slot holds no picture and can be handed out.
    pub fn is_free(&self) -> bool {
        self.picture.is_none()
    }

    pub fn handle(&self) -> SlotHandle {
        SlotHandle {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn picture(&self) -> Option<&Arc<P>> {
        self.picture.as_ref()
    }

    pub fn progress(&self) -> Option<&Arc<ProgressTracker>> {
        self.progress.as_ref()
    }

    pub fn collocated_ref(&self) -> Option<SlotHandle> {
        self.collocated_ref
    }

    pub fn ctb_count(&self) -> usize {
        self.ctb_count
    }

    pub fn crop(&self) -> ConformanceWindow {
        self.crop
    }

    pub fn mvf(&self) -> Option<&[MvField]> {
        self.mvf.as_deref()
    }

    pub fn mvf_mut(&mut self) -> Option<&mut [MvField]> {
        self.mvf.as_deref_mut()
    }

    /// Whether the slot is used for reference, either short or long term.
    pub fn is_ref(&self) -> bool {
        self.flags.intersects(FrameFlags::REF)
    }

    /// Returns a shared handle to the picture, if the slot is in use.
    pub fn frame_ref(&self) -> Option<FrameRef<P>> {
        Some(FrameRef {
            picture: Arc::clone(self.picture.as_ref()?),
            progress: Arc::clone(self.progress.as_ref()?),
            poc: self.poc,
            handle: self.handle(),
        })
    }

    /// Returns the reference picture lists of the slice covering CTB `ctb_addr_rs`.
    pub fn ref_lists(&self, ctb_addr_rs: usize) -> Option<&SliceRefPicLists<P>> {
        let slice_idx = *self.rpl_tab.as_ref()?.get(ctb_addr_rs)?;
        self.rpl.get(slice_idx as usize)
    }

    /// Replaces the reference marking of the slot with `reference`, which must be `SHORT_REF`,
    /// `LONG_REF` or empty.
    pub(crate) fn set_reference(&mut self, reference: FrameFlags) {
        debug_assert!(FrameFlags::REF.contains(reference));
        log::debug!("Set reference of POC {} to {:?}", self.poc, reference);

        self.flags.remove(FrameFlags::REF);
        self.flags.insert(reference);
    }

    /// Hands the slot out to a new picture.
    pub(crate) fn occupy(&mut self, picture: Arc<P>, progress: Arc<ProgressTracker>) {
        self.generation = self.generation.wrapping_add(1);
        self.picture = Some(picture);
        self.progress = Some(progress);
    }

    /// Drops the picture and everything attached to it.
    pub(crate) fn release(&mut self) {
        log::debug!("Releasing DPB slot {} (POC {})", self.index, self.poc);

        self.picture = None;
        self.progress = None;
        self.flags = FrameFlags::empty();
        self.rpl.clear();
        self.rpl_tab = None;
        self.mvf = None;
        self.collocated_ref = None;
        self.ctb_count = 0;
    }
}

impl<P> std::fmt::Debug for FrameSlot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("in_use", &self.picture.is_some())
            .field("poc", &self.poc)
            .field("sequence", &self.sequence)
            .field("flags", &self.flags)
            .field("collocated_ref", &self.collocated_ref)
            .finish()
    }
}
