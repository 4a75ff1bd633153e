// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::TryReserveError;
use std::sync::Arc;

use anyhow::anyhow;
use thiserror::Error;

use crate::codec::h266::parser::ConformanceWindow;
use crate::codec::h266::parser::PictureHeader;
use crate::codec::h266::parser::Pps;
use crate::codec::h266::parser::Sps;
use crate::codec::h266::picture::FrameFlags;
use crate::codec::h266::picture::FrameRef;
use crate::codec::h266::picture::FrameSlot;
use crate::codec::h266::picture::MvField;
use crate::codec::h266::picture::SliceRefPicLists;
use crate::codec::h266::picture::SlotHandle;
use crate::codec::h266::progress::ProgressTracker;
use crate::video_frame::frame_pool::BufferPool;
use crate::video_frame::DecodedPicture;
use crate::video_frame::PlanarFrame;

/// Number of slots of the DPB: the maximum DPB size allowed by H.266, plus the
/// picture being decoded.
pub const MAX_DPB_SLOTS: usize = 17;

#[derive(Debug, Error)]
pub enum DpbError {
    #[error("out of memory while allocating a picture")]
    OutOfMemory,
    #[error("duplicate POC {0} in a sequence")]
    DuplicateInStream(i32),
    #[error("DPB is full")]
    ResourceExhausted,
    #[error("invalid reference to POC {0}")]
    ReferenceOverflow(i32),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TryReserveError> for DpbError {
    fn from(_: TryReserveError) -> Self {
        DpbError::OutOfMemory
    }
}

pub type DpbResult<T> = std::result::Result<T, DpbError>;

/// A picture leaving the DPB in output order.
pub struct OutputFrame<P> {
    pub picture: Arc<P>,
    pub poc: i32,
    pub sequence: u8,
    pub crop: ConformanceWindow,
}

impl<P> std::fmt::Debug for OutputFrame<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFrame")
            .field("poc", &self.poc)
            .field("sequence", &self.sequence)
            .field("crop", &self.crop)
            .finish()
    }
}

/// Result of one step of the output process.
#[derive(Debug)]
pub enum Output<P> {
    /// The next picture in output order.
    Frame(OutputFrame<P>),
    /// More pictures need to be decoded before the next one can be output.
    NotReady,
    /// Nothing is left to output.
    Finished,
}

/// Allocates the picture buffer of a new DPB slot. Returning `None` signals an allocation
/// failure.
pub type PictureAllocator<P> = Box<dyn FnMut(&Sps, &Pps) -> Option<P> + Send>;

pub struct Dpb<P> {
    /// Fixed set of slots. A slot is in use as long as it holds a picture.
    slots: Vec<FrameSlot<P>>,
    /// The active parameter sets.
    sps: Option<Sps>,
    pps: Option<Pps>,
    /// Sequence counter of the pictures being decoded. Incremented, modulo 256, on every
    /// sequence reset.
    seq_decode: u8,
    /// Sequence counter of the pictures being output. Lags behind `seq_decode` until all the
    /// pictures of the previous sequences have been output.
    seq_output: u8,
    /// Slot of the picture currently being decoded.
    current: Option<usize>,
    cur_poc: i32,
    /// Whether pictures are decoded by hardware, in which case we never touch their content.
    hwaccel: bool,
    alloc_cb: PictureAllocator<P>,
    mvf_pool: BufferPool<MvField>,
    rpl_tab_pool: BufferPool<u32>,
}

impl Dpb<PlanarFrame> {
    /// Creates a DPB storing its pictures in system memory.
    pub fn with_planar_frames() -> Self {
        Self::new(Box::new(PlanarFrame::new))
    }
}

impl<P: DecodedPicture> Dpb<P> {
    pub fn new(alloc_cb: PictureAllocator<P>) -> Self {
        Self {
            slots: (0..MAX_DPB_SLOTS).map(FrameSlot::new).collect(),
            sps: None,
            pps: None,
            seq_decode: 0,
            seq_output: 0,
            current: None,
            cur_poc: 0,
            hwaccel: false,
            alloc_cb,
            mvf_pool: BufferPool::new(0),
            rpl_tab_pool: BufferPool::new(0),
        }
    }

    /// Activates a new set of parameters. The per-picture buffer pools are resized if the
    /// picture geometry changed.
    pub fn set_params(&mut self, sps: Sps, pps: Pps) {
        let ctb_count = (pps.ctb_width(&sps) * pps.ctb_height(&sps)) as usize;

        self.mvf_pool.resize(pps.min_pu_count());
        self.rpl_tab_pool.resize(ctb_count);
        self.sps = Some(sps);
        self.pps = Some(pps);
    }

    pub fn sps(&self) -> Option<&Sps> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Pps> {
        self.pps.as_ref()
    }

    /// Set whether pictures are decoded by hardware.
    pub fn set_hwaccel(&mut self, hwaccel: bool) {
        self.hwaccel = hwaccel;
    }

    pub fn hwaccel(&self) -> bool {
        self.hwaccel
    }

    pub fn seq_decode(&self) -> u8 {
        self.seq_decode
    }

    pub fn seq_output(&self) -> u8 {
        self.seq_output
    }

    /// Returns all the slots, free or not.
    pub fn slots(&self) -> &[FrameSlot<P>] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [FrameSlot<P>] {
        &mut self.slots
    }

    /// Number of slots currently holding a picture.
    pub fn num_in_use(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    pub(crate) fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// POC of the picture being decoded, or of the last one if decoding is finished.
    pub fn cur_poc(&self) -> i32 {
        self.cur_poc
    }

    /// The slot of the picture being decoded.
    pub fn current(&self) -> Option<&FrameSlot<P>> {
        self.slots.get(self.current?)
    }

    /// Looks up the slot designated by `handle`, unless it has been recycled since.
    pub fn frame(&self, handle: SlotHandle) -> Option<&FrameSlot<P>> {
        self.slots
            .get(handle.index)
            .filter(|s| !s.is_free() && s.handle() == handle)
    }

    pub fn frame_mut(&mut self, handle: SlotHandle) -> Option<&mut FrameSlot<P>> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| !s.is_free() && s.handle() == handle)
    }

    pub fn frame_ref(&self, handle: SlotHandle) -> Option<FrameRef<P>> {
        self.frame(handle)?.frame_ref()
    }

    /// The collocated picture of the picture in `handle`, if set and still in the DPB.
    pub fn collocated(&self, handle: SlotHandle) -> Option<&FrameSlot<P>> {
        self.frame(self.frame(handle)?.collocated_ref()?)
    }

    /// Returns the reference picture lists used at luma position `(x0, y0)` of the picture in
    /// `handle`.
    pub fn ref_lists_at(
        &self,
        handle: SlotHandle,
        x0: u32,
        y0: u32,
    ) -> Option<&SliceRefPicLists<P>> {
        let (sps, pps) = (self.sps.as_ref()?, self.pps.as_ref()?);
        let log2_ctb_size = sps.ctb_log2_size_y();
        let x_cb = x0 >> log2_ctb_size;
        let y_cb = y0 >> log2_ctb_size;
        let ctb_addr_rs = y_cb * pps.ctb_width(sps) + x_cb;

        self.frame(handle)?.ref_lists(ctb_addr_rs as usize)
    }

    /// Finds a free slot and attaches a picture and fresh per-picture buffers to it.
    ///
    /// `num_slices` is the number of slices of the picture, and thus the number of reference
    /// picture list records to allocate.
    pub fn allocate_slot(&mut self, num_slices: usize) -> DpbResult<usize> {
        self.alloc_frame(num_slices, false)
    }

    pub(crate) fn alloc_frame(
        &mut self,
        num_slices: usize,
        neutral_fill: bool,
    ) -> DpbResult<usize> {
        let sps = self
            .sps
            .as_ref()
            .ok_or_else(|| anyhow!("cannot allocate a picture without an active SPS"))?;
        let pps = self
            .pps
            .as_ref()
            .ok_or_else(|| anyhow!("cannot allocate a picture without an active PPS"))?;

        let Some(index) = self.slots.iter().position(|s| s.is_free()) else {
            log::error!("Error allocating frame, DPB full.");
            return Err(DpbError::ResourceExhausted);
        };

        let mut picture = (self.alloc_cb)(sps, pps).ok_or(DpbError::OutOfMemory)?;
        if neutral_fill && !self.hwaccel {
            picture.fill_neutral(sps.bit_depth());
        }
        let ctb_count = (pps.ctb_width(sps) * pps.ctb_height(sps)) as usize;

        self.slots[index].occupy(Arc::new(picture), ProgressTracker::new());
        if let Err(e) = self.init_buffers(index, num_slices.max(1), ctb_count) {
            self.slots[index].release();
            return Err(e);
        }

        log::debug!("Allocated DPB slot {}", index);
        Ok(index)
    }

    fn init_buffers(
        &mut self,
        index: usize,
        num_slices: usize,
        ctb_count: usize,
    ) -> DpbResult<()> {
        let mut rpl = Vec::new();
        rpl.try_reserve_exact(num_slices)?;
        rpl.resize_with(num_slices, Default::default);

        let slot = &mut self.slots[index];
        slot.flags = FrameFlags::empty();
        slot.collocated_ref = None;
        slot.rpl = rpl;
        slot.mvf = Some(self.mvf_pool.alloc()?);
        // Every CTB initially refers to the first slice.
        slot.rpl_tab = Some(self.rpl_tab_pool.alloc()?);
        slot.ctb_count = ctb_count;

        Ok(())
    }

    /// Starts decoding a new picture of the current decode sequence.
    pub fn start_new_picture(&mut self, ph: &PictureHeader) -> DpbResult<SlotHandle> {
        let poc = ph.poc;
        let seq_decode = self.seq_decode;

        if self
            .slots
            .iter()
            .any(|s| !s.is_free() && s.sequence == seq_decode && s.poc == poc)
        {
            log::error!("Duplicate POC in a sequence: {}.", poc);
            return Err(DpbError::DuplicateInStream(poc));
        }

        // Whatever was being decoded before is done as far as the DPB is concerned.
        self.finish_picture();

        let index = self.allocate_slot(ph.num_slices)?;
        let crop = self.pps.as_ref().map(|pps| pps.conf_win).unwrap_or_default();

        let mut flags = FrameFlags::empty();
        if ph.pic_output_flag && !ph.no_output_before_recovery {
            flags |= FrameFlags::OUTPUT;
        }
        if !ph.non_ref_pic_flag {
            flags |= FrameFlags::SHORT_REF;
        }

        let slot = &mut self.slots[index];
        slot.flags = flags;
        slot.poc = poc;
        slot.sequence = seq_decode;
        slot.crop = crop;

        self.current = Some(index);
        self.cur_poc = poc;

        log::debug!(
            "Started picture POC {} (sequence {}) in slot {} with flags {:?}",
            poc,
            seq_decode,
            index,
            flags
        );

        Ok(slot.handle())
    }

    /// Clears `mask` from the flags of the slot at `index`, and releases it once no flag is
    /// left. The picture being decoded is only released once it is finished.
    pub(crate) fn unref_index(&mut self, index: usize, mask: FrameFlags) {
        let is_current = self.current == Some(index);
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };

        if slot.is_free() {
            return;
        }

        slot.flags.remove(mask);
        if slot.flags.is_empty() && !is_current {
            slot.release();
        }
    }

    /// Clears `mask` from the flags of the picture in `handle`. Returns `false` if the handle
    /// is stale.
    pub fn unref(&mut self, handle: SlotHandle, mask: FrameFlags) -> bool {
        if self.frame(handle).is_none() {
            return false;
        }

        self.unref_index(handle.index, mask);
        true
    }

    /// Marks every picture as unused for reference.
    pub fn clear_refs(&mut self) {
        log::debug!("Clearing all references");

        for index in 0..self.slots.len() {
            self.unref_index(index, FrameFlags::REF);
        }
    }

    /// Starts a new coded sequence: all references are dropped and the pictures that follow
    /// are tagged with a new sequence counter. Pictures of the previous sequence that are
    /// still waiting for output are kept.
    pub fn new_sequence(&mut self) {
        self.clear_refs();
        self.seq_decode = self.seq_decode.wrapping_add(1);

        log::debug!("New decode sequence {}", self.seq_decode);
    }

    /// Signals that the current picture has been fully submitted. It is released right away if
    /// it is neither a reference nor waiting for output.
    pub fn finish_picture(&mut self) {
        if let Some(index) = self.current.take() {
            self.unref_index(index, FrameFlags::empty());
        }
    }

    /// Gives up on the current picture. Threads waiting on its progress are released and its
    /// slot is freed.
    pub fn abort_picture(&mut self) {
        let Some(index) = self.current.take() else {
            return;
        };

        log::debug!("Aborting picture POC {}", self.slots[index].poc);

        if let Some(progress) = self.slots[index].progress() {
            progress.report_finished();
        }
        self.unref_index(index, FrameFlags::all());
    }

    /// Runs one step of the picture output process.
    ///
    /// If `no_output_of_prior_pics` is set, the pictures of the output sequence that were not
    /// selected for bumping are discarded without being output. Unless `flush` is set or an
    /// older sequence is still pending, pictures are kept until more of them wait for output
    /// than the DPB capacity.
    pub fn output_next(&mut self, no_output_of_prior_pics: bool, flush: bool) -> Output<P> {
        loop {
            if no_output_of_prior_pics {
                for index in 0..self.slots.len() {
                    let slot = &self.slots[index];
                    if !slot.is_free()
                        && !slot.flags.contains(FrameFlags::BUMPING)
                        && slot.poc != self.cur_poc
                        && slot.sequence == self.seq_output
                    {
                        log::debug!("Discarding POC {} without output", slot.poc);
                        self.unref_index(index, FrameFlags::OUTPUT);
                    }
                }
            }

            let mut nb_output = 0;
            let mut min: Option<(i32, usize)> = None;
            for (index, slot) in self.slots.iter().enumerate() {
                if slot.flags.contains(FrameFlags::OUTPUT) && slot.sequence == self.seq_output {
                    nb_output += 1;
                    if min.map_or(true, |(poc, _)| slot.poc < poc) {
                        min = Some((slot.poc, index));
                    }
                }
            }

            if !flush && self.seq_output == self.seq_decode {
                if let Some(sps) = &self.sps {
                    if nb_output <= sps.dpb_capacity() {
                        return Output::NotReady;
                    }
                }
            }

            if let Some((poc, index)) = min {
                let slot = &self.slots[index];
                let frame = slot.picture().map(|picture| OutputFrame {
                    picture: Arc::clone(picture),
                    poc,
                    sequence: slot.sequence,
                    crop: slot.crop,
                });

                self.unref_index(index, FrameFlags::OUTPUT | FrameFlags::BUMPING);

                if let Some(frame) = frame {
                    log::debug!("Output frame with POC {}.", poc);
                    return Output::Frame(frame);
                }
                continue;
            }

            if self.seq_output != self.seq_decode {
                self.seq_output = self.seq_output.wrapping_add(1);
                log::debug!("Moving on to output sequence {}", self.seq_output);
            } else {
                return Output::Finished;
            }
        }
    }

    /// Selects pictures for early output if the DPB holds as many pictures as its capacity,
    /// not counting the current one.
    pub fn bump(&mut self) {
        let Some(capacity) = self.sps.as_ref().map(Sps::dpb_capacity) else {
            return;
        };
        let poc = self.cur_poc;
        let seq_output = self.seq_output;
        let is_candidate =
            |s: &FrameSlot<P>| !s.flags.is_empty() && s.sequence == seq_output && s.poc != poc;

        let dpb = self.slots.iter().filter(|&s| is_candidate(s)).count();
        if dpb < capacity {
            return;
        }

        let min_poc = self
            .slots
            .iter()
            .filter(|&s| is_candidate(s) && s.flags.contains(FrameFlags::OUTPUT))
            .map(|s| s.poc)
            .min()
            .unwrap_or(i32::MAX);

        for slot in self.slots.iter_mut() {
            if slot.flags.contains(FrameFlags::OUTPUT)
                && slot.sequence == seq_output
                && slot.poc <= min_poc
            {
                log::debug!("Bumping picture POC {}", slot.poc);
                slot.flags.insert(FrameFlags::BUMPING);
            }
        }
    }

    /// Outputs every remaining picture, in output order.
    pub fn drain(&mut self) -> Vec<OutputFrame<P>> {
        log::debug!("Draining the DPB.");

        let mut frames = vec![];
        while let Output::Frame(frame) = self.output_next(false, true) {
            frames.push(frame);
        }

        frames
    }
}

impl<P> std::fmt::Debug for Dpb<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_use = self.slots.iter().filter(|s| !s.is_free()).collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("slots", &in_use)
            .field("seq_decode", &self.seq_decode)
            .field("seq_output", &self.seq_output)
            .field("current", &self.current)
            .finish()
    }
}
