// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;

use crate::codec::h266::parser::Pps;
use crate::codec::h266::parser::Sps;
use crate::Resolution;

pub mod frame_pool;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

/// Requirements of the DPB on the pictures it stores.
pub trait DecodedPicture: Send + Sync + Debug + 'static {
    fn resolution(&self) -> Resolution;

    /// Fills every sample with the mid-range value for `bit_depth`. Used to synthesize
    /// reference pictures missing from the stream.
    fn fill_neutral(&mut self, bit_depth: u8);
}

#[derive(Debug, Clone)]
pub struct Plane {
    /// Width and height in samples.
    pub width: usize,
    pub height: usize,
    /// Distance between two rows, in bytes.
    pub stride: usize,
    pub data: Vec<u8>,
}

/// A picture stored in system memory with one buffer per plane. Samples deeper than 8 bits are
/// stored as little-endian 16-bit values.
#[derive(Debug, Clone)]
pub struct PlanarFrame {
    resolution: Resolution,
    bytes_per_sample: usize,
    planes: Vec<Plane>,
}

impl PlanarFrame {
    /// Allocates a frame for pictures of `pps` coded with `sps`. Returns `None` if memory
    /// could not be reserved.
    pub fn new(sps: &Sps, pps: &Pps) -> Option<Self> {
        let width = pps.pic_width_in_luma_samples as usize;
        let height = pps.pic_height_in_luma_samples as usize;
        let bytes_per_sample = if sps.pixel_shift() { 2 } else { 1 };
        let (hshift, vshift) = sps.chroma_shifts();

        let num_planes = if sps.chroma_format_idc == 0 { 1 } else { 3 };
        let mut planes = Vec::with_capacity(num_planes);
        for i in 0..num_planes {
            let (w, h) = if i == Y_PLANE {
                (width, height)
            } else {
                (
                    width.div_ceil(1 << hshift),
                    height.div_ceil(1 << vshift),
                )
            };

            let stride = w * bytes_per_sample;
            let mut data = Vec::new();
            data.try_reserve_exact(stride * h).ok()?;
            data.resize(stride * h, 0);
            planes.push(Plane {
                width: w,
                height: h,
                stride,
                data,
            });
        }

        Some(Self {
            resolution: Resolution {
                width: width as u32,
                height: height as u32,
            },
            bytes_per_sample,
            planes,
        })
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    /// Returns the sample at `(x, y)` of `plane`.
    pub fn sample(&self, plane: usize, x: usize, y: usize) -> u16 {
        let plane = &self.planes[plane];
        let offset = y * plane.stride + x * self.bytes_per_sample;
        match self.bytes_per_sample {
            1 => u16::from(plane.data[offset]),
            _ => u16::from_le_bytes([plane.data[offset], plane.data[offset + 1]]),
        }
    }
}

impl DecodedPicture for PlanarFrame {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn fill_neutral(&mut self, bit_depth: u8) {
        let value = 1u16 << (bit_depth.clamp(1, 16) - 1);

        if self.bytes_per_sample == 1 {
            for plane in &mut self.planes {
                plane.data.fill(value as u8);
            }
            return;
        }

        let bytes = value.to_le_bytes();
        for plane in self.planes.iter_mut().filter(|p| p.stride > 0) {
            let visible = plane.width * 2;
            for row in plane.data.chunks_exact_mut(plane.stride) {
                for sample in row[..visible].chunks_exact_mut(2) {
                    sample.copy_from_slice(&bytes);
                }
            }
        }
    }
}
