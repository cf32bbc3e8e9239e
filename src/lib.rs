// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode session orchestration for stateful hardware video decoders.
//!
//! The [`session::DecodeSession`] drives two hardware buffer queues (one for
//! compressed bitstream input, one for decoded pictures) through the decode,
//! drain, flush and resolution-change protocols. The kernel queue primitive,
//! the device controls and the picture storage pool are consumed through the
//! traits in [`device`] and [`frame_pool`]; this crate only implements the
//! orchestration above them.

pub mod device;
pub mod frame_pool;
pub mod session;
pub mod worker;

use std::str::FromStr;

use bytes::Bytes;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A rectangle within a coded frame, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl From<Resolution> for Rect {
    fn from(resolution: Resolution) -> Self {
        Self { left: 0, top: 0, width: resolution.width, height: resolution.height }
    }
}

/// Compressed formats a session can be started for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodedFormat {
    AV1,
    H264,
    H265,
    VP8,
    VP9,
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "av1" | "AV1" => Ok(EncodedFormat::AV1),
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" => Ok(EncodedFormat::H265),
            "vp8" | "VP8" => Ok(EncodedFormat::VP8),
            "vp9" | "VP9" => Ok(EncodedFormat::VP9),
            _ => Err("unrecognized input format. Valid values: av1, h264, h265, vp8, vp9"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

/// A chunk of compressed video data submitted for decoding.
///
/// The `bitstream_id` is an opaque correlation value chosen by the caller; it
/// travels through the hardware timestamp field and comes back both in the
/// input completion and on every picture decoded from this chunk.
#[derive(Clone, Debug)]
pub struct BitstreamBuffer {
    pub data: Bytes,
    pub bitstream_id: u64,
}

/// Default number of buffers allocated on the input queue.
pub const DEFAULT_NUM_INPUT_BUFFERS: usize = 16;

const INPUT_BUFFER_MAX_SIZE_1080P: usize = 1024 * 1024;
const INPUT_BUFFER_MAX_SIZE_4K: usize = 4 * INPUT_BUFFER_MAX_SIZE_1080P;

/// Returns the input buffer size to request for streams up to `resolution`.
pub fn input_buffer_size_for(resolution: Resolution) -> usize {
    if resolution.width > 1920 || resolution.height > 1088 {
        INPUT_BUFFER_MAX_SIZE_4K
    } else {
        INPUT_BUFFER_MAX_SIZE_1080P
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_buffer_size_scales_with_resolution() {
        assert_eq!(
            input_buffer_size_for(Resolution { width: 1920, height: 1088 }),
            INPUT_BUFFER_MAX_SIZE_1080P
        );
        assert_eq!(
            input_buffer_size_for(Resolution { width: 3840, height: 2160 }),
            INPUT_BUFFER_MAX_SIZE_4K
        );
    }
}
