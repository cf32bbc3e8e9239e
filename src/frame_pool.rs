// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! External frame pool seam.
//!
//! Decoded pictures are not allocated by the session; they come from a pool
//! owned by whoever consumes the output (a compositor, a gralloc allocator,
//! a test fixture). The pool hands out pictures asynchronously: the session
//! requests one with [`FramePool::request_frame`] and receives it later as a
//! [`SessionEvent::FrameReady`](crate::session::SessionEvent) carrying the
//! picture and its [`BlockId`].

use crate::DecodedFormat;
use crate::Resolution;

/// Pool-stable identifier of a picture's underlying storage.
///
/// The same storage block keeps the same id for the lifetime of the pool,
/// which lets the session pin it to one hardware output slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u64);

/// Geometry the pool must satisfy after a resolution change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: DecodedFormat,
    pub coded_size: Resolution,
    pub num_frames: usize,
}

pub trait FramePool {
    /// Discards the current pool contents and reprovisions it for `layout`.
    /// Cancels any outstanding frame request.
    fn resize(&mut self, layout: &FrameLayout);

    /// Asks for one picture. Non-blocking; the picture arrives later through
    /// the session's event entry point. Returns `false` if a request is
    /// already outstanding, in which case this call is a no-op.
    fn request_frame(&mut self) -> bool;
}
