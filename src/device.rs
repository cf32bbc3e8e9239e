// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collaborator traits for the kernel buffer-queue device.
//!
//! The session consumes the hardware through two seams: [`BufferQueue`],
//! instantiated once for the bitstream input queue and once for the decoded
//! picture output queue, and [`Device`] for everything that is not tied to a
//! single queue (format queries, stream commands, the in-band event queue and
//! polling control).

use std::os::fd::BorrowedFd;

use crate::EncodedFormat;
use crate::Rect;
use crate::Resolution;

/// Index of a hardware buffer slot within one queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// A buffer handed back by the hardware.
#[derive(Clone, Debug)]
pub struct CompletedBuffer {
    pub slot: SlotId,
    /// Number of payload bytes in the buffer. Zero on the output queue means
    /// the buffer carries no picture and must not be delivered.
    pub bytes_used: usize,
    /// Set on the final buffer produced by a drain.
    pub is_last: bool,
    /// The correlation value the buffer was submitted with.
    pub timestamp: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    /// Ask the device to flush all pending work and emit a "last" buffer.
    Stop,
    /// Resume decoding after a completed drain.
    Start,
}

/// In-band events dequeued from the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The source format changed; the output queue must be renegotiated.
    SourceChange,
}

/// One direction of the memory-mapped buffer-queue primitive.
///
/// The associated `Resource` is what a submitted slot carries: the input
/// instantiation owns its [`BitstreamBuffer`](crate::BitstreamBuffer) payloads
/// outright, while the output instantiation receives a cheaply cloneable
/// picture handle whose storage stays shared with the session.
pub trait BufferQueue {
    type Resource;

    /// Allocates `count` hardware buffers. Returns the number actually
    /// allocated, which may exceed the request.
    fn allocate(&mut self, count: usize) -> anyhow::Result<usize>;

    /// Releases all hardware buffers. Implies nothing is streaming anymore.
    fn deallocate(&mut self);

    fn stream_on(&mut self) -> anyhow::Result<()>;

    /// Stops streaming. The hardware discards any buffers still queued
    /// without reporting their completion.
    fn stream_off(&mut self) -> anyhow::Result<()>;

    fn num_free(&self) -> usize;

    fn num_queued(&self) -> usize;

    fn num_allocated(&self) -> usize;

    /// Picks a free slot for submission, or `None` if the queue is full.
    fn next_free_slot(&mut self) -> Option<SlotId>;

    /// Queues `resource` to the hardware in `slot`. `timestamp` is an opaque
    /// correlation value echoed back in the matching [`CompletedBuffer`].
    fn submit(
        &mut self,
        slot: SlotId,
        resource: Self::Resource,
        bytes_used: usize,
        timestamp: u64,
    ) -> anyhow::Result<()>;

    /// Non-blocking. Returns every buffer the hardware has completed since
    /// the last call, in completion order.
    fn drain_completed(&mut self) -> Vec<CompletedBuffer>;
}

/// Device-global controls and queries.
pub trait Device {
    /// Negotiates the compressed input format and the size of the buffers the
    /// input queue will allocate.
    fn negotiate_input_format(
        &mut self,
        format: EncodedFormat,
        buffer_size: usize,
    ) -> anyhow::Result<()>;

    /// Coded size of the stream as currently reported by the device.
    fn query_coded_size(&self) -> anyhow::Result<Resolution>;

    /// Minimum number of output buffers the device needs to make progress.
    fn min_output_buffers(&self) -> anyhow::Result<usize>;

    /// Visible rectangle within a coded frame of `coded_size`.
    fn visible_rect(&self, coded_size: Resolution) -> Rect;

    fn stream_command(&mut self, command: StreamCommand) -> anyhow::Result<()>;

    /// Non-blocking dequeue of the next pending in-band event, if any.
    fn dequeue_event(&mut self) -> Option<DeviceEvent>;

    fn start_polling(&mut self) -> anyhow::Result<()>;

    fn stop_polling(&mut self);

    /// Fd to poll for completions (readable) and in-band events (priority
    /// data). Used by the worker loop.
    fn poll_fd(&self) -> BorrowedFd;
}
