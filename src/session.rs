// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode session state machine.
//!
//! A [`DecodeSession`] owns both hardware buffer queues and the two lookup
//! tables tying them together, and implements the submission, completion,
//! drain and flush protocols plus dynamic resolution renegotiation. Every
//! entry point (`decode`, `drain`, `flush`, [`DecodeSession::handle`]) must
//! run on the same logical sequence; nothing here blocks, and "waiting" is
//! always expressed as returning early and being re-entered by a later
//! event. [`crate::worker`] provides that sequencing for embedders that do
//! not already have it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;

use thiserror::Error;

use crate::device::BufferQueue;
use crate::device::CompletedBuffer;
use crate::device::Device;
use crate::device::DeviceEvent;
use crate::device::SlotId;
use crate::device::StreamCommand;
use crate::frame_pool::BlockId;
use crate::frame_pool::FrameLayout;
use crate::frame_pool::FramePool;
use crate::BitstreamBuffer;
use crate::DecodedFormat;
use crate::EncodedFormat;
use crate::Rect;
use crate::Resolution;

/// Outcome reported to a `decode` or `drain` caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// The request was cancelled by a flush before the hardware finished it.
    Aborted,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Decoding,
    Draining,
    /// Terminal. Only destroying the session gets out of this state.
    Error,
}

/// Single-shot completion callback for a `decode` or `drain` request.
pub type DecodeDone = Box<dyn FnOnce(DecodeStatus) + Send>;

/// Callback receiving every decoded picture, in display order.
pub type FrameReadyCb<R> = Box<dyn FnMut(DecodedFrame<R>) + Send>;

/// Callback invoked exactly once when the session enters [`SessionState::Error`].
pub type ErrorCb = Box<dyn FnMut() + Send>;

/// A decoded picture delivered to the application. Ownership of the picture
/// passes to the application here; the session keeps no reference to it.
#[derive(Debug)]
pub struct DecodedFrame<R> {
    pub frame: R,
    /// Correlation id of the bitstream buffer this picture was decoded from.
    pub bitstream_id: u64,
    pub visible_rect: Rect,
}

/// Asynchronous events re-entering the session.
pub enum SessionEvent<R> {
    /// The device poller woke up. `has_event` is set when the wakeup carries
    /// an in-band event in addition to (or instead of) buffer completions.
    DeviceWake { has_event: bool },
    /// The frame pool resolved an earlier [`FramePool::request_frame`].
    FrameReady { frame: R, block_id: BlockId },
}

enum DecodeRequest {
    Bitstream { buffer: BitstreamBuffer, done: DecodeDone },
    Drain { done: DecodeDone },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to negotiate the input format: {0}")]
    NegotiateFormat(#[source] anyhow::Error),
    #[error("failed to allocate input buffers: {0}")]
    AllocateInput(#[source] anyhow::Error),
    #[error("failed to start streaming on the input queue: {0}")]
    StreamOn(#[source] anyhow::Error),
    #[error("failed to start device polling: {0}")]
    StartPolling(#[source] anyhow::Error),
}

pub struct SessionConfig {
    pub format: EncodedFormat,
    pub output_format: DecodedFormat,
    pub input_buffer_size: usize,
    pub num_input_buffers: usize,
}

pub struct DecodeSession<I, O, D, P>
where
    I: BufferQueue<Resource = BitstreamBuffer>,
    O: BufferQueue,
    O::Resource: Clone,
    D: Device,
    P: FramePool,
{
    state: SessionState,
    input_queue: I,
    output_queue: O,
    device: D,
    frame_pool: P,
    output_format: DecodedFormat,

    /// Requests accepted but not yet submitted to the hardware.
    pending_requests: VecDeque<DecodeRequest>,
    /// Completion callbacks of submitted bitstream buffers, keyed by
    /// correlation id.
    pending_completions: HashMap<u64, DecodeDone>,
    /// Pictures currently queued to the hardware output queue. An entry
    /// exists iff a buffer is queued for that slot; removed exactly once,
    /// on completion.
    in_flight: HashMap<SlotId, O::Resource>,
    /// Stable mapping from pool storage block to hardware output slot.
    /// Grows up to the allocated output-buffer count; reset on every
    /// resolution change.
    block_slots: HashMap<BlockId, SlotId>,
    /// Completion of the drain whose stop command has been issued.
    drain_done: Option<DecodeDone>,

    frame_cb: FrameReadyCb<O::Resource>,
    error_cb: ErrorCb,

    coded_size: Resolution,
    visible_rect: Rect,
}

impl<I, O, D, P> DecodeSession<I, O, D, P>
where
    I: BufferQueue<Resource = BitstreamBuffer>,
    O: BufferQueue,
    O::Resource: Clone,
    D: Device,
    P: FramePool,
{
    /// Negotiates the input format, allocates input buffers and starts
    /// polling. The output queue stays unallocated until the device signals
    /// the first resolution change.
    pub fn start(
        config: SessionConfig,
        mut input_queue: I,
        output_queue: O,
        mut device: D,
        frame_pool: P,
        frame_cb: FrameReadyCb<O::Resource>,
        error_cb: ErrorCb,
    ) -> Result<Self, StartError> {
        device
            .negotiate_input_format(config.format, config.input_buffer_size)
            .map_err(StartError::NegotiateFormat)?;
        let num_allocated = input_queue
            .allocate(config.num_input_buffers)
            .map_err(StartError::AllocateInput)?;
        input_queue.stream_on().map_err(StartError::StreamOn)?;
        device.start_polling().map_err(StartError::StartPolling)?;
        log::debug!(
            "session started: {:?} input, {} input buffers of {} bytes",
            config.format,
            num_allocated,
            config.input_buffer_size
        );

        Ok(Self {
            state: SessionState::Idle,
            input_queue,
            output_queue,
            device,
            frame_pool,
            output_format: config.output_format,
            pending_requests: VecDeque::new(),
            pending_completions: HashMap::new(),
            in_flight: HashMap::new(),
            block_slots: HashMap::new(),
            drain_done: None,
            frame_cb,
            error_cb,
            coded_size: Resolution::default(),
            visible_rect: Rect::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn coded_size(&self) -> Resolution {
        self.coded_size
    }

    pub fn visible_rect(&self) -> Rect {
        self.visible_rect
    }

    /// Fd the embedder's poll loop should watch on the session's behalf.
    pub fn device_poll_fd(&self) -> BorrowedFd {
        self.device.poll_fd()
    }

    /// Queues `buffer` for decoding. `done` fires exactly once: with `Ok`
    /// when the hardware has consumed the payload, `Aborted` if a flush
    /// cancels it first, or `Error`.
    pub fn decode(&mut self, buffer: BitstreamBuffer, done: DecodeDone) {
        match self.state {
            SessionState::Error => {
                log::debug!("rejecting decode request in error state");
                done(DecodeStatus::Error);
                return;
            }
            SessionState::Idle => self.state = SessionState::Decoding,
            SessionState::Decoding | SessionState::Draining => (),
        }
        self.pending_requests.push_back(DecodeRequest::Bitstream { buffer, done });
        self.pump();
    }

    /// Flushes all in-flight work out of the hardware. `done` fires once
    /// every submitted input has produced its output.
    pub fn drain(&mut self, done: DecodeDone) {
        match self.state {
            SessionState::Idle => done(DecodeStatus::Ok),
            SessionState::Decoding => {
                self.pending_requests.push_back(DecodeRequest::Drain { done });
                self.pump();
            }
            SessionState::Draining | SessionState::Error => {
                log::debug!("rejecting drain request in {:?} state", self.state);
                done(DecodeStatus::Error);
            }
        }
    }

    /// Entry point for asynchronous completions: device poll wakeups and
    /// frame pool deliveries.
    pub fn handle(&mut self, event: SessionEvent<O::Resource>) {
        match event {
            SessionEvent::DeviceWake { has_event } => self.on_device_wake(has_event),
            SessionEvent::FrameReady { frame, block_id } => self.on_frame_ready(frame, block_id),
        }
    }

    /// Submits pending requests until the state machine, the backpressure
    /// gate or a drain marker stops it.
    fn pump(&mut self) {
        while self.state == SessionState::Decoding {
            let Some(request) = self.pending_requests.pop_front() else {
                break;
            };
            match request {
                DecodeRequest::Drain { done } => {
                    // The stop command must not overtake in-flight input;
                    // any of it may still trigger a resolution change.
                    if self.input_queue.num_queued() > 0 {
                        self.pending_requests.push_front(DecodeRequest::Drain { done });
                        break;
                    }
                    match self.device.stream_command(StreamCommand::Stop) {
                        Ok(()) => {
                            self.drain_done = Some(done);
                            self.state = SessionState::Draining;
                        }
                        Err(e) => {
                            log::error!("failed to issue the stop command: {:#}", e);
                            done(DecodeStatus::Error);
                            self.on_error();
                        }
                    }
                    // A drain marker always ends a pump pass.
                    break;
                }
                DecodeRequest::Bitstream { buffer, done } => {
                    let Some(slot) = self.input_queue.next_free_slot() else {
                        // Backpressure; resumes on the next input completion.
                        self.pending_requests.push_front(DecodeRequest::Bitstream { buffer, done });
                        break;
                    };
                    let bitstream_id = buffer.bitstream_id;
                    let bytes_used = buffer.data.len();
                    if let Err(e) = self.input_queue.submit(slot, buffer, bytes_used, bitstream_id)
                    {
                        log::error!("failed to submit bitstream buffer {}: {:#}", bitstream_id, e);
                        done(DecodeStatus::Error);
                        self.on_error();
                        break;
                    }
                    self.pending_completions.insert(bitstream_id, done);
                }
            }
        }
    }

    fn on_device_wake(&mut self, has_event: bool) {
        if self.state == SessionState::Error {
            return;
        }

        let mut input_completed = false;
        for completed in self.input_queue.drain_completed() {
            input_completed = true;
            match self.pending_completions.remove(&completed.timestamp) {
                Some(done) => done(DecodeStatus::Ok),
                None => {
                    log::debug!("input completion for unknown bitstream id {}", completed.timestamp)
                }
            }
        }

        let mut output_completed = false;
        for completed in self.output_queue.drain_completed() {
            output_completed = true;
            if !self.on_output_completed(completed) {
                return;
            }
        }

        if has_event {
            if let Some(DeviceEvent::SourceChange) = self.device.dequeue_event() {
                self.change_resolution();
                if self.state == SessionState::Error {
                    return;
                }
            }
        }

        if input_completed {
            self.pump();
        }
        if output_completed {
            self.try_fetch_frame();
        }
    }

    /// Returns `false` if the session died while handling the buffer.
    fn on_output_completed(&mut self, completed: CompletedBuffer) -> bool {
        let Some(frame) = self.in_flight.remove(&completed.slot) else {
            log::error!("output slot {:?} completed with no in-flight picture", completed.slot);
            self.on_error();
            return false;
        };

        if completed.bytes_used > 0 {
            (self.frame_cb)(DecodedFrame {
                frame,
                bitstream_id: completed.timestamp,
                visible_rect: self.visible_rect,
            });
        } else {
            // The device only asserts the no-more-pictures condition while a
            // buffer is resident in the output queue, so an empty buffer goes
            // straight back into its slot instead of to the application.
            if let Err(e) = self.output_queue.submit(completed.slot, frame.clone(), 0, 0) {
                log::error!("failed to recycle empty output buffer: {:#}", e);
                self.on_error();
                return false;
            }
            self.in_flight.insert(completed.slot, frame);
        }

        if completed.is_last {
            if let Some(done) = self.drain_done.take() {
                match self.device.stream_command(StreamCommand::Start) {
                    Ok(()) => {
                        log::debug!("drain completed");
                        done(DecodeStatus::Ok);
                        self.state = SessionState::Idle;
                        if !self.pending_requests.is_empty() {
                            self.state = SessionState::Decoding;
                            self.pump();
                        }
                    }
                    Err(e) => {
                        log::error!("failed to resume after drain: {:#}", e);
                        done(DecodeStatus::Error);
                        self.on_error();
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Tears down and reallocates the output queue for the coded size the
    /// device now reports, then reprovisions the frame pool.
    fn change_resolution(&mut self) {
        let coded_size = match self.device.query_coded_size() {
            Ok(size) if !size.is_empty() => size,
            Ok(_) => {
                log::error!("device reported an empty coded size");
                self.on_error();
                return;
            }
            Err(e) => {
                log::error!("failed to query the coded size: {:#}", e);
                self.on_error();
                return;
            }
        };
        let min_frames = match self.device.min_output_buffers() {
            Ok(count) => count,
            Err(e) => {
                log::error!("failed to query the minimum output buffer count: {:#}", e);
                self.on_error();
                return;
            }
        };
        log::debug!(
            "resolution change: {}x{}, at least {} output buffers",
            coded_size.width,
            coded_size.height,
            min_frames
        );

        if self.output_queue.num_allocated() > 0 {
            if let Err(e) = self.output_queue.stream_off() {
                log::error!("failed to stop the output queue: {:#}", e);
                self.on_error();
                return;
            }
            self.output_queue.deallocate();
        }
        self.in_flight.clear();
        self.block_slots.clear();

        let num_allocated = match self.output_queue.allocate(min_frames) {
            Ok(count) if count > 0 => count,
            Ok(_) => {
                log::error!("output queue allocated no buffers");
                self.on_error();
                return;
            }
            Err(e) => {
                log::error!("failed to allocate output buffers: {:#}", e);
                self.on_error();
                return;
            }
        };
        if let Err(e) = self.output_queue.stream_on() {
            log::error!("failed to restart the output queue: {:#}", e);
            self.on_error();
            return;
        }

        self.coded_size = coded_size;
        self.visible_rect = self.device.visible_rect(coded_size);
        self.frame_pool.resize(&FrameLayout {
            format: self.output_format,
            coded_size,
            num_frames: num_allocated,
        });
        self.try_fetch_frame();
    }

    fn try_fetch_frame(&mut self) {
        if self.output_queue.num_free() == 0 {
            return;
        }
        // A refusal only means a request is already outstanding.
        let _ = self.frame_pool.request_frame();
    }

    fn on_frame_ready(&mut self, frame: O::Resource, block_id: BlockId) {
        if self.state == SessionState::Error {
            return;
        }

        let slot = match self.block_slots.get(&block_id) {
            Some(slot) => *slot,
            None => {
                let slot = SlotId(self.block_slots.len() as u32);
                if slot.0 as usize >= self.output_queue.num_allocated() {
                    log::error!(
                        "pool block {:?} does not fit in {} output slots",
                        block_id,
                        self.output_queue.num_allocated()
                    );
                    self.on_error();
                    return;
                }
                self.block_slots.insert(block_id, slot);
                slot
            }
        };

        if let Err(e) = self.output_queue.submit(slot, frame.clone(), 0, 0) {
            log::error!("failed to submit picture to output slot {:?}: {:#}", slot, e);
            self.on_error();
            return;
        }
        self.in_flight.insert(slot, frame);

        // Keep the output queue as full as the pool allows.
        self.try_fetch_frame();
    }

    /// Hard reset for a seek or discontinuity. Discards all in-flight
    /// hardware work and reports `Aborted` to its callers. Requests that
    /// were never submitted stay queued and are pumped again once decoding
    /// resumes.
    pub fn flush(&mut self) {
        match self.state {
            SessionState::Idle => return,
            SessionState::Error => {
                log::debug!("ignoring flush request in error state");
                return;
            }
            SessionState::Decoding | SessionState::Draining => (),
        }

        // The hardware discards queued buffers without confirmation once the
        // queues stop; every callback has to be resolved before that.
        for (_, done) in self.pending_completions.drain() {
            done(DecodeStatus::Aborted);
        }
        if let Some(done) = self.drain_done.take() {
            done(DecodeStatus::Aborted);
        }

        self.device.stop_polling();
        if let Err(e) = self.input_queue.stream_off() {
            log::error!("failed to stop the input queue: {:#}", e);
            self.on_error();
            return;
        }
        let output_streaming = self.output_queue.num_allocated() > 0;
        if output_streaming {
            if let Err(e) = self.output_queue.stream_off() {
                log::error!("failed to stop the output queue: {:#}", e);
                self.on_error();
                return;
            }
        }
        self.in_flight.clear();

        if let Err(e) = self.input_queue.stream_on() {
            log::error!("failed to restart the input queue: {:#}", e);
            self.on_error();
            return;
        }
        if output_streaming {
            if let Err(e) = self.output_queue.stream_on() {
                log::error!("failed to restart the output queue: {:#}", e);
                self.on_error();
                return;
            }
        }
        if let Err(e) = self.device.start_polling() {
            log::error!("failed to restart device polling: {:#}", e);
            self.on_error();
            return;
        }

        self.state = SessionState::Idle;
        if output_streaming {
            self.try_fetch_frame();
        }
    }

    /// Idempotent transition into the terminal error state.
    fn on_error(&mut self) {
        if self.state == SessionState::Error {
            return;
        }
        self.state = SessionState::Error;
        (self.error_cb)();
    }
}

impl<I, O, D, P> Drop for DecodeSession<I, O, D, P>
where
    I: BufferQueue<Resource = BitstreamBuffer>,
    O: BufferQueue,
    O::Resource: Clone,
    D: Device,
    P: FramePool,
{
    fn drop(&mut self) {
        self.device.stop_polling();
        let _ = self.input_queue.stream_off();
        if self.output_queue.num_allocated() > 0 {
            let _ = self.output_queue.stream_off();
        }
        self.input_queue.deallocate();
        self.output_queue.deallocate();
    }
}
