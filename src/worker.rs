// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-threaded execution context for a [`DecodeSession`].
//!
//! The session itself is lock-free and must be driven from one sequence.
//! [`SessionWorker`] owns that sequence: a thread multiplexing an eventfd
//! (command queue wakeups) and the device poll fd through epoll, dispatching
//! both into the session it owns. [`WorkerHandle`] is the cloneable,
//! thread-safe front half that application threads and the frame pool post
//! into.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::device::BufferQueue;
use crate::device::Device;
use crate::frame_pool::BlockId;
use crate::frame_pool::FramePool;
use crate::session::DecodeDone;
use crate::session::DecodeSession;
use crate::session::SessionEvent;
use crate::BitstreamBuffer;

const WAKE_TOKEN: u64 = 1;
const DEVICE_TOKEN: u64 = 2;

pub enum SessionCommand<R> {
    Decode { buffer: BitstreamBuffer, done: DecodeDone },
    Drain { done: DecodeDone },
    Flush,
    FrameReady { frame: R, block_id: BlockId },
    Shutdown,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to create the wake eventfd: {0}")]
    WakeEventFd(nix::errno::Errno),
    #[error("failed to create the epoll context: {0}")]
    Epoll(nix::errno::Errno),
    #[error("failed to register an fd with epoll: {0}")]
    EpollAdd(nix::errno::Errno),
}

/// Posts commands to a running [`SessionWorker`].
pub struct WorkerHandle<R> {
    commands: Arc<Mutex<VecDeque<SessionCommand<R>>>>,
    wake: Arc<EventFd>,
}

// Derived Clone would bound R: Clone for no reason.
impl<R> Clone for WorkerHandle<R> {
    fn clone(&self) -> Self {
        Self { commands: self.commands.clone(), wake: self.wake.clone() }
    }
}

impl<R> WorkerHandle<R> {
    fn post(&self, command: SessionCommand<R>) {
        self.commands.lock().unwrap().push_back(command);
        if let Err(e) = self.wake.write(1) {
            log::error!("failed to wake the session worker: {}", e);
        }
    }

    pub fn decode(&self, buffer: BitstreamBuffer, done: DecodeDone) {
        self.post(SessionCommand::Decode { buffer, done });
    }

    pub fn drain(&self, done: DecodeDone) {
        self.post(SessionCommand::Drain { done });
    }

    pub fn flush(&self) {
        self.post(SessionCommand::Flush);
    }

    /// Delivery path for the frame pool once a requested frame exists.
    pub fn frame_ready(&self, frame: R, block_id: BlockId) {
        self.post(SessionCommand::FrameReady { frame, block_id });
    }
}

/// Owns the session thread; dropping it shuts the session down.
pub struct SessionWorker<R> {
    handle: WorkerHandle<R>,
    thread: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> SessionWorker<R> {
    /// Moves `session` onto a new thread and starts its event loop.
    pub fn spawn<I, O, D, P>(session: DecodeSession<I, O, D, P>) -> Result<Self, WorkerError>
    where
        I: BufferQueue<Resource = BitstreamBuffer> + Send + 'static,
        O: BufferQueue<Resource = R> + Send + 'static,
        O::Resource: Clone,
        D: Device + Send + 'static,
        P: FramePool + Send + 'static,
    {
        let wake = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_SEMAPHORE).map_err(WorkerError::WakeEventFd)?,
        );
        let handle = WorkerHandle { commands: Arc::new(Mutex::new(VecDeque::new())), wake };

        let thread_handle = handle.clone();
        let thread = std::thread::spawn(move || Self::run(session, thread_handle));

        Ok(Self { handle, thread: Some(thread) })
    }

    fn run<I, O, D, P>(mut session: DecodeSession<I, O, D, P>, handle: WorkerHandle<R>)
    where
        I: BufferQueue<Resource = BitstreamBuffer>,
        O: BufferQueue<Resource = R>,
        O::Resource: Clone,
        D: Device,
        P: FramePool,
    {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(WorkerError::Epoll).unwrap();
        epoll
            .add(handle.wake.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(WorkerError::EpollAdd)
            .unwrap();
        epoll
            .add(
                session.device_poll_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, DEVICE_TOKEN),
            )
            .map_err(WorkerError::EpollAdd)
            .unwrap();

        let mut events = [EpollEvent::empty(); 2];
        loop {
            let num_events = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(num_events) => num_events,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("session worker epoll wait failed: {}", e);
                    return;
                }
            };

            for event in events.iter().take(num_events) {
                match event.data() {
                    WAKE_TOKEN => {
                        if let Err(e) = handle.wake.read() {
                            log::error!("failed to clear the worker wake: {}", e);
                        }
                    }
                    DEVICE_TOKEN => session.handle(SessionEvent::DeviceWake {
                        has_event: event.events().contains(EpollFlags::EPOLLPRI),
                    }),
                    token => log::error!("unexpected epoll token {}", token),
                }
            }

            loop {
                let command = handle.commands.lock().unwrap().pop_front();
                match command {
                    Some(SessionCommand::Decode { buffer, done }) => session.decode(buffer, done),
                    Some(SessionCommand::Drain { done }) => session.drain(done),
                    Some(SessionCommand::Flush) => session.flush(),
                    Some(SessionCommand::FrameReady { frame, block_id }) => {
                        session.handle(SessionEvent::FrameReady { frame, block_id })
                    }
                    Some(SessionCommand::Shutdown) => return,
                    None => break,
                }
            }
        }
    }
}

impl<R> SessionWorker<R> {
    pub fn handle(&self) -> WorkerHandle<R> {
        self.handle.clone()
    }

    /// Stops the event loop and joins the thread. The session (and with it
    /// the device queues) is torn down on the worker thread.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.post(SessionCommand::Shutdown);
        if thread.join().is_err() {
            log::error!("session worker thread panicked");
        }
    }
}

impl<R> Drop for SessionWorker<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::session::tests::start_session;
    use crate::session::DecodeStatus;

    #[test]
    fn worker_dispatches_posted_commands() {
        let (session, harness) = start_session(4);
        let mut worker = SessionWorker::spawn(session).expect("worker spawn failed");
        let handle = worker.handle();

        let (status_tx, status_rx) = mpsc::channel();
        handle.decode(
            BitstreamBuffer { data: Bytes::from_static(b"\x00\x00\x01"), bitstream_id: 7 },
            Box::new(move |status| {
                let _ = status_tx.send(status);
            }),
        );

        // Wait for the worker to submit the buffer.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if harness.input.lock().unwrap().queued.len() == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "buffer never submitted");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(harness.input.lock().unwrap().queued[0].2, 7);

        // The flush aborts the submitted request, proving the loop kept
        // dispatching after the first command.
        handle.flush();
        let status = status_rx.recv_timeout(Duration::from_secs(5)).expect("no completion");
        assert_eq!(status, DecodeStatus::Aborted);

        worker.shutdown();
    }
}
