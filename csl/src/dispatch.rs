// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event dispatch thread
//!
//! One thread waits on an epoll set holding a wakeup `EventFd` and every
//! registered device fd. Control requests arrive over a flume channel; the
//! sender writes the wakeup fd so the thread notices them. On each wake the
//! thread first drains control requests, then drains every ready device fd
//! through the kernel's dequeue call and hands each event to the router.
//!
//! ```text
//!   caller threads                         dispatch thread
//!   ──────────────                         ───────────────
//!   add_fd / remove_fd / stop
//!        │  PollControl ──► flume ──┐
//!        └─ wakeup.write(1) ──┐     │
//!                             ▼     ▼
//!                        epoll_wait ──► drain control ──► drain ready fds
//!                                                            │
//!                                                            ▼
//!                                                   router(&KernelEvent)
//! ```
//!
//! Events of one fd reach the router in kernel queue order. Nothing orders
//! events across fds.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use kmd::{Kernel, KernelEvent};
use log::{debug, error, info, warn};
use vmm_sys_util::eventfd::EventFd;

/// Requests consumed by the dispatch thread.
#[derive(Debug)]
pub enum PollControl {
    AddFd(RawFd),
    /// Stop polling `fd`; `done` is signalled once the fd left the set.
    RemoveFd {
        fd: RawFd,
        done: flume::Sender<()>,
    },
    Exit,
}

/// Receives every event dequeued by the dispatch thread.
pub type EventRouter = Box<dyn Fn(&KernelEvent) + Send>;

const WAKEUP_TOKEN: u64 = u64::MAX;

/// Handle on the running dispatch thread.
pub struct EventDispatcher {
    control: flume::Sender<PollControl>,
    wakeup: EventFd,
    thread: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    /// Start the dispatch thread. At most `max_fds` device fds are polled.
    pub fn start(kernel: Arc<dyn Kernel>, max_fds: usize, router: EventRouter) -> io::Result<Self> {
        let wakeup = EventFd::new(libc::EFD_NONBLOCK)?;
        let thread_wakeup = wakeup.try_clone()?;
        let epoll_fd = epoll::create(true)?;
        if let Err(e) = epoll::ctl(
            epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            thread_wakeup.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, WAKEUP_TOKEN),
        ) {
            let _ = epoll::close(epoll_fd);
            return Err(e);
        }

        let (control, requests) = flume::unbounded();
        let thread = thread::Builder::new()
            .name("csl_poll".to_string())
            .spawn(move || {
                let mut poller = Poller {
                    kernel,
                    epoll_fd,
                    wakeup: thread_wakeup,
                    requests,
                    fds: Vec::new(),
                    max_fds,
                    router,
                };
                poller.run();
                if let Err(e) = epoll::close(epoll_fd) {
                    warn!("closing poll set failed: {e}");
                }
            })?;

        info!("event dispatch thread started");
        Ok(EventDispatcher {
            control,
            wakeup,
            thread: Some(thread),
        })
    }

    fn send(&self, request: PollControl) -> io::Result<()> {
        self.control
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "dispatch thread gone"))?;
        self.wakeup.write(1)
    }

    /// Start polling a device fd.
    pub fn add_fd(&self, fd: RawFd) -> io::Result<()> {
        self.send(PollControl::AddFd(fd))
    }

    /// Stop polling a device fd. Returns once the thread dropped it, so the
    /// fd can be closed safely afterwards.
    pub fn remove_fd(&self, fd: RawFd) -> io::Result<()> {
        let (done, removed) = flume::bounded(1);
        self.send(PollControl::RemoveFd { fd, done })?;
        if self.thread.as_ref().is_some_and(|t| t.thread().id() == thread::current().id()) {
            // Called from a handler; the request is served after it returns.
            return Ok(());
        }
        removed
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "dispatch thread gone"))
    }

    /// Ask the thread to exit and join it.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Err(e) = self.send(PollControl::Exit) {
            warn!("failed to signal dispatch thread exit: {e}");
        }
        if thread.thread().id() == thread::current().id() {
            warn!("dispatch thread cannot join itself");
            return;
        }
        if thread.join().is_err() {
            error!("event dispatch thread panicked");
        }
        info!("event dispatch thread stopped");
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    kernel: Arc<dyn Kernel>,
    epoll_fd: RawFd,
    wakeup: EventFd,
    requests: flume::Receiver<PollControl>,
    fds: Vec<RawFd>,
    max_fds: usize,
    router: EventRouter,
}

impl Poller {
    fn run(&mut self) {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); self.max_fds + 1];
        loop {
            let count = match epoll::wait(self.epoll_fd, -1, &mut events) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poll wait failed: {e}");
                    return;
                }
            };

            let ready: Vec<u64> = events[..count].iter().map(|event| event.data).collect();
            if ready.contains(&WAKEUP_TOKEN) {
                match self.wakeup.read() {
                    Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                        warn!("wakeup read failed: {e}");
                    }
                    _ => {}
                }
            }
            if !self.handle_control() {
                return;
            }

            for token in ready {
                if token == WAKEUP_TOKEN {
                    continue;
                }
                let fd = token as RawFd;
                // A removal in this round invalidates the readiness.
                if self.fds.contains(&fd) {
                    self.drain(fd);
                }
            }
        }
    }

    /// Serve pending control requests. False once asked to exit.
    fn handle_control(&mut self) -> bool {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                PollControl::AddFd(fd) => self.add(fd),
                PollControl::RemoveFd { fd, done } => {
                    self.remove(fd);
                    let _ = done.send(());
                }
                PollControl::Exit => {
                    debug!("dispatch thread exiting");
                    return false;
                }
            }
        }
        true
    }

    fn add(&mut self, fd: RawFd) {
        if self.fds.contains(&fd) {
            warn!("fd {fd} already polled");
            return;
        }
        if self.fds.len() >= self.max_fds {
            error!("poll set full, dropping fd {fd}");
            return;
        }
        match epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
        ) {
            Ok(()) => {
                self.fds.push(fd);
                debug!("polling fd {fd}");
            }
            Err(e) => error!("failed to poll fd {fd}: {e}"),
        }
    }

    fn remove(&mut self, fd: RawFd) {
        let Some(position) = self.fds.iter().position(|polled| *polled == fd) else {
            warn!("fd {fd} not polled");
            return;
        };
        self.fds.swap_remove(position);
        if let Err(e) = epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_DEL,
            fd,
            epoll::Event::new(epoll::Events::empty(), 0),
        ) {
            warn!("failed to stop polling fd {fd}: {e}");
        }
    }

    fn drain(&self, fd: RawFd) {
        loop {
            match self.kernel.dequeue_event(fd) {
                Ok(Some(event)) => (self.router)(&event),
                Ok(None) => return,
                Err(e) => {
                    warn!("dequeue on fd {fd} failed: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use kmd::{FrameEvent, SimKernel};

    use super::*;

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_events_routed_in_fifo_order() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let entity = sim.entities().unwrap().remove(0);
        let fd = sim.open(&entity).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let router_seen = seen.clone();
        let mut dispatcher = EventDispatcher::start(
            sim.clone(),
            4,
            Box::new(move |event| router_seen.lock().unwrap().push(event.request_id())),
        )
        .unwrap();
        dispatcher.add_fd(fd).unwrap();

        for request_id in [1, 2] {
            sim.push_event(
                fd,
                KernelEvent::Sof(FrameEvent {
                    request_id,
                    ..Default::default()
                }),
            )
            .unwrap();
        }

        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        dispatcher.remove_fd(fd).unwrap();
        dispatcher.stop();
        sim.close(fd).unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let mut dispatcher = EventDispatcher::start(sim, 1, Box::new(|_| {})).unwrap();
        dispatcher.stop();
        dispatcher.stop();
    }
}
