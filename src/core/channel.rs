//! Per-consumer input channels.
//!
//! A channel is the transport between the dispatcher and one window
//! consumer: an event buffer the dispatcher publishes into, a dispatch
//! signal telling the consumer to look, and a finished signal coming back
//! on a pollable file descriptor.
//!
//! `LoopbackChannel` is the in-process implementation used by the headless
//! smoke binary and the test suite: a mutex-guarded buffer standing in for
//! the shared memory, and a non-blocking pipe pair for the two signals.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use nix::errno::Errno;

use crate::core::errors::TransportError;
use crate::core::event::{
    KeyAction, KeyFlags, MotionAction, MotionFlags, PointerCoords,
};
use crate::util::time::Nsecs;

/// A key event as it appears on the wire, after target flags are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPublication {
    pub device_id: i32,
    pub source: u32,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: Nsecs,
    pub event_time: Nsecs,
}

/// A motion event as it appears on the wire: header plus the first sample.
/// Further samples arrive through `append_motion_sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionPublication {
    pub device_id: i32,
    pub source: u32,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub edge_flags: i32,
    pub meta_state: i32,
    pub x_offset: f32,
    pub y_offset: f32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nsecs,
    pub event_time: Nsecs,
    pub pointer_ids: Vec<i32>,
    pub pointer_coords: Vec<PointerCoords>,
}

/// One sample appended after the initial motion publication.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendedSample {
    pub event_time: Nsecs,
    pub pointer_coords: Vec<PointerCoords>,
}

/// Dispatcher-side operations on a consumer channel.
pub trait InputChannel: Send + Sync {
    fn name(&self) -> &str;

    /// The pollable fd on which the consumer's finished signal arrives.
    fn receive_fd(&self) -> RawFd;

    fn publish_key(&self, publication: KeyPublication) -> Result<(), TransportError>;

    fn publish_motion(&self, publication: MotionPublication) -> Result<(), TransportError>;

    /// Append one more sample to the motion event currently in the buffer.
    fn append_motion_sample(
        &self,
        event_time: Nsecs,
        pointer_coords: &[PointerCoords],
    ) -> Result<(), TransportError>;

    /// Tell the consumer an event is ready.
    fn send_dispatch_signal(&self) -> Result<(), TransportError>;

    /// Consume one finished signal from the receive fd.
    fn receive_finished_signal(&self) -> Result<(), TransportError>;

    /// Reclaim the buffer after the consumer finished with it.
    fn reset(&self) -> Result<(), TransportError>;
}

// ============================================================================
// Loopback implementation
// ============================================================================

/// What the consumer sees when it drains a loopback channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumedEvent {
    Key(KeyPublication),
    Motion {
        publication: MotionPublication,
        appended: Vec<AppendedSample>,
    },
}

#[derive(Debug, Default)]
struct LoopbackBuffer {
    key: Option<KeyPublication>,
    motion: Option<MotionPublication>,
    appended: Vec<AppendedSample>,
    /// Set once the consumer has taken the publication; later appends fail.
    consumed: bool,
}

impl LoopbackBuffer {
    fn occupied(&self) -> bool {
        self.key.is_some() || self.motion.is_some()
    }

    fn clear(&mut self) {
        self.key = None;
        self.motion = None;
        self.appended.clear();
        self.consumed = false;
    }
}

struct LoopbackShared {
    name: String,
    sample_capacity: usize,
    buffer: Mutex<LoopbackBuffer>,
}

/// Dispatcher half of an in-process channel pair.
pub struct LoopbackChannel {
    shared: Arc<LoopbackShared>,
    /// Dispatcher -> consumer: "an event is ready".
    signal_write: OwnedFd,
    /// Consumer -> dispatcher: "finished"; this is the pollable receive fd.
    finished_read: OwnedFd,
}

/// Consumer half of an in-process channel pair.
pub struct LoopbackConsumer {
    shared: Arc<LoopbackShared>,
    signal_read: OwnedFd,
    finished_write: OwnedFd,
}

fn nonblocking_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe().context("failed to create pipe")?;
    for fd in [&r, &w] {
        nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
            .context("failed to set O_NONBLOCK")?;
    }
    Ok((r, w))
}

fn drain(fd: &OwnedFd) {
    let mut buf = [0u8; 16];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

impl LoopbackChannel {
    /// Create a connected channel/consumer pair.  `sample_capacity` bounds
    /// how many motion samples fit in one publication, mirroring the shared
    /// buffer limit of a real transport.
    pub fn pair(
        name: impl Into<String>,
        sample_capacity: usize,
    ) -> anyhow::Result<(Arc<LoopbackChannel>, LoopbackConsumer)> {
        let shared = Arc::new(LoopbackShared {
            name: name.into(),
            sample_capacity,
            buffer: Mutex::new(LoopbackBuffer::default()),
        });
        let (signal_read, signal_write) = nonblocking_pipe()?;
        let (finished_read, finished_write) = nonblocking_pipe()?;
        let channel = Arc::new(LoopbackChannel {
            shared: Arc::clone(&shared),
            signal_write,
            finished_read,
        });
        let consumer = LoopbackConsumer {
            shared,
            signal_read,
            finished_write,
        };
        Ok((channel, consumer))
    }
}

impl InputChannel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn receive_fd(&self) -> RawFd {
        self.finished_read.as_raw_fd()
    }

    fn publish_key(&self, publication: KeyPublication) -> Result<(), TransportError> {
        let mut buffer = self.shared.buffer.lock().unwrap();
        if buffer.occupied() {
            return Err(TransportError::NotReset);
        }
        buffer.key = Some(publication);
        Ok(())
    }

    fn publish_motion(&self, publication: MotionPublication) -> Result<(), TransportError> {
        let mut buffer = self.shared.buffer.lock().unwrap();
        if buffer.occupied() {
            return Err(TransportError::NotReset);
        }
        buffer.motion = Some(publication);
        Ok(())
    }

    fn append_motion_sample(
        &self,
        event_time: Nsecs,
        pointer_coords: &[PointerCoords],
    ) -> Result<(), TransportError> {
        let mut buffer = self.shared.buffer.lock().unwrap();
        if buffer.motion.is_none() {
            return Err(TransportError::NothingPublished);
        }
        if buffer.consumed {
            return Err(TransportError::AlreadyConsumed);
        }
        // The first sample occupies one slot of the shared buffer.
        if buffer.appended.len() + 1 >= self.shared.sample_capacity {
            return Err(TransportError::BufferFull);
        }
        buffer.appended.push(AppendedSample {
            event_time,
            pointer_coords: pointer_coords.to_vec(),
        });
        Ok(())
    }

    fn send_dispatch_signal(&self) -> Result<(), TransportError> {
        match nix::unistd::write(&self.signal_write, b"d") {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => Ok(()), // signal already pending
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn receive_finished_signal(&self) -> Result<(), TransportError> {
        let mut buf = [0u8; 1];
        match nix::unistd::read(self.finished_read.as_raw_fd(), &mut buf) {
            Ok(1) => Ok(()),
            Ok(_) => Err(TransportError::Io(Errno::EPIPE)),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.shared.buffer.lock().unwrap().clear();
        Ok(())
    }
}

impl LoopbackConsumer {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Fd the consumer can poll for dispatch signals.
    pub fn signal_fd(&self) -> RawFd {
        self.signal_read.as_raw_fd()
    }

    /// Take the published event, if any.  Marks the buffer consumed so
    /// further streaming appends are rejected, exactly like a consumer that
    /// has already read the shared memory.
    pub fn consume(&self) -> Option<ConsumedEvent> {
        drain(&self.signal_read);
        let mut buffer = self.shared.buffer.lock().unwrap();
        if !buffer.occupied() || buffer.consumed {
            return None;
        }
        buffer.consumed = true;
        if let Some(key) = buffer.key.clone() {
            return Some(ConsumedEvent::Key(key));
        }
        buffer.motion.clone().map(|publication| ConsumedEvent::Motion {
            publication,
            appended: buffer.appended.clone(),
        })
    }

    /// Signal the dispatcher that the consumed event is fully processed.
    pub fn finish(&self) -> Result<(), TransportError> {
        match nix::unistd::write(&self.finished_write, b"f") {
            Ok(_) => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Block up to `timeout_ms` for a dispatch signal.  Used by consumer
    /// threads in the smoke binary.
    pub fn wait_for_signal(&self, timeout_ms: i32) -> bool {
        let mut fds = [nix::libc::pollfd {
            fd: self.signal_read.as_raw_fd(),
            events: nix::libc::POLLIN,
            revents: 0,
        }];
        let res = unsafe { nix::libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        res > 0 && fds[0].revents & nix::libc::POLLIN != 0
    }
}
