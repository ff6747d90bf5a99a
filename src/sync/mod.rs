//! Fence file descriptors
//!
//! Framebuffers carry two fences: the acquire fence, signaled once the producer finished
//! writing, and the release fence, signaled once the display finished reading. Both are
//! represented by a [`DrmFence`], which owns the underlying descriptors.
//!
//! Fences are waited on with `poll(2)`: a sync file becomes readable once signaled. Any other
//! pollable descriptor (like an eventfd) therefore works as a fence too.
use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    time::{Duration, Instant},
};

use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use smallvec::SmallVec;
use tracing::trace;

/// Result of a bounded fence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    /// Every descriptor of the fence signaled
    Signaled,
    /// The timeout expired first
    NotSignaled,
}

/// A fence backed by zero or more fence descriptors
///
/// A fence without descriptors is invalid and treated as already signaled. Merging two fences
/// that can not be combined by the kernel keeps both descriptors; the fence then signals once
/// every one of them did.
#[derive(Debug, Default)]
#[must_use = "this `DrmFence` should be awaited or handed on, dropping it loses the synchronization"]
pub struct DrmFence {
    fds: SmallVec<[OwnedFd; 2]>,
}

impl From<OwnedFd> for DrmFence {
    fn from(fd: OwnedFd) -> Self {
        DrmFence {
            fds: SmallVec::from_iter([fd]),
        }
    }
}

impl DrmFence {
    /// The invalid fence, signaled from the start
    pub fn no_fence() -> DrmFence {
        DrmFence::default()
    }

    /// Returns whether this fence holds at least one descriptor
    pub fn is_valid(&self) -> bool {
        !self.fds.is_empty()
    }

    /// Borrows the descriptor, if this fence consists of exactly one
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match self.fds.as_slice() {
            [fd] => Some(fd.as_fd()),
            _ => None,
        }
    }

    /// Waits up to `timeout` for the fence to signal
    ///
    /// A zero timeout only queries the current state.
    #[profiling::function]
    pub fn wait(&self, timeout: Duration) -> io::Result<FenceStatus> {
        let deadline = Instant::now().checked_add(timeout);
        for fd in &self.fds {
            let signaled = match deadline {
                Some(deadline) => poll_fd(fd, || {
                    timeout_ms(deadline.saturating_duration_since(Instant::now()))
                })?,
                None => poll_fd(fd, || -1)?,
            };
            if !signaled {
                trace!(?timeout, "Fence not signaled in time");
                return Ok(FenceStatus::NotSignaled);
            }
        }
        Ok(FenceStatus::Signaled)
    }

    /// Blocks until the fence signaled
    ///
    /// Not to be used on latency sensitive paths, see [`DrmFence::wait`].
    #[profiling::function]
    pub fn wait_forever(&self) -> io::Result<()> {
        for fd in &self.fds {
            poll_fd(fd, || -1)?;
        }
        Ok(())
    }

    /// Queries whether the fence signaled without blocking
    pub fn is_signaled(&self) -> bool {
        matches!(self.wait(Duration::ZERO), Ok(FenceStatus::Signaled))
    }

    /// Duplicates the descriptors into an independently owned fence
    pub fn dup(&self) -> io::Result<DrmFence> {
        let fds = self
            .fds
            .iter()
            .map(|fd| fd.try_clone())
            .collect::<io::Result<SmallVec<_>>>()?;
        Ok(DrmFence { fds })
    }

    /// Combines two fences into one signaling once both did
    ///
    /// The result is valid if either input was valid.
    pub fn merge(mut self, mut other: DrmFence) -> DrmFence {
        if !other.is_valid() {
            return self;
        }
        if !self.is_valid() {
            return other;
        }

        if let (Some(first), Some(second)) = (self.as_fd(), other.as_fd()) {
            match sync_merge(first, second) {
                Ok(fd) => return DrmFence::from(fd),
                Err(err) => trace!("Keeping composite fence, sync file merge failed: {}", err),
            }
        }

        self.fds.extend(other.fds.drain(..));
        self
    }

    /// Exports the fence as a single sync file
    ///
    /// Returns `None` for the invalid fence. Composite fences are merged by the kernel, which
    /// fails unless every descriptor is a sync file.
    pub fn export(&self) -> io::Result<Option<OwnedFd>> {
        let mut fds = self.fds.iter();
        let Some(first) = fds.next() else {
            return Ok(None);
        };
        let mut merged = first.try_clone()?;
        for fd in fds {
            merged = sync_merge(merged.as_fd(), fd.as_fd())?;
        }
        Ok(Some(merged))
    }
}

fn timeout_ms(timeout: Duration) -> i32 {
    let ms = (timeout.as_nanos() + 999_999) / 1_000_000;
    i32::try_from(ms).unwrap_or(i32::MAX)
}

// Returns whether the descriptor became readable before the timeout expired
fn poll_fd(fd: &OwnedFd, timeout: impl Fn() -> i32) -> io::Result<bool> {
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::IN)];
        match poll(&mut fds, timeout()) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[repr(C)]
struct SyncMergeData {
    name: [u8; 32],
    fd2: i32,
    fence: i32,
    flags: u32,
    pad: u32,
}

// _IOWR('>', 3, struct sync_merge_data)
const SYNC_IOC_MERGE: u32 = 0xC030_3E03;

fn sync_merge(first: BorrowedFd<'_>, second: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let mut data = SyncMergeData {
        name: [0; 32],
        fd2: second.as_raw_fd(),
        fence: -1,
        flags: 0,
        pad: 0,
    };
    data.name[..9].copy_from_slice(b"hwc_merge");

    // SAFETY: `data` matches the kernel's `struct sync_merge_data` and outlives the call.
    let ret = unsafe { libc::ioctl(first.as_raw_fd(), SYNC_IOC_MERGE as _, &mut data) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success the kernel returns a new descriptor owned by the caller.
    Ok(unsafe { OwnedFd::from_raw_fd(data.fence) })
}

#[cfg(test)]
mod tests {
    use std::{os::unix::io::OwnedFd, thread, time::Duration};

    use rustix::event::{eventfd, EventfdFlags};

    use super::{DrmFence, FenceStatus};

    fn pending() -> (DrmFence, OwnedFd) {
        let fd = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let signal = fd.try_clone().unwrap();
        (DrmFence::from(fd), signal)
    }

    fn signal(fd: &OwnedFd) {
        rustix::io::write(fd, &1u64.to_ne_bytes()).unwrap();
    }

    #[test]
    fn invalid_fence_is_signaled() {
        let fence = DrmFence::no_fence();
        assert!(!fence.is_valid());
        assert!(fence.is_signaled());
        assert_eq!(fence.wait(Duration::ZERO).unwrap(), FenceStatus::Signaled);
        assert!(fence.export().unwrap().is_none());
    }

    #[test]
    fn zero_timeout_does_not_block() {
        let (fence, _signal) = pending();
        assert!(fence.is_valid());
        assert_eq!(fence.wait(Duration::ZERO).unwrap(), FenceStatus::NotSignaled);
        assert_eq!(
            fence.wait(Duration::from_millis(5)).unwrap(),
            FenceStatus::NotSignaled
        );
    }

    #[test]
    fn signaled_fence_wakes_waiter() {
        let (fence, handle) = pending();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal(&handle);
        });
        assert_eq!(fence.wait(Duration::from_secs(5)).unwrap(), FenceStatus::Signaled);
        fence.wait_forever().unwrap();
        signaler.join().unwrap();
    }

    #[test]
    fn merge_validity() {
        assert!(!DrmFence::no_fence().merge(DrmFence::no_fence()).is_valid());
        let (a, _sa) = pending();
        assert!(a.merge(DrmFence::no_fence()).is_valid());
        let (b, _sb) = pending();
        assert!(DrmFence::no_fence().merge(b).is_valid());
        let (c, _sc) = pending();
        let (d, _sd) = pending();
        assert!(c.merge(d).is_valid());
    }

    #[test]
    fn merged_fence_waits_for_both() {
        let (first, first_signal) = pending();
        let (second, second_signal) = pending();
        signal(&first_signal);

        let merged = first.merge(second);
        assert!(!merged.is_signaled());
        assert_eq!(
            merged.wait(Duration::from_millis(10)).unwrap(),
            FenceStatus::NotSignaled
        );

        signal(&second_signal);
        assert!(merged.is_signaled());
    }

    #[test]
    fn dup_is_independent() {
        let (fence, handle) = pending();
        let copy = fence.dup().unwrap();
        drop(fence);
        assert!(copy.is_valid());
        assert!(!copy.is_signaled());
        signal(&handle);
        assert!(copy.is_signaled());
    }
}
