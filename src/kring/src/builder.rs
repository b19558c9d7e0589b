use std::time::Duration;

use kring_sys::io_uring_params;

use crate::{Kernel, Linux, Ring, RingError, SetupFlags};

/// Queue depth used by [`Builder::default`].
pub const DEFAULT_ENTRIES: u32 = 2048;

/// Configures and creates a [`Ring`].
///
/// ```no_run
/// use std::time::Duration;
///
/// let _ring = kring::Builder::new(64)
///     .cq_entries(256)
///     .sqpoll(Duration::from_millis(10))
///     .build()?;
/// # Ok::<(), kring::RingError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Builder {
    entries: u32,
    cq_entries: u32,
    flags: SetupFlags,
    sq_thread_cpu: u32,
    sq_thread_idle: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new(DEFAULT_ENTRIES)
    }
}

impl Builder {
    /// A ring with `entries` submission slots. The kernel rounds up to a power of two and
    /// sizes the completion queue at twice that unless told otherwise.
    pub fn new(entries: u32) -> Self {
        Builder {
            entries,
            cq_entries: 0,
            flags: SetupFlags::empty(),
            sq_thread_cpu: 0,
            sq_thread_idle: 0,
        }
    }

    /// Sizes the completion queue explicitly. Must be at least the submission queue size.
    pub fn cq_entries(mut self, entries: u32) -> Self {
        self.cq_entries = entries;
        self.flags |= SetupFlags::CqSize;
        self
    }

    /// Clamps entry counts to the kernel maximum instead of failing.
    pub fn clamp(mut self) -> Self {
        self.flags |= SetupFlags::Clamp;
        self
    }

    /// Busy-waits for completions. Only valid for files opened with `O_DIRECT`.
    pub fn iopoll(mut self) -> Self {
        self.flags |= SetupFlags::IoPoll;
        self
    }

    /// Lets a kernel thread poll the submission queue. The thread goes to sleep after `idle`
    /// without work, and [`Ring::flush`] wakes it again.
    pub fn sqpoll(mut self, idle: Duration) -> Self {
        self.sq_thread_idle = idle.as_millis().min(u32::MAX as u128) as u32;
        self.flags |= SetupFlags::SqPoll;
        self
    }

    /// Pins the submission polling thread to `cpu`.
    pub fn sq_thread_cpu(mut self, cpu: u32) -> Self {
        self.sq_thread_cpu = cpu;
        self.flags |= SetupFlags::SqAffinity;
        self
    }

    pub(crate) fn params(&self) -> io_uring_params {
        io_uring_params {
            cq_entries: self.cq_entries,
            flags: self.flags.bits(),
            sq_thread_cpu: self.sq_thread_cpu,
            sq_thread_idle: self.sq_thread_idle,
            ..Default::default()
        }
    }

    /// Creates the ring on the running kernel.
    pub fn build(self) -> Result<Ring<Linux>, RingError> {
        self.build_with(Linux)
    }

    /// Creates the ring on the given kernel backend.
    pub fn build_with<K: Kernel>(self, kernel: K) -> Result<Ring<K>, RingError> {
        Ring::setup(kernel, self.entries, self.params())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_uses_default_depth() {
        let builder = Builder::default();
        assert_eq!(builder.entries, DEFAULT_ENTRIES);
        assert_eq!(builder.params(), io_uring_params::default());
    }

    #[test]
    fn options_set_matching_flags() {
        let params = Builder::new(8)
            .cq_entries(64)
            .sqpoll(Duration::from_millis(250))
            .sq_thread_cpu(3)
            .clamp()
            .params();

        assert_eq!(params.cq_entries, 64);
        assert_eq!(params.sq_thread_idle, 250);
        assert_eq!(params.sq_thread_cpu, 3);
        assert_eq!(
            SetupFlags::from_bits_retain(params.flags),
            SetupFlags::CqSize | SetupFlags::SqPoll | SetupFlags::SqAffinity | SetupFlags::Clamp
        );
    }
}
