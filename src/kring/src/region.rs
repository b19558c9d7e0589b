use std::{
    mem::{align_of, size_of, ManuallyDrop},
    os::fd::{AsRawFd, RawFd},
    ptr::NonNull,
};

use libc::c_int;

use crate::{error::cvt, Kernel, RingError};

/// Kernel-backed shared memory owned by a ring: one successful map, released by exactly
/// one unmap. Dropping the region unmaps it.
#[derive(Debug)]
pub(crate) struct MappedRegion<K: Kernel> {
    kernel: K,
    base: NonNull<u8>,
    len: usize,
    name: &'static str,
}

impl<K: Kernel> MappedRegion<K> {
    /// Maps `len` bytes of `fd` at `offset`. On failure returns the positive OS error code.
    ///
    /// # Safety
    /// `fd` must be a live ring descriptor and `offset` one of the `IORING_OFF_*` values.
    pub(crate) unsafe fn map(
        kernel: &K,
        fd: RawFd,
        len: usize,
        offset: u64,
        name: &'static str,
    ) -> Result<Self, c_int> {
        let res = kernel.map(fd, len, offset);
        if res < 0 {
            return Err(-res as c_int);
        }

        let base = NonNull::new(res as *mut u8).ok_or(libc::EFAULT)?;
        tracing::trace!(region = name, len, "mapped ring region");

        Ok(Self {
            kernel: kernel.clone(),
            base,
            len,
            name,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// A typed pointer to the `T` that starts `offset` bytes into the region. The whole
    /// value must lie inside the mapping and be properly aligned.
    pub(crate) fn field<T>(&self, offset: u32) -> Result<NonNull<T>, RingError> {
        self.array(offset, 1)
    }

    /// A typed pointer to `count` consecutive `T`s starting `offset` bytes into the region.
    pub(crate) fn array<T>(&self, offset: u32, count: u32) -> Result<NonNull<T>, RingError> {
        let offset = offset as usize;
        let bytes = size_of::<T>().checked_mul(count as usize);
        let end = bytes.and_then(|bytes| offset.checked_add(bytes));

        match end {
            Some(end) if end <= self.len && offset % align_of::<T>() == 0 => {
                // in bounds, so the offset pointer stays within the mapping
                let ptr = unsafe { self.base.as_ptr().add(offset) };
                Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
            }
            _ => Err(RingError::Layout {
                region: self.name,
                offset,
                len: self.len,
            }),
        }
    }

    /// Unmaps the region, reporting the OS error code on failure. The region is gone
    /// either way.
    pub(crate) fn release(self) -> Result<(), c_int> {
        let this = ManuallyDrop::new(self);
        let kernel = unsafe { std::ptr::read(&this.kernel) };
        let res = unsafe { kernel.unmap(this.base, this.len) };
        tracing::trace!(region = this.name, len = this.len, "unmapped ring region");

        cvt(res).map(drop)
    }
}

impl<K: Kernel> Drop for MappedRegion<K> {
    fn drop(&mut self) {
        if let Err(errno) = cvt(unsafe { self.kernel.unmap(self.base, self.len) }) {
            tracing::warn!(region = self.name, errno, "failed to unmap ring region");
        }
    }
}

/// The ring descriptor. Dropping it closes the descriptor.
#[derive(Debug)]
pub(crate) struct RingFd<K: Kernel> {
    kernel: K,
    fd: RawFd,
}

impl<K: Kernel> RingFd<K> {
    pub(crate) fn new(kernel: &K, fd: RawFd) -> Self {
        Self {
            kernel: kernel.clone(),
            fd,
        }
    }

    /// Closes the descriptor, reporting the OS error code on failure.
    pub(crate) fn release(self) -> Result<(), c_int> {
        let this = ManuallyDrop::new(self);
        let kernel = unsafe { std::ptr::read(&this.kernel) };

        cvt(unsafe { kernel.close(this.fd) }).map(drop)
    }
}

impl<K: Kernel> AsRawFd for RingFd<K> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl<K: Kernel> Drop for RingFd<K> {
    fn drop(&mut self) {
        if let Err(errno) = cvt(unsafe { self.kernel.close(self.fd) }) {
            tracing::warn!(fd = self.fd, errno, "failed to close ring descriptor");
        }
    }
}

// The base pointer refers to memory shared with the kernel, not to thread-local state.
unsafe impl<K: Kernel + Send> Send for MappedRegion<K> {}

#[cfg(test)]
mod test {
    use kring_sys::{io_uring_params, IORING_OFF_SQES};

    use super::*;
    use crate::sim::SimKernel;

    fn mapped(kernel: &SimKernel) -> (RawFd, MappedRegion<SimKernel>) {
        let mut params = io_uring_params::default();
        let fd = kernel.setup(4, &mut params);
        assert!(fd >= 0);

        let len = params.sq_entries as usize * 64;
        let region = unsafe { MappedRegion::map(kernel, fd, len, IORING_OFF_SQES, "sqes") }.unwrap();
        (fd, region)
    }

    #[test]
    fn accessor_rejects_out_of_bounds_offsets() {
        let kernel = SimKernel::new();
        let (fd, region) = mapped(&kernel);

        assert!(region.field::<u32>(0).is_ok());
        assert!(region.array::<u64>(0, 32).is_ok());
        assert_eq!(
            region.array::<u64>(8, 32).unwrap_err(),
            RingError::Layout {
                region: "sqes",
                offset: 8,
                len: 256
            }
        );
        assert!(region.field::<u32>(256).is_err());
        assert!(region.field::<u32>(u32::MAX).is_err());

        drop(region);
        unsafe { kernel.close(fd) };
    }

    #[test]
    fn accessor_rejects_misaligned_offsets() {
        let kernel = SimKernel::new();
        let (fd, region) = mapped(&kernel);

        assert!(region.field::<u32>(2).is_err());
        assert!(region.field::<u64>(4).is_err());
        assert!(region.field::<u8>(3).is_ok());

        drop(region);
        unsafe { kernel.close(fd) };
    }

    #[test]
    fn drop_and_release_unmap_exactly_once() {
        let kernel = SimKernel::new();
        let (fd, region) = mapped(&kernel);
        drop(region);
        assert_eq!(kernel.stats().unmaps, 1);

        let len = 4 * 64;
        let region = unsafe { MappedRegion::map(&kernel, fd, len, IORING_OFF_SQES, "sqes") }.unwrap();
        assert_eq!(region.release(), Ok(()));
        assert_eq!(kernel.stats().unmaps, 2);
        assert_eq!(kernel.stats().live_mappings, 0);

        RingFd::new(&kernel, fd).release().unwrap();
        assert_eq!(kernel.stats().closes, 1);
    }
}
