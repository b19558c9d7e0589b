#![deny(
    // missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports,
    dead_code
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]
#![allow(non_camel_case_types)]

//! Raw io_uring kernel ABI: the parameter block, entry layouts, and constants from
//! `<linux/io_uring.h>`, plus the [`syscall`] bridge that issues the ring-control calls.

pub mod syscall;

/// File offset used to map the submission ring control region.
pub const IORING_OFF_SQ_RING: u64 = 0x0000_0000;
/// File offset used to map the completion ring control region and its CQE table.
pub const IORING_OFF_CQ_RING: u64 = 0x0800_0000;
/// File offset used to map the submission entry array.
pub const IORING_OFF_SQES: u64 = 0x1000_0000;

/// Perform busy-waiting for I/O completion.
pub const IORING_SETUP_IOPOLL: u32 = 1 << 0;
/// Have a kernel thread poll the submission queue.
pub const IORING_SETUP_SQPOLL: u32 = 1 << 1;
/// Pin the submission polling thread to `sq_thread_cpu`.
pub const IORING_SETUP_SQ_AFF: u32 = 1 << 2;
/// Use `cq_entries` from the parameter block as the completion queue size.
pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
/// Clamp out-of-range entry counts instead of failing.
pub const IORING_SETUP_CLAMP: u32 = 1 << 4;

/// Wait for `min_complete` events before returning.
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
/// Wake up the submission polling thread.
pub const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;
/// Wait until there is space in the submission queue.
pub const IORING_ENTER_SQ_WAIT: u32 = 1 << 2;

/// Set in the SQ flags word when the polling thread sleeps and needs a wakeup.
pub const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;
/// Set in the SQ flags word when the completion queue has overflowed.
pub const IORING_SQ_CQ_OVERFLOW: u32 = 1 << 1;

/// The SQ and CQ rings may share one mapping.
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
/// The kernel never drops completion events.
pub const IORING_FEAT_NODROP: u32 = 1 << 1;
/// Data submitted for an operation is stable once enter returns.
pub const IORING_FEAT_SUBMIT_STABLE: u32 = 1 << 2;
/// `off` of -1 means "use the current file position" for reads and writes.
pub const IORING_FEAT_RW_CUR_POS: u32 = 1 << 3;
/// Operations run with the credentials of the submitting task.
pub const IORING_FEAT_CUR_PERSONALITY: u32 = 1 << 4;
/// Polling is used instead of worker threads where possible.
pub const IORING_FEAT_FAST_POLL: u32 = 1 << 5;

/// Do nothing; completes immediately with 0.
pub const IORING_OP_NOP: u8 = 0;
/// Vectored read, as `preadv2(2)`.
pub const IORING_OP_READV: u8 = 1;
/// Vectored write, as `pwritev2(2)`.
pub const IORING_OP_WRITEV: u8 = 2;
/// File sync, as `fsync(2)`.
pub const IORING_OP_FSYNC: u8 = 3;
/// Complete after a timeout or a number of other completions.
pub const IORING_OP_TIMEOUT: u8 = 11;
/// Open a file, as `openat(2)`.
pub const IORING_OP_OPENAT: u8 = 18;
/// Close a descriptor, as `close(2)`.
pub const IORING_OP_CLOSE: u8 = 19;
/// Read into a single buffer, as `pread(2)`.
pub const IORING_OP_READ: u8 = 22;
/// Write from a single buffer, as `pwrite(2)`.
pub const IORING_OP_WRITE: u8 = 23;

/// Issue on a registered file index rather than a descriptor.
pub const IOSQE_FIXED_FILE: u8 = 1 << 0;
/// Start only after all earlier entries complete.
pub const IOSQE_IO_DRAIN: u8 = 1 << 1;
/// Link with the next entry.
pub const IOSQE_IO_LINK: u8 = 1 << 2;
/// Link with the next entry, surviving failures.
pub const IOSQE_IO_HARDLINK: u8 = 1 << 3;
/// Always issue asynchronously.
pub const IOSQE_ASYNC: u8 = 1 << 4;

/// The upper 16 bits of the CQE flags carry a selected buffer id.
pub const IORING_CQE_F_BUFFER: u32 = 1 << 0;
/// More completions will follow for this request.
pub const IORING_CQE_F_MORE: u32 = 1 << 1;
/// The socket still had data after this request completed.
pub const IORING_CQE_F_SOCK_NONEMPTY: u32 = 1 << 2;
/// Notification completion for zero-copy sends.
pub const IORING_CQE_F_NOTIF: u32 = 1 << 3;

/// Register fixed buffers for `READ_FIXED`/`WRITE_FIXED`.
pub const IORING_REGISTER_BUFFERS: u32 = 0;
/// Release the registered buffers.
pub const IORING_UNREGISTER_BUFFERS: u32 = 1;
/// Register a table of descriptors for `IOSQE_FIXED_FILE`.
pub const IORING_REGISTER_FILES: u32 = 2;
/// Release the registered file table.
pub const IORING_UNREGISTER_FILES: u32 = 3;
/// Register an eventfd signalled on each completion.
pub const IORING_REGISTER_EVENTFD: u32 = 4;
/// Release the registered eventfd.
pub const IORING_UNREGISTER_EVENTFD: u32 = 5;

/// Byte offsets of the submission ring fields within the SQ control mapping.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_sqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Byte offsets of the completion ring fields within the CQ control mapping.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_cqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Parameter block passed to `io_uring_setup`; the kernel fills in entry counts,
/// features and the ring offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_uring_params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: io_sqring_offsets,
    pub cq_off: io_cqring_offsets,
}

/// A submission queue entry.
///
/// The kernel header declares most of these fields inside unions; the flattened form
/// keeps the same offsets and is what the operations used here need.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_uring_sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub __pad2: [u64; 1],
}

/// A completion queue entry.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_uring_cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

/// Kernel timespec used by timeout operations.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct __kernel_timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}
