#![no_std]

/// Capacity of the file name buffer carried by every record.
pub const MAX_FILENAME_LEN: usize = 256;

/// Size of one record on the wire: pid (8) + ret (8) + file name (256).
pub const EVENT_SIZE: usize = 8 + 8 + MAX_FILENAME_LEN;

/// Record written by the kernel probes into the `EVENTS` ring buffer.
///
/// Entry probes leave `ret` at zero; only exit records carry the return value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenEvent {
    pub pid: u64,
    pub ret: i64,
    pub filename: [u8; MAX_FILENAME_LEN],
}

const _: () = assert!(core::mem::size_of::<OpenEvent>() == EVENT_SIZE);

#[cfg(feature = "user")]
unsafe impl aya::Pod for OpenEvent {}
