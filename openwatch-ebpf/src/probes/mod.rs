pub mod openat2;

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_probe_read_user_str_bytes},
    macros::map,
    maps::RingBuf,
};
use openwatch_common::OpenEvent;

const EVENTS_BYTE_SIZE: u32 = 256 * 1024;

#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_BYTE_SIZE, 0);

#[inline(always)]
pub fn current_tgid() -> u64 {
    bpf_get_current_pid_tgid() >> 32
}

#[inline(always)]
pub fn current_tid() -> u32 {
    (bpf_get_current_pid_tgid() & 0xFFFFFFFF) as u32
}

/// Reserve a record, let `fill` write the file name, then submit it.
///
/// A full ring buffer drops the record silently.
#[inline(always)]
pub fn emit_event<F>(ret: i64, fill: F) -> Result<(), u32>
where
    F: FnOnce(&mut OpenEvent),
{
    let mut slot = EVENTS.reserve::<OpenEvent>(0).ok_or(1u32)?;
    let event = unsafe { &mut *slot.as_mut_ptr() };
    event.pid = current_tgid();
    event.ret = ret;
    fill(event);
    slot.submit(0);
    Ok(())
}

/// Copy a NUL-terminated user string into `dst`, leaving an empty string on fault.
#[inline(always)]
pub fn read_user_filename(ptr: *const u8, dst: &mut [u8]) {
    if ptr.is_null() || unsafe { bpf_probe_read_user_str_bytes(ptr, dst) }.is_err() {
        dst[0] = 0;
    }
}
