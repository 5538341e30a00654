//! Entry/exit programs for `do_sys_openat2`.
//!
//! long do_sys_openat2(int dfd, const char __user *filename, struct open_how *how)
//!
//! Two flavours are built into the same object; userspace picks one pair:
//! - fentry/fexit: BTF trampolines, arguments are still readable on exit.
//! - kprobe/kretprobe: the return probe cannot see the arguments, so the
//!   entry stashes the file name per thread in `OPEN_ARGS`.

use aya_ebpf::{
    macros::{fentry, fexit, kprobe, kretprobe, map},
    maps::HashMap,
    programs::{FEntryContext, FExitContext, ProbeContext, RetProbeContext},
};
use aya_log_ebpf::debug;
use openwatch_common::MAX_FILENAME_LEN;

use super::{current_tid, emit_event, read_user_filename};

const MAX_IN_FLIGHT: u32 = 10240;

#[map]
static OPEN_ARGS: HashMap<u32, [u8; MAX_FILENAME_LEN]> =
    HashMap::with_max_entries(MAX_IN_FLIGHT, 0);

#[fentry(function = "do_sys_openat2")]
pub fn fentry_do_sys_openat2(ctx: FEntryContext) -> u32 {
    let filename: *const u8 = unsafe { ctx.arg(1) };
    match emit_event(0, |event| read_user_filename(filename, &mut event.filename)) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[fexit(function = "do_sys_openat2")]
pub fn fexit_do_sys_openat2(ctx: FExitContext) -> u32 {
    let filename: *const u8 = unsafe { ctx.arg(1) };
    // Return value follows the three arguments.
    let ret: i64 = unsafe { ctx.arg(3) };
    match emit_event(ret, |event| read_user_filename(filename, &mut event.filename)) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[kprobe]
pub fn kprobe_do_sys_openat2(ctx: ProbeContext) -> u32 {
    match try_kprobe_entry(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[kretprobe]
pub fn kretprobe_do_sys_openat2(ctx: RetProbeContext) -> u32 {
    match try_kprobe_exit(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[inline(always)]
fn try_kprobe_entry(ctx: &ProbeContext) -> Result<(), u32> {
    let ptr: *const u8 = ctx.arg(1).ok_or(1u32)?;
    let tid = current_tid();
    let mut filename = [0u8; MAX_FILENAME_LEN];
    read_user_filename(ptr, &mut filename);

    // Stash before emitting so a full ring buffer does not also lose the exit record.
    if OPEN_ARGS.insert(&tid, &filename, 0).is_err() {
        debug!(ctx, "OPEN_ARGS full, tid {}", tid);
    }
    emit_event(0, |event| event.filename = filename)
}

#[inline(always)]
fn try_kprobe_exit(ctx: &RetProbeContext) -> Result<(), u32> {
    let tid = current_tid();
    let ret: i64 = ctx.ret().ok_or(1u32)?;
    let filename = match unsafe { OPEN_ARGS.get(&tid) } {
        Some(name) => *name,
        None => {
            debug!(ctx, "openat2 return without entry, tid {}", tid);
            return Ok(());
        }
    };
    let _ = OPEN_ARGS.remove(&tid);
    emit_event(ret, |event| event.filename = filename)
}
