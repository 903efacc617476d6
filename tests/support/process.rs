//! Process inspection helpers.

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Returns `true` while a process with `pid` exists.
pub fn process_exists(pid: u32) -> bool {
    i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), None).is_ok())
}
