//! Syscall number to name translation.

use std::borrow::Cow;

use syscalls::Sysno;

/// Returns the name of a syscall on the running architecture.
///
/// Numbers the running architecture does not define render as `[unknown: N]`.
pub fn syscall_name(id: u32) -> Cow<'static, str> {
    match Sysno::new(id as usize) {
        Some(sysno) => Cow::Borrowed(sysno.name()),
        None => Cow::Owned(format!("[unknown: {id}]")),
    }
}
