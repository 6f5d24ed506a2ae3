//! Best-effort resolution of the acting process behind an event.

pub(crate) struct ProcessInfo {
    pub name: String,
    pub ppid: i32,
}

/// Snapshot of a pid's command name and parent. Returns None for vanished
/// or unreadable processes; events still go out without a name.
#[cfg(target_os = "linux")]
pub(crate) fn resolve(pid: i32) -> Option<ProcessInfo> {
    if pid <= 0 {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_line(&stat)
}

/// `/proc/<pid>/stat` is `pid (comm) state ppid ...`; comm may itself
/// contain parentheses, so split at the last closing one.
#[cfg(target_os = "linux")]
fn parse_stat_line(stat: &str) -> Option<ProcessInfo> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_ascii_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcessInfo { name, ppid })
}

#[cfg(target_os = "macos")]
pub(crate) fn resolve(pid: i32) -> Option<ProcessInfo> {
    use std::mem;

    if pid <= 0 {
        return None;
    }
    let mut mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID, pid];
    let mut kinfo: libc::kinfo_proc = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::kinfo_proc>();
    let rc = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            4,
            &mut kinfo as *mut _ as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc < 0 || len == 0 {
        return None;
    }
    let comm = unsafe { std::ffi::CStr::from_ptr(kinfo.kp_proc.p_comm.as_ptr()) };
    Some(ProcessInfo {
        name: comm.to_string_lossy().into_owned(),
        ppid: kinfo.kp_eproc.e_ppid,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub(crate) fn resolve(_pid: i32) -> Option<ProcessInfo> {
    None
}
