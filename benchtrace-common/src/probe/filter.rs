use super::Kernel;

/// Process id (tgid) half of a pid/tgid pair.
#[inline(always)]
pub fn pid_of(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

/// Thread id half of a pid/tgid pair.
#[inline(always)]
pub fn tid_of(pid_tgid: u64) -> u32 {
    pid_tgid as u32
}

#[inline(always)]
pub fn owned(pid_tgid: u64, target: u32) -> bool {
    pid_of(pid_tgid) == target
}

/// The caller's pid/tgid if it belongs to the traced process.
#[inline(always)]
pub fn current<K: Kernel>(k: &K) -> Option<u64> {
    let pid_tgid = k.pid_tgid();
    owned(pid_tgid, k.target_pid()).then_some(pid_tgid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_pid_tgid() {
        let pid_tgid = (4242u64 << 32) | 4250;
        assert_eq!(pid_of(pid_tgid), 4242);
        assert_eq!(tid_of(pid_tgid), 4250);
        assert!(owned(pid_tgid, 4242));
        assert!(!owned(pid_tgid, 4250));
    }
}
