use std::path::PathBuf;

/// Pairs a moved-from / moved-to record couple into one rename.
///
/// At most one pair is outstanding: a second moved-from while pending
/// overwrites the first (lossy, matches the kernel's delivery guarantees in
/// practice). The closing record's cookie is not compared against the
/// pending one — accepted drift, see DESIGN.md.
#[derive(Debug, Default)]
pub struct RenameCorrelator {
    pending: Option<(u32, PathBuf)>,
}

impl RenameCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm with the moved-from half. Non-zero cookies only.
    pub fn arm(&mut self, cookie: u32, old_path: PathBuf) {
        self.pending = Some((cookie, old_path));
    }

    /// Close the pending pair, returning the old path. The caller decides
    /// whether the current record completes a rename or merely clears state.
    pub fn take(&mut self) -> Option<PathBuf> {
        self.pending.take().map(|(_, old)| old)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_arm_overwrites_first() {
        let mut correlator = RenameCorrelator::new();
        correlator.arm(1, PathBuf::from("/a"));
        correlator.arm(2, PathBuf::from("/b"));
        assert_eq!(correlator.take().unwrap(), PathBuf::from("/b"));
        assert!(!correlator.is_pending());
    }

    #[test]
    fn take_on_idle_is_none() {
        let mut correlator = RenameCorrelator::new();
        assert!(correlator.take().is_none());
    }
}
