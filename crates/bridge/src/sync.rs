//! Version gating for authoritative updates arriving from the host.
//!
//! Subscribers use state versions to drop stale broadcasts and to detect
//! gaps that require a resync (a fresh snapshot). The gate itself keeps no
//! state beyond the last applied version.

/// What to do with an incoming versioned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// In-order successor (or first message): apply it.
    Apply,
    /// At or below the last applied version: drop it.
    Stale,
    /// Versions were skipped: apply nothing and request a snapshot.
    Gap { expected: u64, received: u64 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VersionGate {
    last_applied: Option<u64>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the gate from a snapshot; everything at or below the snapshot
    /// version is already covered.
    pub fn seed(snapshot_version: u64) -> Self {
        Self {
            last_applied: Some(snapshot_version),
        }
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Judges an incoming version and advances the gate only on `Apply`.
    /// A `Gap` leaves the gate unchanged; the caller resyncs and re-seeds.
    pub fn observe(&mut self, version: u64) -> VersionDecision {
        match self.last_applied {
            None => {
                self.last_applied = Some(version);
                VersionDecision::Apply
            }
            Some(last) if version <= last => VersionDecision::Stale,
            Some(last) if version == last + 1 => {
                self.last_applied = Some(version);
                VersionDecision::Apply
            }
            Some(last) => VersionDecision::Gap {
                expected: last + 1,
                received: version,
            },
        }
    }

    /// Re-seeds after a resync snapshot.
    pub fn resync(&mut self, snapshot_version: u64) {
        self.last_applied = Some(snapshot_version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_versions_apply_and_advance() {
        let mut gate = VersionGate::seed(3);
        assert_eq!(gate.observe(4), VersionDecision::Apply);
        assert_eq!(gate.observe(5), VersionDecision::Apply);
        assert_eq!(gate.last_applied(), Some(5));
    }

    #[test]
    fn stale_versions_are_dropped() {
        let mut gate = VersionGate::seed(5);
        assert_eq!(gate.observe(5), VersionDecision::Stale);
        assert_eq!(gate.observe(2), VersionDecision::Stale);
        assert_eq!(gate.last_applied(), Some(5));
    }

    #[test]
    fn gaps_request_resync_without_advancing() {
        let mut gate = VersionGate::seed(3);
        assert_eq!(
            gate.observe(7),
            VersionDecision::Gap {
                expected: 4,
                received: 7
            }
        );
        assert_eq!(gate.last_applied(), Some(3));

        gate.resync(7);
        assert_eq!(gate.observe(8), VersionDecision::Apply);
    }

    #[test]
    fn unseeded_gate_accepts_the_first_version_it_sees() {
        let mut gate = VersionGate::new();
        assert_eq!(gate.observe(12), VersionDecision::Apply);
        assert_eq!(gate.observe(12), VersionDecision::Stale);
    }
}
