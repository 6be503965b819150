// src/ice/store.rs
//! Local and remote candidate sets of one connection

use std::collections::HashSet;

use crate::error::IceResult;
use super::candidate::{CandidateInfo, CandidateKey};

/// Append-only candidate storage.
///
/// Local candidates are kept in discovery order. Remote candidates are
/// validated and deduplicated on insert.
#[derive(Debug, Clone)]
pub struct CandidateStore {
    components: u32,
    local: Vec<CandidateInfo>,
    remote: Vec<CandidateInfo>,
    remote_keys: HashSet<CandidateKey>,
}

impl CandidateStore {
    pub fn new(components: u32) -> Self {
        Self {
            components,
            local: Vec::new(),
            remote: Vec::new(),
            remote_keys: HashSet::new(),
        }
    }

    /// Append a discovered local candidate
    pub fn add_local(&mut self, candidate: CandidateInfo) {
        self.local.push(candidate);
    }

    /// Validate a candidate against this connection's component range
    pub fn validate(&self, candidate: &CandidateInfo) -> IceResult<()> {
        candidate.validate(self.components)
    }

    pub fn is_known_remote(&self, candidate: &CandidateInfo) -> bool {
        self.remote_keys.contains(&candidate.key())
    }

    /// Insert a remote candidate.
    ///
    /// Returns `Ok(false)` when the candidate was already known.
    pub fn add_remote(&mut self, candidate: CandidateInfo) -> IceResult<bool> {
        self.validate(&candidate)?;

        if !self.remote_keys.insert(candidate.key()) {
            return Ok(false);
        }

        self.remote.push(candidate);
        Ok(true)
    }

    /// Local candidates in discovery order
    pub fn snapshot(&self) -> Vec<CandidateInfo> {
        self.local.clone()
    }

    pub fn remote_snapshot(&self) -> Vec<CandidateInfo> {
        self.remote.clone()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IceError;

    fn candidate(component_id: u32, addr: &str) -> CandidateInfo {
        CandidateInfo::host("7", component_id, addr.parse().unwrap())
    }

    #[test]
    fn test_local_append_order() {
        let mut store = CandidateStore::new(2);
        store.add_local(candidate(1, "10.0.0.1:4000"));
        store.add_local(candidate(2, "10.0.0.1:4001"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].component_id, 1);
        assert_eq!(snapshot[1].component_id, 2);
    }

    #[test]
    fn test_add_remote_idempotent() {
        let mut store = CandidateStore::new(1);
        let c = candidate(1, "10.0.0.2:5000");

        assert!(store.add_remote(c.clone()).unwrap());
        let before = store.remote_snapshot();

        assert!(!store.add_remote(c.clone()).unwrap());
        assert_eq!(store.remote_count(), 1);
        assert_eq!(store.remote_snapshot(), before);
        assert!(store.is_known_remote(&c));
    }

    #[test]
    fn test_add_remote_rejects_out_of_range() {
        let mut store = CandidateStore::new(1);
        let err = store.add_remote(candidate(99, "10.0.0.2:5000")).unwrap_err();
        assert!(matches!(err, IceError::InvalidComponent { component_id: 99, components: 1 }));
        assert_eq!(store.remote_count(), 0);
    }
}
