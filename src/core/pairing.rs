//! Pairing Registry (spec §4.6 / C6).
//!
//! Maintains an involutive `reviewer <-> builder` mapping. Grounded on the
//! bidirectional id bookkeeping `core::worktree_manager` used to be built
//! on (tracking a worktree path back to the session that owns it and vice
//! versa) — the same "insert both directions, remove both directions"
//! shape, generalized from a 1:1 worktree/session map to a symmetric pair.

use dashmap::DashMap;

use super::session::TabId;

/// Bidirectional reviewer/builder association. `Clone` is cheap (`DashMap`
/// is itself reference-counted internally via its shard locks, but we wrap
/// it the same way `SessionManager` wraps its own maps for consistency).
#[derive(Default)]
pub struct PairingRegistry {
    peers: DashMap<TabId, TabId>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self { peers: DashMap::new() }
    }

    /// Binds `reviewer` and `builder` together. If either was already
    /// paired with someone else, that stale entry is removed first so the
    /// "no three-way associations" invariant holds.
    pub fn bind(&self, reviewer: &TabId, builder: &TabId) {
        self.unbind(reviewer);
        self.unbind(builder);
        self.peers.insert(reviewer.clone(), builder.clone());
        self.peers.insert(builder.clone(), reviewer.clone());
    }

    /// Removes both directions of `x`'s pairing, if any.
    pub fn unbind(&self, x: &TabId) {
        if let Some((_, other)) = self.peers.remove(x) {
            self.peers.remove(&other);
        }
    }

    pub fn peer(&self, x: &TabId) -> Option<TabId> {
        self.peers.get(x).map(|e| e.clone())
    }

    pub fn is_paired(&self, x: &TabId) -> bool {
        self.peers.contains_key(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(s: &str) -> TabId {
        TabId(s.to_string())
    }

    #[test]
    fn bind_is_symmetric() {
        let registry = PairingRegistry::new();
        let r = tab("reviewer-1");
        let b = tab("builder-1");
        registry.bind(&r, &b);

        assert_eq!(registry.peer(&r), Some(b.clone()));
        assert_eq!(registry.peer(&b), Some(r.clone()));
    }

    #[test]
    fn peer_of_peer_is_self() {
        let registry = PairingRegistry::new();
        let r = tab("reviewer-1");
        let b = tab("builder-1");
        registry.bind(&r, &b);

        let peer_of_peer = registry.peer(&registry.peer(&r).unwrap()).unwrap();
        assert_eq!(peer_of_peer, r);
    }

    #[test]
    fn unbind_removes_both_sides() {
        let registry = PairingRegistry::new();
        let r = tab("reviewer-1");
        let b = tab("builder-1");
        registry.bind(&r, &b);

        registry.unbind(&r);

        assert_eq!(registry.peer(&r), None);
        assert_eq!(registry.peer(&b), None);
    }

    #[test]
    fn rebinding_breaks_the_previous_pair_on_both_sides() {
        let registry = PairingRegistry::new();
        let r1 = tab("reviewer-1");
        let b1 = tab("builder-1");
        let b2 = tab("builder-2");

        registry.bind(&r1, &b1);
        registry.bind(&r1, &b2);

        assert_eq!(registry.peer(&r1), Some(b2));
        assert_eq!(registry.peer(&b1), None, "stale builder must be unpaired, not left dangling");
    }

    #[test]
    fn unpaired_tab_has_no_peer() {
        let registry = PairingRegistry::new();
        assert_eq!(registry.peer(&tab("lonely")), None);
        assert!(!registry.is_paired(&tab("lonely")));
    }
}
