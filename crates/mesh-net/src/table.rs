use std::sync::Arc;

use indexmap::IndexMap;

use crate::peer::{Peer, PeerId};

/// The set of known peers, keyed by canonical hostname. Guarded by the mesh
/// read/write lock; iteration order is insertion order, which is also the
/// order hello frames advertise.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: IndexMap<Box<str>, Arc<Peer>>,
    next_id: u32,
}

impl PeerTable {
    /// Idempotent insert. Returns the entry and whether it was created.
    pub(crate) fn insert(&mut self, name: &str, port: u16) -> (Arc<Peer>, bool) {
        if let Some(peer) = self.peers.get(name) {
            peer.set_port(port);
            return (peer.clone(), false);
        }
        let id = PeerId(self.next_id);
        self.next_id += 1;
        let peer = Arc::new(Peer::new(id, name.into(), port));
        self.peers.insert(name.into(), peer.clone());
        (peer, true)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.get(name).cloned()
    }

    pub(crate) fn by_id(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.values().find(|p| p.id == id).cloned()
    }

    /// Splice a peer out. The caller owns deferred teardown; the entry is
    /// simply no longer reachable by name.
    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<Peer>> {
        self.peers.shift_remove(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent_by_name() {
        let mut t = PeerTable::default();
        let (a, created) = t.insert("nodeb", 7000);
        assert!(created);
        let (b, created) = t.insert("nodeb", 0);
        assert!(!created);
        assert_eq!(a.id, b.id);
        assert_eq!(t.len(), 1);
        // port 0 must not clobber a known port
        assert_eq!(b.port(), 7000);
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut t = PeerTable::default();
        let (a, _) = t.insert("nodea", 1);
        t.remove("nodea").unwrap();
        let (b, _) = t.insert("nodea", 1);
        assert_ne!(a.id, b.id);
        assert!(t.by_id(a.id).is_none());
        assert_eq!(t.by_id(b.id).unwrap().name.as_ref(), "nodea");
    }
}
