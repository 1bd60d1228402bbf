use std::collections::{HashMap, HashSet};
use crate::PeerId;

// The Tracker's in-memory picture of who holds what. It is a cache,
// authoritative only about what each peer claimed at its last
// registration; it is rebuilt from scratch on every election.
#[derive(Debug, Default)]
pub(crate) struct FileIndex {
    entries: HashMap<PeerId, HashSet<String>>,
}

impl FileIndex {

    pub fn new() -> Self {
        Self::default()
    }

    // Wholesale replacement of a peer's set, so adds and removals on the
    // peer side look the same.
    pub fn register(&mut self, peer: PeerId, files: impl IntoIterator<Item = String>) {
        self.entries.insert(peer, files.into_iter().collect());
    }

    // Linear scan over all peers; fine at this cluster size.
    pub fn search(&self, filename: &str) -> Vec<PeerId> {
        let mut holders: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, files)| files.contains(filename))
            .map(|(peer, _)| *peer)
            .collect();
        holders.sort_unstable();
        holders
    }

    // Defensive copy in wire shape, sorted for stable output.
    pub fn snapshot(&self) -> Vec<(PeerId, Vec<String>)> {
        let mut entries: Vec<(PeerId, Vec<String>)> = self
            .entries
            .iter()
            .map(|(peer, files)| {
                let mut files: Vec<String> = files.iter().cloned().collect();
                files.sort();
                (*peer, files)
            })
            .collect();
        entries.sort_unstable_by_key(|(peer, _)| *peer);
        entries
    }
}
