//! The storage interface that Connection requires, plus the storage
//! variants and iteration helpers that are not tied to the shelf format.

use crate::error::{Error, Result};
use crate::record::{split_oids, unpack_record, Oid, ROOT_OID};
use crate::serialize::extract_class_name;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The capability set Connection holds.  Implemented by the shelf-backed
/// storage, the in-memory storage, and the remote client storage.
pub trait Storage {
    /// Return the record for this oid.  Fails with KeyNotFound if there is
    /// no such record, and may fail with ReadConflict to force the caller
    /// to sync.
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>>;

    /// Begin a commit.
    fn begin(&mut self);

    /// Stage one record in the commit underway.
    fn store(&mut self, oid: Oid, record: Vec<u8>);

    /// Conclude a commit.  Before anything becomes durable,
    /// `handle_invalidations` is called with the oids invalidated since
    /// this storage last synced; if it fails, the staged records are
    /// dropped and nothing durable changes.
    fn end(&mut self, handle_invalidations: &mut dyn FnMut(&[Oid]) -> Result<()>) -> Result<()>;

    /// Return the oids that should be invalidated since the last sync.
    fn sync(&mut self) -> Result<Vec<Oid>>;

    /// Return an oid not used by any record or any other outstanding
    /// new_oid call visible to this storage.
    fn new_oid(&mut self) -> Result<Oid>;

    /// Load several records; remote storages batch the round trip.
    fn bulk_load(&mut self, oids: &[Oid]) -> Result<Vec<Vec<u8>>> {
        oids.iter().map(|&oid| self.load(oid)).collect()
    }

    /// All oids with a live record, for storages that can enumerate them
    /// cheaply.  None means callers fall back to a reachability walk.
    fn live_oids(&mut self) -> Result<Option<Vec<Oid>>> {
        Ok(None)
    }

    /// Begin an incremental pack.  Returns false if this storage does not
    /// pack or a pack cannot start right now.
    fn start_pack(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Advance a running pack; returns true when there is no more pack
    /// work to do.
    fn pack_step(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Remove obsolete records, if this storage supports it.
    fn pack(&mut self) -> Result<()> {
        if self.start_pack()? {
            while !self.pack_step()? {}
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Breadth-first walk of the reference graph, loading records in batches
/// through bulk_load and deduplicating with a visited set.
pub struct GraphWalker {
    todo: BinaryHeap<Reverse<Oid>>,
    seen: FxHashSet<Oid>,
    loaded: VecDeque<(Oid, Vec<u8>)>,
    batch_size: usize,
}

impl GraphWalker {
    pub fn new(start: Oid, batch_size: usize) -> GraphWalker {
        let mut todo = BinaryHeap::new();
        todo.push(Reverse(start));
        GraphWalker {
            todo,
            seen: FxHashSet::default(),
            loaded: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn next(&mut self, storage: &mut dyn Storage) -> Result<Option<(Oid, Vec<u8>)>> {
        if self.loaded.is_empty() {
            self.fill(storage)?;
        }
        Ok(self.loaded.pop_front())
    }

    fn fill(&mut self, storage: &mut dyn Storage) -> Result<()> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some(Reverse(oid)) = self.todo.pop() else {
                break;
            };
            if self.seen.insert(oid) {
                batch.push(oid);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        let records = storage.bulk_load(&batch)?;
        for (oid, record) in batch.into_iter().zip(records) {
            let (_, _, refdata) = unpack_record(&record)?;
            for reference in split_oids(refdata)? {
                if !self.seen.contains(&reference) {
                    self.todo.push(Reverse(reference));
                }
            }
            self.loaded.push_back((oid, record));
        }
        Ok(())
    }
}

/// A pull-iterator over (oid, record) pairs.  Without a start oid it
/// covers the storage's full oid space (order unspecified); with one it
/// follows a breadth-first traversal of the reachable graph.
pub struct RecordWalk {
    mode: WalkMode,
}

enum WalkMode {
    Full { oids: Vec<Oid>, position: usize },
    Graph(GraphWalker),
}

impl RecordWalk {
    pub fn full(storage: &mut dyn Storage) -> Result<RecordWalk> {
        let mode = match storage.live_oids()? {
            Some(oids) => WalkMode::Full { oids, position: 0 },
            None => WalkMode::Graph(GraphWalker::new(ROOT_OID, DEFAULT_BATCH_SIZE)),
        };
        Ok(RecordWalk { mode })
    }

    pub fn reachable(start: Oid, batch_size: usize) -> RecordWalk {
        RecordWalk {
            mode: WalkMode::Graph(GraphWalker::new(start, batch_size)),
        }
    }

    pub fn next(&mut self, storage: &mut dyn Storage) -> Result<Option<(Oid, Vec<u8>)>> {
        match &mut self.mode {
            WalkMode::Full { oids, position } => {
                if *position >= oids.len() {
                    return Ok(None);
                }
                let oid = oids[*position];
                *position += 1;
                Ok(Some((oid, storage.load(oid)?)))
            }
            WalkMode::Graph(walker) => walker.next(storage),
        }
    }
}

/// The (oid, record) pairs whose records hold a reference to `referred`.
pub fn gen_referring_oid_record(
    storage: &mut dyn Storage,
    referred: Oid,
) -> Result<Vec<(Oid, Vec<u8>)>> {
    let mut referring = Vec::new();
    let mut walk = RecordWalk::full(storage)?;
    while let Some((oid, record)) = walk.next(storage)? {
        let (_, _, refdata) = unpack_record(&record)?;
        if split_oids(refdata)?.contains(&referred) {
            referring.push((oid, record));
        }
    }
    Ok(referring)
}

/// A full index of referring oids for each oid.  This might be large.
pub fn get_reference_index(storage: &mut dyn Storage) -> Result<FxHashMap<Oid, Vec<Oid>>> {
    let mut index: FxHashMap<Oid, Vec<Oid>> = FxHashMap::default();
    let mut walk = RecordWalk::full(storage)?;
    while let Some((oid, record)) = walk.next(storage)? {
        let (_, _, refdata) = unpack_record(&record)?;
        for reference in split_oids(refdata)? {
            index.entry(reference).or_default().push(oid);
        }
    }
    Ok(index)
}

/// Count the live records per class name.
pub fn get_census(storage: &mut dyn Storage) -> Result<FxHashMap<String, u64>> {
    let mut census = FxHashMap::default();
    let mut walk = RecordWalk::full(storage)?;
    while let Some((_, record)) = walk.next(storage)? {
        let (_, data, _) = unpack_record(&record)?;
        let class_name = extract_class_name(data)?.to_string();
        *census.entry(class_name).or_insert(0) += 1;
    }
    Ok(census)
}

/// A concrete Storage that keeps everything in memory, for tests.
#[derive(Default)]
pub struct MemoryStorage {
    records: FxHashMap<Oid, Vec<u8>>,
    transaction: FxHashMap<Oid, Vec<u8>>,
    next_oid: u64,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>> {
        self.records
            .get(&oid)
            .cloned()
            .ok_or(Error::KeyNotFound(oid))
    }

    fn begin(&mut self) {
        self.transaction.clear();
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) {
        self.transaction.insert(oid, record);
    }

    fn end(&mut self, _handle_invalidations: &mut dyn FnMut(&[Oid]) -> Result<()>) -> Result<()> {
        self.records.extend(self.transaction.drain());
        Ok(())
    }

    fn sync(&mut self) -> Result<Vec<Oid>> {
        Ok(Vec::new())
    }

    fn new_oid(&mut self) -> Result<Oid> {
        let oid = Oid(self.next_oid);
        self.next_oid += 1;
        Ok(oid)
    }

    fn live_oids(&mut self) -> Result<Option<Vec<Oid>>> {
        Ok(Some(self.records.keys().copied().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{join_oids, pack_record};

    fn put(storage: &mut MemoryStorage, oid: Oid, refs: &[Oid]) {
        storage.begin();
        storage.store(oid, pack_record(oid, b"x", &join_oids(refs)));
        storage.end(&mut |_| Ok(())).unwrap();
    }

    #[test]
    fn memory_storage_stages_until_end() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.new_oid().unwrap(), Oid(0));
        assert_eq!(storage.new_oid().unwrap(), Oid(1));
        storage.begin();
        storage.store(Oid(0), pack_record(Oid(0), b"root", &[]));
        assert!(matches!(storage.load(Oid(0)), Err(Error::KeyNotFound(_))));
        storage.end(&mut |_| Ok(())).unwrap();
        let record = storage.load(Oid(0)).unwrap();
        assert_eq!(unpack_record(&record).unwrap().1, b"root");
    }

    #[test]
    fn graph_walk_visits_reachable_once() {
        let mut storage = MemoryStorage::new();
        // 0 -> 1 -> 2, 0 -> 2, and an unreachable 9.
        put(&mut storage, Oid(0), &[Oid(1), Oid(2)]);
        put(&mut storage, Oid(1), &[Oid(2)]);
        put(&mut storage, Oid(2), &[]);
        put(&mut storage, Oid(9), &[]);
        let mut walk = RecordWalk::reachable(ROOT_OID, 2);
        let mut seen = Vec::new();
        while let Some((oid, _)) = walk.next(&mut storage).unwrap() {
            seen.push(oid);
        }
        assert_eq!(seen, vec![Oid(0), Oid(1), Oid(2)]);
    }

    #[test]
    fn reference_index_inverts_the_graph() {
        let mut storage = MemoryStorage::new();
        put(&mut storage, Oid(0), &[Oid(1), Oid(2)]);
        put(&mut storage, Oid(1), &[Oid(2)]);
        put(&mut storage, Oid(2), &[]);
        let referring = gen_referring_oid_record(&mut storage, Oid(2)).unwrap();
        let mut referrers: Vec<Oid> = referring.iter().map(|(oid, _)| *oid).collect();
        referrers.sort();
        assert_eq!(referrers, vec![Oid(0), Oid(1)]);
        let index = get_reference_index(&mut storage).unwrap();
        assert_eq!(index.get(&Oid(1)), Some(&vec![Oid(0)]));
        assert!(index.get(&Oid(0)).is_none());
    }

    #[test]
    fn census_counts_classes() {
        use crate::serialize::pack_state;
        let mut storage = MemoryStorage::new();
        for oid in [Oid(0), Oid(1), Oid(2)] {
            storage.begin();
            let class_name = if oid == Oid(0) { "Root" } else { "Leaf" };
            let data = pack_state(class_name, b"");
            storage.store(oid, pack_record(oid, &data, &[]));
            storage.end(&mut |_| Ok(())).unwrap();
        }
        let census = get_census(&mut storage).unwrap();
        assert_eq!(census.get("Root"), Some(&1));
        assert_eq!(census.get("Leaf"), Some(&2));
    }

    #[test]
    fn full_walk_covers_unreachable_records() {
        let mut storage = MemoryStorage::new();
        put(&mut storage, Oid(0), &[]);
        put(&mut storage, Oid(9), &[]);
        let mut walk = RecordWalk::full(&mut storage).unwrap();
        let mut seen = Vec::new();
        while let Some((oid, _)) = walk.next(&mut storage).unwrap() {
            seen.push(oid);
        }
        seen.sort();
        assert_eq!(seen, vec![Oid(0), Oid(9)]);
    }
}
