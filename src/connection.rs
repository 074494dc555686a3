//! The connection manages movement of objects in and out of a storage:
//! a per-connection object cache with ghost loading, access tracking for
//! conflict detection, and commit/abort/sync transaction control.

use crate::error::{Error, Result};
use crate::persistent::{ClassRegistry, ObjectState, PObject, PersistentObject, Status};
use crate::pmap::PMap;
use crate::record::{pack_record, unpack_record, Oid, ROOT_OID};
use crate::serialize::{decode_state, extract_class_name, ObjectWriter};
use crate::storage::{RecordWalk, Storage, DEFAULT_BATCH_SIZE};
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_CACHE_SIZE: usize = 100_000;

// Distinguishes connections so foreign references can be detected.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    id: u64,
    storage: Box<dyn Storage>,
    registry: ClassRegistry,
    cache: Cache,
    /// Unsaved objects, stored on commit or ghosted on abort.
    changed: FxHashMap<Oid, PObject>,
    /// Oids of objects known to have obsolete state; cleared by abort/sync.
    invalid_oids: FxHashSet<Oid>,
    /// Counts commits and aborts.  Objects are stamped with it on access,
    /// which drives both conflict detection and cache eviction.
    transaction_serial: u64,
    load_count: u64,
    root: PObject,
}

impl Connection {
    /// Connect to a storage with the standard class registry.  If the
    /// storage is empty, the root object is created as an empty PMap.
    pub fn open(storage: Box<dyn Storage>) -> Result<Connection> {
        let mut registry = ClassRegistry::new();
        crate::pmap::register(&mut registry);
        Connection::open_with(storage, registry, DEFAULT_CACHE_SIZE)
    }

    pub fn open_with(
        storage: Box<dyn Storage>,
        registry: ClassRegistry,
        cache_size: usize,
    ) -> Result<Connection> {
        let mut connection = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            storage,
            registry,
            cache: Cache::new(cache_size),
            changed: FxHashMap::default(),
            invalid_oids: FxHashSet::default(),
            transaction_serial: 1,
            load_count: 0,
            // Placeholder; becomes the bootstrap root if the storage is empty.
            root: PersistentObject::new(Box::new(PMap::new())),
        };
        match connection.get(ROOT_OID)? {
            Some(root) => connection.root = root,
            None => {
                let oid = connection.storage.new_oid()?;
                if oid != ROOT_OID {
                    return Err(Error::Corrupt(format!(
                        "fresh storage allocated oid {} for the root",
                        oid
                    )));
                }
                let root = connection.root.clone();
                root.set_oid(Some(ROOT_OID));
                root.set_owner(Some(connection.id));
                connection.cache.insert(ROOT_OID, &root);
                connection.changed.insert(ROOT_OID, root);
                connection.commit()?;
            }
        }
        Ok(connection)
    }

    pub fn root(&self) -> PObject {
        self.root.clone()
    }

    pub fn transaction_serial(&self) -> u64 {
        self.transaction_serial
    }

    /// The number of object states loaded so far.
    pub fn load_count(&self) -> u64 {
        self.load_count
    }

    pub fn cache_count(&mut self) -> usize {
        self.cache.count()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size
    }

    pub fn set_cache_size(&mut self, size: usize) {
        self.cache.set_size(size);
    }

    /// Return the object for `oid`, which may be a ghost, or None if the
    /// storage has no such record.
    pub fn get(&mut self, oid: Oid) -> Result<Option<PObject>> {
        if let Some(obj) = self.cache.get(oid) {
            return Ok(Some(obj));
        }
        let record = match self.get_stored(oid) {
            Ok(record) => record,
            Err(Error::KeyNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let obj = self.instantiate(oid, &record)?;
        Ok(Some(obj))
    }

    /// Read an object's state.  Loads ghosts and stamps the access for
    /// conflict detection.
    pub fn read<T: ObjectState, R>(
        &mut self,
        obj: &PObject,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        self.load_state(obj)?;
        self.note_access(obj);
        let state_cell = obj.state().borrow();
        let state = state_cell.as_ref().expect("state was loaded above");
        let state = state
            .as_any()
            .downcast_ref::<T>()
            .unwrap_or_else(|| panic!("object of class {:?} read as another type", obj.class_name()));
        Ok(f(state))
    }

    /// Mutate an object's state.  The object becomes UNSAVED and will be
    /// stored by the next commit.
    pub fn update<T: ObjectState, R>(
        &mut self,
        obj: &PObject,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        self.load_state(obj)?;
        self.note_access(obj);
        self.note_change(obj);
        let mut state_cell = obj.state().borrow_mut();
        let state = state_cell.as_mut().expect("state was loaded above");
        let state = state
            .as_any_mut()
            .downcast_mut::<T>()
            .unwrap_or_else(|| panic!("object of class {:?} updated as another type", obj.class_name()));
        Ok(f(state))
    }

    /// Load the state for a ghost.  A ghost whose record was removed by a
    /// pack surfaces as a read conflict.
    pub fn load_state(&mut self, obj: &PObject) -> Result<()> {
        if !obj.is_ghost() {
            return Ok(());
        }
        let oid = obj.oid().expect("ghost without an oid");
        let record = match self.get_stored(oid) {
            Ok(record) => record,
            Err(Error::KeyNotFound(_)) => return Err(Error::ReadConflict(vec![oid])),
            Err(err) => return Err(err),
        };
        let (_, data, _) = unpack_record(&record)?;
        let state = decode_state(&self.registry, data)?;
        *obj.state().borrow_mut() = Some(state);
        obj.set_status_saved();
        self.load_count += 1;
        Ok(())
    }

    fn note_access(&mut self, obj: &PObject) {
        if let Some(oid) = obj.oid() {
            obj.set_serial(self.transaction_serial);
            self.cache.note_recent(oid, obj);
        }
    }

    fn note_change(&mut self, obj: &PObject) {
        obj.set_status_unsaved();
        if let Some(oid) = obj.oid() {
            self.changed.insert(oid, obj.clone());
        }
    }

    /// Fetch a record from storage, retrying through a sync when the
    /// storage reports the oid stale.  An oid already known to be invalid
    /// fails immediately; the transaction must be aborted first.
    fn get_stored(&mut self, oid: Oid) -> Result<Vec<u8>> {
        if self.invalid_oids.contains(&oid) {
            return Err(Error::ReadConflict(vec![oid]));
        }
        let record = match self.storage.load(oid) {
            Ok(record) => record,
            Err(Error::ReadConflict(_)) => {
                let invalid = self.storage.sync()?;
                self.handle_invalidations(&invalid, Some(oid))?;
                self.storage.load(oid)?
            }
            Err(err) => return Err(err),
        };
        let (record_oid, _, _) = unpack_record(&record)?;
        if record_oid != oid {
            return Err(Error::Corrupt(format!(
                "loaded record for oid {} names oid {}",
                oid, record_oid
            )));
        }
        Ok(record)
    }

    fn instantiate(&mut self, oid: Oid, record: &[u8]) -> Result<PObject> {
        let (_, data, _) = unpack_record(record)?;
        let tag = extract_class_name(data)?;
        let (class, _) = self
            .registry
            .lookup(tag)
            .ok_or_else(|| Error::Corrupt(format!("unknown class tag {:?}", tag)))?;
        let obj = self.cache.get_instance(oid, class, self.id);
        let state = decode_state(&self.registry, data)?;
        *obj.state().borrow_mut() = Some(state);
        obj.set_status_saved();
        self.load_count += 1;
        Ok(obj)
    }

    /// Ask the storage for oids invalidated by other committers and ghost
    /// any cached objects among them.  Returns the invalidated oids.
    pub fn sync(&mut self) -> Result<Vec<Oid>> {
        let invalid = self.storage.sync()?;
        self.invalid_oids.extend(invalid.iter().copied());
        for &oid in &self.invalid_oids {
            if let Some(obj) = self.cache.get(oid) {
                if !obj.is_ghost() {
                    obj.set_status_ghost();
                }
            }
        }
        self.invalid_oids.clear();
        Ok(invalid)
    }

    /// Store all changed objects, plus any newly referenced objects they
    /// pull in, as one transaction.  Fails with WriteConflict if another
    /// committer invalidated an object accessed this transaction; the
    /// storage appends nothing in that case.
    pub fn commit(&mut self) -> Result<()> {
        if self.changed.is_empty() {
            self.sync()?;
        } else {
            if !self.invalid_oids.is_empty() {
                // A previous conflict was not reconciled with abort().
                let mut oids: Vec<Oid> = self.invalid_oids.iter().copied().collect();
                oids.sort();
                return Err(Error::WriteConflict(oids));
            }
            let Connection {
                id,
                storage,
                cache,
                changed,
                invalid_oids,
                transaction_serial,
                ..
            } = self;
            storage.begin();
            let snapshot: Vec<PObject> = changed.values().cloned().collect();
            let mut new_objects: FxHashMap<Oid, PObject> = FxHashMap::default();
            let stored = store_changed(
                storage.as_mut(),
                cache,
                changed,
                &snapshot,
                &mut new_objects,
                *id,
            );
            if let Err(err) = stored {
                unpersist(cache, &new_objects);
                return Err(err);
            }
            let serial = *transaction_serial;
            let result = storage.end(&mut |oids| {
                handle_invalidations_impl(cache, invalid_oids, serial, oids, None)
            });
            if let Err(err) = result {
                if err.is_conflict() {
                    unpersist(cache, &new_objects);
                }
                return Err(err);
            }
            debug!(
                "committed {} objects at serial {}",
                new_objects.len() + snapshot.len(),
                serial
            );
            self.changed.clear();
        }
        self.cache.shrink(self.transaction_serial);
        self.transaction_serial += 1;
        Ok(())
    }

    /// Abort uncommitted changes, sync, and shrink the cache.
    pub fn abort(&mut self) -> Result<()> {
        let changed: Vec<PObject> = self.changed.values().cloned().collect();
        for obj in changed {
            obj.set_status_ghost();
        }
        self.changed.clear();
        self.sync()?;
        self.cache.shrink(self.transaction_serial);
        self.transaction_serial += 1;
        Ok(())
    }

    /// Clear uncommitted changes and pack the storage.
    pub fn pack(&mut self) -> Result<()> {
        self.abort()?;
        self.storage.pack()
    }

    fn handle_invalidations(&mut self, oids: &[Oid], read_oid: Option<Oid>) -> Result<()> {
        handle_invalidations_impl(
            &mut self.cache,
            &mut self.invalid_oids,
            self.transaction_serial,
            oids,
            read_oid,
        )
    }

    /// Breadth-first traversal of the object graph from `start`, loading
    /// records in bulk and priming the cache with SAVED objects.
    pub fn get_crawler(&mut self, start: Oid, batch_size: usize) -> Crawler {
        Crawler {
            walk: RecordWalk::reachable(start, batch_size.max(1)),
        }
    }

    pub fn crawl_next(&mut self, crawler: &mut Crawler) -> Result<Option<PObject>> {
        let Some((oid, record)) = crawler.walk.next(self.storage.as_mut())? else {
            return Ok(None);
        };
        if let Some(obj) = self.cache.get(oid) {
            if !obj.is_ghost() {
                return Ok(Some(obj));
            }
        }
        let obj = self.instantiate(oid, &record)?;
        Ok(Some(obj))
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        self.storage.as_mut()
    }
}

pub struct Crawler {
    walk: RecordWalk,
}

impl Connection {
    /// Default crawl over everything reachable from the root.
    pub fn crawler(&mut self) -> Crawler {
        self.get_crawler(ROOT_OID, DEFAULT_BATCH_SIZE)
    }
}

fn store_changed(
    storage: &mut dyn Storage,
    cache: &mut Cache,
    changed: &FxHashMap<Oid, PObject>,
    snapshot: &[PObject],
    new_objects: &mut FxHashMap<Oid, PObject>,
    connection_id: u64,
) -> Result<()> {
    let mut writer = ObjectWriter::new(storage, connection_id);
    for changed_obj in snapshot {
        let mut queue: VecDeque<PObject> = VecDeque::new();
        queue.push_back(changed_obj.clone());
        loop {
            // The changed object first, then everything the serializer
            // discovers while encoding.
            let obj = match queue.pop_front() {
                Some(obj) => obj,
                None => match writer.next_new_object() {
                    Some(obj) => obj,
                    None => break,
                },
            };
            let oid = obj.oid().expect("storing an unnamed object");
            if new_objects.contains_key(&oid) {
                continue;
            }
            if !changed.contains_key(&oid) {
                new_objects.insert(oid, obj.clone());
                cache.insert(oid, &obj);
            }
            let (data, refs) = writer.get_state(&obj)?;
            writer.storage.store(oid, pack_record(oid, &data, &refs));
            obj.set_status_saved();
        }
    }
    Ok(())
}

/// Undo the naming of objects first stored by a failed commit.
fn unpersist(cache: &mut Cache, new_objects: &FxHashMap<Oid, PObject>) {
    for (&oid, obj) in new_objects {
        obj.set_oid(None);
        obj.set_owner(None);
        obj.set_status_unsaved();
        cache.remove(oid);
    }
}

/// Check invalidated oids against the cache.  Objects accessed this
/// transaction conflict; other cached objects are simply ghosted.
fn handle_invalidations_impl(
    cache: &mut Cache,
    invalid_oids: &mut FxHashSet<Oid>,
    transaction_serial: u64,
    oids: &[Oid],
    read_oid: Option<Oid>,
) -> Result<()> {
    let mut conflicts = Vec::new();
    for &oid in oids {
        let Some(obj) = cache.get(oid) else {
            continue;
        };
        if obj.serial() == transaction_serial {
            conflicts.push(oid);
            invalid_oids.insert(oid);
        } else if !obj.is_ghost() {
            obj.set_status_ghost();
        }
    }
    if conflicts.is_empty() {
        return Ok(());
    }
    conflicts.sort();
    match read_oid {
        None => Err(Error::WriteConflict(conflicts)),
        Some(oid) => Err(Error::ReadConflict(vec![oid])),
    }
}

/// The object cache: a weak-valued map from oid to object, plus hard
/// references to the objects accessed this transaction so they survive
/// while in use.  An object whose only remaining reference is the cache
/// itself is reclaimed; the weak map then answers None for its oid.
pub(crate) struct Cache {
    objects: FxHashMap<Oid, std::rc::Weak<PersistentObject>>,
    recent: FxHashMap<Oid, PObject>,
    size: usize,
    /// Rotates through the cache so successive shrinks scan different
    /// windows.
    finger: usize,
}

impl Cache {
    fn new(size: usize) -> Cache {
        assert!(size > 0, "cache target size must be > 0");
        Cache {
            objects: FxHashMap::default(),
            recent: FxHashMap::default(),
            size,
            finger: 0,
        }
    }

    fn set_size(&mut self, size: usize) {
        assert!(size > 0, "cache target size must be > 0");
        self.size = size;
    }

    fn get(&mut self, oid: Oid) -> Option<PObject> {
        match self.objects.get(&oid) {
            Some(weak) => match weak.upgrade() {
                Some(obj) => Some(obj),
                None => {
                    self.objects.remove(&oid);
                    self.recent.remove(&oid);
                    None
                }
            },
            None => None,
        }
    }

    /// The existing object for this oid, or a new ghost of the class.
    fn get_instance(&mut self, oid: Oid, class: &'static str, owner: u64) -> PObject {
        if let Some(obj) = self.get(oid) {
            if obj.class_name() == class {
                return obj;
            }
        }
        let obj = PersistentObject::ghost(class, oid, owner);
        self.objects.insert(oid, Rc::downgrade(&obj));
        obj
    }

    fn insert(&mut self, oid: Oid, obj: &PObject) {
        self.objects.insert(oid, Rc::downgrade(obj));
    }

    fn remove(&mut self, oid: Oid) {
        self.recent.remove(&oid);
        self.objects.remove(&oid);
    }

    fn note_recent(&mut self, oid: Oid, obj: &PObject) {
        self.recent.insert(oid, obj.clone());
    }

    /// The number of live objects in the cache.
    fn count(&mut self) -> usize {
        self.objects.retain(|_, weak| weak.strong_count() > 0);
        self.objects.len()
    }

    /// If the cache is over its target size, ghostify the least recently
    /// used saved objects.  Only a bounded window of the cache is
    /// examined, starting where the last shrink left off; objects
    /// accessed this transaction are never touched.
    fn shrink(&mut self, transaction_serial: u64) {
        let current = self.count();
        if current <= self.size {
            return;
        }
        let heap_target = (current - self.size) * 2;
        let keys: Vec<Oid> = self.objects.keys().copied().collect();
        let start = self.finger % keys.len();
        let mut heap: BinaryHeap<Reverse<(u64, Oid)>> = BinaryHeap::new();
        for i in 0..keys.len() {
            let oid = keys[(start + i) % keys.len()];
            self.finger += 1;
            let Some(obj) = self.get(oid) else {
                continue;
            };
            if obj.serial() == transaction_serial {
                continue; // current; leave it alone
            }
            heap.push(Reverse((obj.serial(), oid)));
            if heap.len() >= heap_target {
                break;
            }
        }
        self.finger %= keys.len();
        let mut ghosted = 0usize;
        while self.objects.len() > self.size {
            let Some(Reverse((_, oid))) = heap.pop() else {
                break;
            };
            let Some(obj) = self.get(oid) else {
                continue;
            };
            if obj.status() == Status::Saved {
                obj.set_status_ghost();
                ghosted += 1;
            }
            self.recent.remove(&oid);
            drop(obj);
            // Reclaim the entry right away if the cache held the last
            // reference.
            if let Some(weak) = self.objects.get(&oid) {
                if weak.strong_count() == 0 {
                    self.objects.remove(&oid);
                }
            }
        }
        debug!(
            "cache shrink: {} -> {} ({} ghosted)",
            current,
            self.objects.len(),
            ghosted
        );
    }
}
