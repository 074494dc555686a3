//! Shelf-backed storage: staged commits appended to the log with fsync at
//! the durability boundary, plus incremental reachability-based packing
//! into a companion file that is swapped in when complete.

use crate::error::{Error, Result};
use crate::file::File;
use crate::record::{split_oids, unpack_record, Oid, ROOT_OID};
use crate::shelf::{Shelf, ShelfBuilder, ShelfFinisher};
use crate::storage::Storage;
use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::ffi::OsString;
use std::path::Path;

/// Records handled per pack step before yielding back to the caller.
const PACK_INCREMENT: usize = 20;

pub struct ShelfStorage {
    shelf: Shelf,
    /// Records staged between begin and end.
    pending: FxHashMap<Oid, Vec<u8>>,
    /// Oids handed out by new_oid that have no record yet.  Kept so the
    /// allocator never reissues them, even across a pack replacing the
    /// shelf's unused-name generator.
    allocated: FxHashSet<Oid>,
    /// Oids whose records a pack removed, surfaced by sync().
    invalid: FxHashSet<Oid>,
    pack: Option<Packer>,
}

impl ShelfStorage {
    pub fn open<P: AsRef<Path>>(path: P, readonly: bool, repair: bool) -> Result<ShelfStorage> {
        let file = File::open(path, readonly)?;
        Ok(ShelfStorage::from_shelf(Shelf::open(file, repair)?))
    }

    /// A storage in a temporary file, deleted when dropped.
    pub fn temporary() -> Result<ShelfStorage> {
        Ok(ShelfStorage::from_shelf(Shelf::open(
            File::temporary()?,
            false,
        )?))
    }

    fn from_shelf(shelf: Shelf) -> ShelfStorage {
        ShelfStorage {
            shelf,
            pending: FxHashMap::default(),
            allocated: FxHashSet::default(),
            invalid: FxHashSet::default(),
            pack: None,
        }
    }

    pub fn shelf(&mut self) -> &mut Shelf {
        &mut self.shelf
    }

    pub fn is_packing(&self) -> bool {
        self.pack.is_some()
    }

    fn finish_pack(&mut self) -> Result<()> {
        let packer = self.pack.take().expect("no pack in progress");
        let PackPhase::Extra { mut new_shelf, .. } = packer.phase else {
            panic!("pack finished in the wrong phase");
        };
        // Every oid the new shelf does not cover is now invalid.
        let mut invalid = Vec::new();
        let mut cursor = self.shelf.index_cursor();
        while let Some((oid, _)) = self.shelf.cursor_next(&mut cursor)? {
            if !packer.written.contains(&oid) {
                invalid.push(oid);
            }
        }
        new_shelf.file_mut().flush()?;
        new_shelf.file_mut().fsync()?;
        let name = self.shelf.file().path().to_path_buf();
        let mut prepack_name = OsString::from(name.as_os_str());
        prepack_name.push(".prepack");
        self.shelf.file_mut().rename(&prepack_name)?;
        new_shelf.file_mut().rename(&name)?;
        // The old shelf drops here, releasing its lock on the .prepack file.
        self.shelf = new_shelf;
        info!(
            "pack finished: {} records kept, {} oids invalidated",
            packer.written.len(),
            invalid.len()
        );
        self.invalid.extend(invalid);
        Ok(())
    }
}

impl Storage for ShelfStorage {
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>> {
        match self.shelf.get_value(oid)? {
            Some(record) => Ok(record),
            None => Err(Error::KeyNotFound(oid)),
        }
    }

    fn begin(&mut self) {
        self.pending.clear();
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) {
        self.pending.insert(oid, record);
    }

    fn end(&mut self, handle_invalidations: &mut dyn FnMut(&[Oid]) -> Result<()>) -> Result<()> {
        let invalid: Vec<Oid> = self.invalid.iter().copied().collect();
        if let Err(err) = handle_invalidations(&invalid) {
            self.pending.clear();
            return Err(err);
        }
        // Delivered; a sync after this commit starts clean.
        self.invalid.clear();
        if self.pending.is_empty() {
            return Ok(());
        }
        let items: Vec<(Oid, Vec<u8>)> = self.pending.drain().collect();
        let oids: Vec<Oid> = items.iter().map(|(oid, _)| *oid).collect();
        let bytes: usize = items.iter().map(|(_, record)| record.len()).sum();
        self.shelf.store(items)?;
        self.shelf.file_mut().flush()?;
        self.shelf.file_mut().fsync()?;
        for oid in &oids {
            self.allocated.remove(oid);
        }
        if let Some(pack) = self.pack.as_mut() {
            pack.pack_extra.extend(oids.iter().copied());
        }
        debug!("transaction: {} records, {} bytes", oids.len(), bytes);
        Ok(())
    }

    fn sync(&mut self) -> Result<Vec<Oid>> {
        Ok(self.invalid.drain().collect())
    }

    fn new_oid(&mut self) -> Result<Oid> {
        loop {
            let oid = self.shelf.next_name()?;
            if self.allocated.contains(&oid) || self.pending.contains_key(&oid) {
                continue;
            }
            self.allocated.insert(oid);
            return Ok(oid);
        }
    }

    fn live_oids(&mut self) -> Result<Option<Vec<Oid>>> {
        let mut oids = Vec::new();
        let mut cursor = self.shelf.index_cursor();
        while let Some((oid, _)) = self.shelf.cursor_next(&mut cursor)? {
            oids.push(oid);
        }
        Ok(Some(oids))
    }

    fn start_pack(&mut self) -> Result<bool> {
        if self.pack.is_some() || !self.pending.is_empty() {
            return Ok(false);
        }
        if self.shelf.file().is_temporary() || self.shelf.file().is_readonly() {
            return Ok(false);
        }
        let mut pack_name = OsString::from(self.shelf.file().path().as_os_str());
        pack_name.push(".pack");
        let mut file = File::open(&pack_name, false)?;
        file.obtain_lock()?;
        if file.len()? > 0 {
            // Leftovers of an interrupted pack attempt.
            file.seek(0)?;
            file.truncate()?;
        }
        let builder = ShelfBuilder::new(file)?;
        let mut todo = BinaryHeap::new();
        todo.push(Reverse((0u64, ROOT_OID)));
        self.pack = Some(Packer {
            phase: PackPhase::Copy { builder, todo },
            written: FxHashSet::default(),
            pack_extra: FxHashSet::default(),
        });
        info!("pack started");
        Ok(true)
    }

    fn pack_step(&mut self) -> Result<bool> {
        let Some(pack) = self.pack.as_mut() else {
            return Ok(true);
        };
        if pack.step(&mut self.shelf)? {
            self.finish_pack()?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// The state machine behind an incremental pack.
///
/// Copy:   breadth-first walk of the reference graph from the root oid,
///         streaming each reachable record into the initial transaction of
///         the new file.  The walk is ordered by old file offset so the
///         packed file stays close to the old one on disk.
/// Finish: size, fill, and stitch the new file's offset map.
/// Extra:  drain the oids committed while the pack ran, appending their
///         current records (and anything new they reference) to the new
///         shelf as ordinary transactions.
///
/// The swap into place happens in ShelfStorage::finish_pack.
struct Packer {
    phase: PackPhase,
    /// Oids with a record in the new file.
    written: FxHashSet<Oid>,
    /// Oids committed since the pack began, still to be drained.
    pack_extra: FxHashSet<Oid>,
}

enum PackPhase {
    Copy {
        builder: ShelfBuilder,
        todo: BinaryHeap<Reverse<(u64, Oid)>>,
    },
    Finish(ShelfFinisher),
    Extra {
        new_shelf: Shelf,
        todo: VecDeque<(Oid, bool)>,
    },
    Stepping,
}

impl Packer {
    /// Advance by a bounded amount of work.  Returns true when everything
    /// has been written and the new shelf is ready to swap in.
    fn step(&mut self, old: &mut Shelf) -> Result<bool> {
        let phase = std::mem::replace(&mut self.phase, PackPhase::Stepping);
        match phase {
            PackPhase::Copy {
                mut builder,
                mut todo,
            } => {
                let mut handled = 0;
                while handled < PACK_INCREMENT {
                    let Some(Reverse((_, oid))) = todo.pop() else {
                        break;
                    };
                    if self.written.contains(&oid) {
                        continue;
                    }
                    let record = load_for_pack(old, oid)?;
                    let (_, _, refdata) = unpack_record(&record)?;
                    for reference in split_oids(refdata)? {
                        if !self.written.contains(&reference) {
                            let rank = old.get_position(reference)?.unwrap_or(u64::MAX);
                            todo.push(Reverse((rank, reference)));
                        }
                    }
                    builder.add(oid, &record)?;
                    self.written.insert(oid);
                    handled += 1;
                }
                if todo.is_empty() {
                    self.phase = PackPhase::Finish(builder.into_finisher()?);
                } else {
                    self.phase = PackPhase::Copy { builder, todo };
                }
                Ok(false)
            }
            PackPhase::Finish(mut finisher) => {
                if finisher.step(PACK_INCREMENT * 8)? {
                    self.phase = PackPhase::Extra {
                        new_shelf: finisher.into_shelf()?,
                        todo: VecDeque::new(),
                    };
                } else {
                    self.phase = PackPhase::Finish(finisher);
                }
                Ok(false)
            }
            PackPhase::Extra {
                mut new_shelf,
                mut todo,
            } => {
                let mut batch: Vec<(Oid, Vec<u8>)> = Vec::new();
                while batch.len() < PACK_INCREMENT {
                    let (oid, force) = match todo.pop_front() {
                        Some(entry) => entry,
                        None => match pop_one(&mut self.pack_extra) {
                            // A commit after the pack began; its record must
                            // be rewritten even if an older version was
                            // already packed.
                            Some(oid) => (oid, true),
                            None => break,
                        },
                    };
                    if !force && self.written.contains(&oid) {
                        continue;
                    }
                    let record = load_for_pack(old, oid)?;
                    let (_, _, refdata) = unpack_record(&record)?;
                    for reference in split_oids(refdata)? {
                        if !self.written.contains(&reference) {
                            todo.push_back((reference, false));
                        }
                    }
                    self.written.insert(oid);
                    batch.push((oid, record));
                }
                if !batch.is_empty() {
                    new_shelf.store(batch)?;
                }
                let done = todo.is_empty() && self.pack_extra.is_empty();
                self.phase = PackPhase::Extra { new_shelf, todo };
                Ok(done)
            }
            PackPhase::Stepping => unreachable!("reentrant pack step"),
        }
    }
}

fn load_for_pack(old: &mut Shelf, oid: Oid) -> Result<Vec<u8>> {
    old.get_value(oid)?.ok_or_else(|| {
        Error::Corrupt(format!("pack found no record for referenced oid {}", oid))
    })
}

fn pop_one(set: &mut FxHashSet<Oid>) -> Option<Oid> {
    let oid = set.iter().next().copied()?;
    set.remove(&oid);
    Some(oid)
}
