//! The append-only log file with its embedded offset map.
//!
//! A shelf maps oids to object records.  The file layout is:
//!
//! 1) the 8-byte prefix "SHELF-1\n";
//! 2) an initial transaction;
//! 3) an offset map giving the file offset of each oid's record written
//!    before the map;
//! 4) zero or more further transactions, whose record offsets live in the
//!    in-memory index.
//!
//! A transaction is an 8-byte length followed by records, each prefixed by
//! an 8-byte record length and laid out as oid followed by value bytes.
//! All integers are unsigned big-endian.  After initial construction, all
//! writing happens at the end of the file.

use crate::error::{Error, Result};
use crate::file::File;
use crate::intarray::IntArray;
use crate::ioutil;
use crate::record::Oid;
use rustc_hash::FxHashMap;

pub const PREFIX: &[u8; 8] = b"SHELF-1\n";

pub struct Shelf {
    file: File,
    offset_map: OffsetMap,
    /// oid -> offset for records appended after the offset map was written.
    memory_index: FxHashMap<Oid, u64>,
    unused: Option<UnusedNames>,
}

impl Shelf {
    /// Open a shelf, creating the empty structure if the file is empty.
    /// With `repair` set, a trailing malformed transaction is truncated
    /// away instead of failing the open.
    pub fn open(mut file: File, repair: bool) -> Result<Shelf> {
        if !file.is_readonly() {
            file.obtain_lock()?;
        }
        if file.seek_end()? == 0 {
            if file.is_readonly() {
                return Err(Error::ShortRead);
            }
            return ShelfBuilder::new(file)?.finish();
        }
        Shelf::from_file(file, repair)
    }

    /// Build a new shelf from a sequence of items in one pass.
    pub fn create_from<I>(file: File, items: I) -> Result<Shelf>
    where
        I: IntoIterator<Item = (Oid, Vec<u8>)>,
    {
        let mut builder = ShelfBuilder::new(file)?;
        for (oid, value) in items {
            builder.add(oid, &value)?;
        }
        builder.finish()
    }

    pub fn has_format(file: &mut File) -> Result<bool> {
        file.seek(0)?;
        let mut prefix = [0u8; 8];
        match ioutil::read_exact(file, &mut prefix) {
            Ok(()) => Ok(&prefix == PREFIX),
            Err(Error::ShortRead) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn from_file(mut file: File, repair: bool) -> Result<Shelf> {
        if !Shelf::has_format(&mut file)? {
            return Err(Error::Corrupt(format!(
                "{:?} is not a SHELF-1 file",
                file.path()
            )));
        }
        file.seek(PREFIX.len() as u64)?;
        // Skip the initial transaction.
        let initial_length = ioutil::read_u64(&mut file)?;
        let map_start = PREFIX.len() as u64 + 8 + initial_length;
        file.seek(map_start)?;
        let offset_map = OffsetMap::open(&mut file)?;
        file.seek(offset_map.end_offset())?;
        let mut memory_index = FxHashMap::default();
        while let Some(offsets) = read_transaction_offsets(&mut file, repair)? {
            memory_index.extend(offsets);
        }
        file.seek_end()?;
        Ok(Shelf {
            file,
            offset_map,
            memory_index,
            unused: None,
        })
    }

    /// Return an oid that holds no record and has not been returned by a
    /// previous call.  Offset-map holes come first, in the order the hole
    /// chain exposes them, then fresh oids counting up from the end of the
    /// map.
    pub fn next_name(&mut self) -> Result<Oid> {
        if self.unused.is_none() {
            self.unused = Some(if self.offset_map.array_size() > 0 {
                UnusedNames::Holes(HoleWalk::new(&self.offset_map))
            } else {
                UnusedNames::Counting(self.offset_map.array_size())
            });
        }
        loop {
            let candidate = match self.unused.as_mut().unwrap() {
                UnusedNames::Holes(walk) => walk.next(&mut self.file, &self.offset_map)?,
                UnusedNames::Counting(next) => {
                    let index = *next;
                    *next += 1;
                    Some(index)
                }
            };
            match candidate {
                Some(index) => {
                    let oid = Oid(index);
                    if !self.memory_index.contains_key(&oid) {
                        return Ok(oid);
                    }
                }
                // The hole chain is exhausted; continue with oids past
                // the end of the map.
                None => {
                    self.unused = Some(UnusedNames::Counting(self.offset_map.array_size()));
                }
            }
        }
    }

    /// Append one transaction holding all of the items.  On any error the
    /// file is truncated back to its pre-append length.
    pub fn store<I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (Oid, Vec<u8>)>,
    {
        self.file.seek_end()?;
        let start = self.file.tell()?;
        let mut index = FxHashMap::default();
        let result = (|| -> Result<()> {
            ioutil::write_u64(&mut self.file, 0)?; // length, patched below
            for (oid, value) in items {
                let position = self.file.tell()?;
                index.insert(oid, position);
                ioutil::write_u64(&mut self.file, 8 + value.len() as u64)?;
                self.file.write_bytes(&oid.to_bytes())?;
                self.file.write_bytes(&value)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            self.file.seek(start)?;
            self.file.truncate()?;
            return Err(err);
        }
        let end = self.file.tell()?;
        self.file.seek(start)?;
        ioutil::write_u64(&mut self.file, end - start - 8)?;
        self.file.seek(end)?;
        self.memory_index.extend(index);
        Ok(())
    }

    /// The file offset of the most recent record for this oid, if any.
    pub fn get_position(&mut self, oid: Oid) -> Result<Option<u64>> {
        if let Some(&position) = self.memory_index.get(&oid) {
            return Ok(Some(position));
        }
        self.offset_map.get(&mut self.file, oid.0)
    }

    pub fn get_item_at_position(&mut self, position: u64) -> Result<(Oid, Vec<u8>)> {
        self.file.seek(position)?;
        let record = ioutil::read_u64_str(&mut self.file)?;
        if record.len() < 8 {
            return Err(Error::Corrupt(format!(
                "record of {} bytes at offset {}",
                record.len(),
                position
            )));
        }
        let mut oid = [0u8; 8];
        oid.copy_from_slice(&record[..8]);
        Ok((Oid::from_bytes(oid), record[8..].to_vec()))
    }

    pub fn get_value(&mut self, oid: Oid) -> Result<Option<Vec<u8>>> {
        let Some(position) = self.get_position(oid)? else {
            return Ok(None);
        };
        let (stored_oid, value) = self.get_item_at_position(position)?;
        if stored_oid != oid {
            return Err(Error::Corrupt(format!(
                "record at offset {} names oid {}, expected {}",
                position, stored_oid, oid
            )));
        }
        Ok(Some(value))
    }

    pub fn contains(&mut self, oid: Oid) -> Result<bool> {
        Ok(self.get_position(oid)?.is_some())
    }

    /// Start a walk over the live index: offset-map entries first, then
    /// records appended after the map.
    pub fn index_cursor(&self) -> IndexCursor {
        IndexCursor {
            map_index: 0,
            memory: self.memory_index.iter().map(|(&oid, &pos)| (oid, pos)).collect(),
            memory_pos: 0,
        }
    }

    pub fn cursor_next(&mut self, cursor: &mut IndexCursor) -> Result<Option<(Oid, u64)>> {
        while cursor.map_index < self.offset_map.array_size() {
            let index = cursor.map_index;
            cursor.map_index += 1;
            if let Some(position) = self.offset_map.get(&mut self.file, index)? {
                let oid = Oid(index);
                if !self.memory_index.contains_key(&oid) {
                    return Ok(Some((oid, position)));
                }
            }
        }
        if cursor.memory_pos < cursor.memory.len() {
            let entry = cursor.memory[cursor.memory_pos];
            cursor.memory_pos += 1;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    pub fn memory_index(&self) -> &FxHashMap<Oid, u64> {
        &self.memory_index
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

pub struct IndexCursor {
    map_index: u64,
    memory: Vec<(Oid, u64)>,
    memory_pos: usize,
}

enum UnusedNames {
    Holes(HoleWalk),
    Counting(u64),
}

/// Read the offsets of one transaction starting at the file's current
/// position.  Returns None at a clean end of file.  If the file ends in a
/// partial transaction, repair mode truncates it away; otherwise the
/// truncation surfaces as an error.
pub fn read_transaction_offsets(
    file: &mut File,
    repair: bool,
) -> Result<Option<FxHashMap<Oid, u64>>> {
    let transaction_start = file.tell()?;
    match walk_transaction(file, transaction_start) {
        Ok(offsets) => Ok(Some(offsets)),
        Err(Error::ShortRead) => {
            let position = file.tell()?;
            if position > transaction_start {
                if repair {
                    file.seek(transaction_start)?;
                    file.truncate()?;
                } else {
                    return Err(Error::Corrupt(format!(
                        "truncated transaction at offset {}",
                        transaction_start
                    )));
                }
            }
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn walk_transaction(file: &mut File, transaction_start: u64) -> Result<FxHashMap<Oid, u64>> {
    let transaction_length = ioutil::read_u64(file)?;
    let transaction_end = transaction_start
        .checked_add(8 + transaction_length)
        .ok_or(Error::ShortRead)?;
    if transaction_end > file.len()? {
        return Err(Error::ShortRead);
    }
    let mut offsets = FxHashMap::default();
    while file.tell()? < transaction_end {
        let position = file.tell()?;
        let record_length = ioutil::read_u64(file)?;
        let oid = ioutil::read_oid(file)?;
        offsets.insert(oid, position);
        let next = position.checked_add(8 + record_length).ok_or(Error::ShortRead)?;
        file.seek(next)?;
    }
    if file.tell()? != transaction_end {
        return Err(Error::ShortRead);
    }
    Ok(offsets)
}

/// The offset map holds the record offsets for the oids written before it.
/// Oids index directly into a fixed array; slots for oids with no record
/// are chained into a free list so unused oids can be found in O(holes).
/// Free-list links are stored as `map start + next index` so they cannot be
/// confused with record offsets, which are always less than the map start.
pub struct OffsetMap {
    start: u64,
    array: IntArray,
}

impl OffsetMap {
    /// Write a new blank map at the end of the file, with one slot for
    /// every oid up to and including `max_oid`, plus a spare final slot
    /// that anchors the free-list chain.
    pub fn generate(file: &mut File, max_oid: Option<Oid>) -> Result<()> {
        let start = file.seek_end()?;
        let len = max_oid.map_or(0, |oid| oid.0 + 2);
        IntArray::generate(file, len, Some(start + len))
    }

    /// Read a map at the file's current position.
    pub fn open(file: &mut File) -> Result<OffsetMap> {
        let start = file.tell()?;
        let array = IntArray::open(file)?;
        Ok(OffsetMap { start, array })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end_offset(&self) -> u64 {
        self.array.end_offset()
    }

    /// Total slot count, which is also the first oid past the map.
    pub fn array_size(&self) -> u64 {
        self.array.len()
    }

    /// The record offset for this oid, or None for out-of-range oids,
    /// blank slots, and free-list links.
    pub fn get(&self, file: &mut File, index: u64) -> Result<Option<u64>> {
        match self.array.get(file, index)? {
            Some(value) if value < self.start => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Record the offset for an oid.  Only blank slots are written; the
    /// map never overwrites a real offset.
    pub fn set(&self, file: &mut File, index: u64, offset: u64) -> Result<()> {
        debug_assert!(self.get(file, index).unwrap_or(None).is_none());
        self.array.set(file, index, offset)
    }
}

/// Builds the free-list chain through the blank slots of a fresh map.
/// Each blank slot is set to `start + index of the previous blank slot`,
/// with the final slot acting as the entry point.
struct Stitcher {
    index: u64,
    last_index: u64,
}

impl Stitcher {
    fn new(map: &OffsetMap) -> Stitcher {
        Stitcher {
            index: 0,
            last_index: map.array_size().saturating_sub(1),
        }
    }

    fn step(&mut self, file: &mut File, map: &OffsetMap, budget: usize) -> Result<bool> {
        let len = map.array_size();
        let mut done_this_step = 0;
        while self.index < len && done_this_step < budget {
            if map.get(file, self.index)?.is_none() {
                map.array.set(file, self.index, self.last_index + map.start)?;
                self.last_index = self.index;
            }
            self.index += 1;
            done_this_step += 1;
        }
        Ok(self.index >= len)
    }
}

/// Walks the free-list chain of a stitched map, yielding hole indexes.
struct HoleWalk {
    j: u64,
    last_index: u64,
    done: bool,
}

impl HoleWalk {
    fn new(map: &OffsetMap) -> HoleWalk {
        let size = map.array_size();
        HoleWalk {
            j: size.saturating_sub(1),
            last_index: size.saturating_sub(1),
            done: size == 0,
        }
    }

    fn next(&mut self, file: &mut File, map: &OffsetMap) -> Result<Option<u64>> {
        if self.done {
            return Ok(None);
        }
        let link = map.array.read_word(file, self.j)?;
        if link < map.start() || link - map.start() >= map.array_size() {
            return Err(Error::Corrupt(format!(
                "bad free-list link {} in offset map slot {}",
                link, self.j
            )));
        }
        let next = link - map.start();
        if next == self.last_index {
            self.done = true;
        }
        self.j = next;
        Ok(Some(next))
    }
}

/// Writes a new shelf incrementally: records first, then the offset map is
/// sized, filled from a re-read of the initial transaction, and stitched.
/// The explicit steps let a pack interleave with other work.
pub struct ShelfBuilder {
    file: File,
    transaction_start: u64,
    max_oid: Option<Oid>,
}

impl ShelfBuilder {
    pub fn new(mut file: File) -> Result<ShelfBuilder> {
        file.obtain_lock()?;
        if file.seek_end()? != 0 {
            return Err(Error::Corrupt(format!(
                "expected {:?} to be empty",
                file.path()
            )));
        }
        file.write_bytes(PREFIX)?;
        let transaction_start = file.tell()?;
        ioutil::write_u64(&mut file, 0)?; // length, patched by the finisher
        Ok(ShelfBuilder {
            file,
            transaction_start,
            max_oid: None,
        })
    }

    pub fn add(&mut self, oid: Oid, value: &[u8]) -> Result<()> {
        self.max_oid = Some(match self.max_oid {
            None => oid,
            Some(max) => max.max(oid),
        });
        ioutil::write_u64(&mut self.file, 8 + value.len() as u64)?;
        self.file.write_bytes(&oid.to_bytes())?;
        self.file.write_bytes(value)?;
        Ok(())
    }

    pub fn into_finisher(mut self) -> Result<ShelfFinisher> {
        let transaction_end = self.file.tell()?;
        self.file.seek(self.transaction_start)?;
        ioutil::write_u64(
            &mut self.file,
            transaction_end - self.transaction_start - 8,
        )?;
        OffsetMap::generate(&mut self.file, self.max_oid)?;
        let offset_map = OffsetMap::open(&mut self.file)?;
        let phase = if self.max_oid.is_some() {
            FinishPhase::Fill {
                cursor: self.transaction_start + 8,
            }
        } else {
            FinishPhase::Stitch(Stitcher::new(&offset_map))
        };
        Ok(ShelfFinisher {
            file: self.file,
            offset_map,
            transaction_end,
            phase,
        })
    }

    pub fn finish(self) -> Result<Shelf> {
        let mut finisher = self.into_finisher()?;
        while !finisher.step(usize::MAX)? {}
        finisher.into_shelf()
    }
}

pub struct ShelfFinisher {
    file: File,
    offset_map: OffsetMap,
    transaction_end: u64,
    phase: FinishPhase,
}

enum FinishPhase {
    Fill { cursor: u64 },
    Stitch(Stitcher),
    Done,
}

impl ShelfFinisher {
    /// Advance by up to `budget` slots or records.  Returns true when the
    /// shelf structure is complete.
    pub fn step(&mut self, budget: usize) -> Result<bool> {
        match &mut self.phase {
            FinishPhase::Fill { cursor } => {
                let mut done_this_step = 0;
                while *cursor < self.transaction_end && done_this_step < budget {
                    let position = *cursor;
                    self.file.seek(position)?;
                    let record_length = ioutil::read_u64(&mut self.file)?;
                    let oid = ioutil::read_oid(&mut self.file)?;
                    self.offset_map.set(&mut self.file, oid.0, position)?;
                    *cursor = position + 8 + record_length;
                    done_this_step += 1;
                }
                if *cursor >= self.transaction_end {
                    self.phase = FinishPhase::Stitch(Stitcher::new(&self.offset_map));
                }
                Ok(false)
            }
            FinishPhase::Stitch(stitcher) => {
                if stitcher.step(&mut self.file, &self.offset_map, budget)? {
                    self.phase = FinishPhase::Done;
                    return Ok(true);
                }
                Ok(false)
            }
            FinishPhase::Done => Ok(true),
        }
    }

    pub fn into_shelf(self) -> Result<Shelf> {
        assert!(matches!(self.phase, FinishPhase::Done));
        Shelf::from_file(self.file, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_shelf() -> Shelf {
        Shelf::open(File::temporary().unwrap(), false).unwrap()
    }

    #[test]
    fn empty_shelf_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.durus");
        let shelf = Shelf::open(File::open(&path, false).unwrap(), false).unwrap();
        drop(shelf);
        let mut shelf = Shelf::open(File::open(&path, false).unwrap(), false).unwrap();
        assert!(shelf.memory_index().is_empty());
        assert_eq!(shelf.next_name().unwrap(), Oid(0));
        assert_eq!(shelf.next_name().unwrap(), Oid(1));
    }

    #[test]
    fn store_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.durus");
        {
            let mut shelf = Shelf::open(File::open(&path, false).unwrap(), false).unwrap();
            let name = shelf.next_name().unwrap();
            assert_eq!(name, Oid(0));
            shelf.store(vec![(name, b"ok".to_vec())]).unwrap();
            assert_eq!(shelf.get_value(name).unwrap().unwrap(), b"ok");
        }
        let mut shelf = Shelf::open(File::open(&path, false).unwrap(), false).unwrap();
        assert_eq!(shelf.get_value(Oid(0)).unwrap().unwrap(), b"ok");
        assert_eq!(shelf.get_value(Oid(1)).unwrap(), None);
    }

    #[test]
    fn values_in_memory_index_start_with_their_oid() {
        let mut shelf = temp_shelf();
        let items: Vec<_> = (0..5u64)
            .map(|n| {
                let oid = Oid(n);
                let mut value = oid.to_bytes().to_vec();
                value.extend_from_slice(b"payload");
                (oid, value)
            })
            .collect();
        shelf.store(items).unwrap();
        let oids: Vec<Oid> = shelf.memory_index().keys().copied().collect();
        for oid in oids {
            let value = shelf.get_value(oid).unwrap().unwrap();
            assert_eq!(&value[..8], &oid.to_bytes());
        }
    }

    #[test]
    fn initial_construction_exposes_holes() {
        let file = File::temporary().unwrap();
        let items = vec![
            (Oid(0), b"zero".to_vec()),
            (Oid(2), b"two".to_vec()),
            (Oid(4), b"four".to_vec()),
        ];
        let mut shelf = Shelf::create_from(file, items).unwrap();
        assert_eq!(shelf.get_value(Oid(2)).unwrap().unwrap(), b"two");
        assert_eq!(shelf.get_value(Oid(1)).unwrap(), None);
        // Array size is max oid + 2; holes come off the chain, then the
        // names count up.
        let names: Vec<Oid> = (0..5).map(|_| shelf.next_name().unwrap()).collect();
        assert_eq!(names, vec![Oid(3), Oid(1), Oid(5), Oid(6), Oid(7)]);
    }

    #[test]
    fn next_name_skips_oids_stored_after_the_map() {
        let file = File::temporary().unwrap();
        let mut shelf = Shelf::create_from(file, vec![(Oid(0), b"root".to_vec())]).unwrap();
        // Oid 1 is the spare final slot of the map, exposed as a hole.
        shelf.store(vec![(Oid(1), b"one".to_vec())]).unwrap();
        assert_eq!(shelf.next_name().unwrap(), Oid(2));
    }

    #[test]
    fn repair_truncates_partial_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.durus");
        {
            let mut shelf = Shelf::open(File::open(&path, false).unwrap(), false).unwrap();
            shelf.store(vec![(Oid(0), b"good".to_vec())]).unwrap();
            // A torn write: a transaction header promising more than is there.
            let file = shelf.file_mut();
            file.seek_end().unwrap();
            ioutil::write_u64(file, 100).unwrap();
            file.write_bytes(b"partial").unwrap();
        }
        match Shelf::open(File::open(&path, false).unwrap(), false) {
            Err(Error::Corrupt(_)) => (),
            other => panic!("expected Corrupt, got {:?}", other.err()),
        }
        let good_len = {
            let mut shelf = Shelf::open(File::open(&path, false).unwrap(), true).unwrap();
            assert_eq!(shelf.get_value(Oid(0)).unwrap().unwrap(), b"good");
            shelf.file().len().unwrap()
        };
        // Repair is idempotent: a reopen finds the same structure.
        let mut shelf = Shelf::open(File::open(&path, false).unwrap(), true).unwrap();
        assert_eq!(shelf.file().len().unwrap(), good_len);
        assert_eq!(shelf.get_value(Oid(0)).unwrap().unwrap(), b"good");
    }

    #[test]
    fn non_shelf_file_is_rejected() {
        let mut file = File::temporary().unwrap();
        file.write_bytes(b"not a shelf at all").unwrap();
        match Shelf::open(file, false) {
            Err(Error::Corrupt(_)) => (),
            other => panic!("expected Corrupt, got {:?}", other.err()),
        }
    }

    #[test]
    fn index_cursor_covers_map_and_memory() {
        let file = File::temporary().unwrap();
        let mut shelf =
            Shelf::create_from(file, vec![(Oid(0), b"a".to_vec()), (Oid(1), b"b".to_vec())])
                .unwrap();
        shelf.store(vec![(Oid(1), b"b2".to_vec()), (Oid(5), b"c".to_vec())]).unwrap();
        let mut cursor = shelf.index_cursor();
        let mut seen = Vec::new();
        while let Some((oid, _)) = shelf.cursor_next(&mut cursor).unwrap() {
            seen.push(oid);
        }
        seen.sort();
        // Oid 1 appears once: the memory index shadows its map entry.
        assert_eq!(seen, vec![Oid(0), Oid(1), Oid(5)]);
        assert_eq!(shelf.get_value(Oid(1)).unwrap().unwrap(), b"b2");
    }
}
