//! A fixed array of fixed-width unsigned integers stored inside a file.
//! A slot filled with 0xff bytes is "blank".  Words are sized to the
//! largest value the array will ever hold, which keeps the offset map
//! compact for small storages.

use crate::error::{Error, Result};
use crate::file::File;
use crate::ioutil;

const FILL_CHUNK: usize = 8192;

pub struct IntArray {
    start: u64,
    bytes_per_word: u64,
    len: u64,
}

impl IntArray {
    /// Write a new array of `len` blank slots at the end of the file,
    /// sized so that values up to `maximum_int` fit in each word.
    pub fn generate(file: &mut File, len: u64, maximum_int: Option<u64>) -> Result<()> {
        let start = file.seek_end()?;
        let bytes_per_word = match maximum_int {
            None => 8,
            Some(max) => (64 - (max + 1).leading_zeros() as u64 + 7) / 8,
        };
        let data_bytes = bytes_per_word * len;
        ioutil::write_u64(file, 16 + data_bytes)?;
        ioutil::write_u64(file, bytes_per_word)?;
        ioutil::write_u64(file, len)?;
        let chunk = [0xffu8; FILL_CHUNK];
        let mut remaining = data_bytes as usize;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            file.write_bytes(&chunk[..n])?;
            remaining -= n;
        }
        file.seek(start)?;
        Ok(())
    }

    /// Read the array header at the file's current position.
    pub fn open(file: &mut File) -> Result<IntArray> {
        let start = file.tell()?;
        let total = ioutil::read_u64(file)?;
        let bytes_per_word = ioutil::read_u64(file)?;
        let len = ioutil::read_u64(file)?;
        if bytes_per_word == 0 || bytes_per_word > 8 || total != 16 + bytes_per_word * len {
            return Err(Error::Corrupt(format!(
                "bad int array header at offset {}",
                start
            )));
        }
        Ok(IntArray {
            start,
            bytes_per_word,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// File offset of the first byte past the array.
    pub fn end_offset(&self) -> u64 {
        self.start + 24 + self.bytes_per_word * self.len
    }

    fn word_offset(&self, index: u64) -> u64 {
        assert!(index < self.len, "int array index {} out of range", index);
        self.start + 24 + self.bytes_per_word * index
    }

    /// Read a slot without interpreting the blank sentinel.
    pub fn read_word(&self, file: &mut File, index: u64) -> Result<u64> {
        file.seek(self.word_offset(index))?;
        let mut word = [0u8; 8];
        let pad = 8 - self.bytes_per_word as usize;
        ioutil::read_exact(file, &mut word[pad..])?;
        Ok(u64::from_be_bytes(word))
    }

    /// Read a slot; None when out of range or blank.
    pub fn get(&self, file: &mut File, index: u64) -> Result<Option<u64>> {
        if index >= self.len {
            return Ok(None);
        }
        let value = self.read_word(file, index)?;
        if value == self.blank_value() {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    pub fn set(&self, file: &mut File, index: u64, value: u64) -> Result<()> {
        let bytes = value.to_be_bytes();
        let pad = 8 - self.bytes_per_word as usize;
        assert!(
            bytes[..pad].iter().all(|&b| b == 0),
            "value {} does not fit in {}-byte word",
            value,
            self.bytes_per_word
        );
        file.seek(self.word_offset(index))?;
        file.write_bytes(&bytes[pad..])?;
        Ok(())
    }

    /// The value a blank slot reads back as.
    pub fn blank_value(&self) -> u64 {
        if self.bytes_per_word == 8 {
            u64::MAX
        } else {
            (1 << (8 * self.bytes_per_word)) - 1
        }
    }
}
