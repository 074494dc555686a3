//! Object identifiers and the packed object record format.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Persistent objects are identified by 8-byte unsigned big-endian integers
/// that are stable for the life of the storage.  The allocator keeps them
/// dense so the on-disk offset map stays small.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Oid(pub u64);

/// The root object always has this oid.
pub const ROOT_OID: Oid = Oid(0);

impl Oid {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Oid {
        Oid(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build the bytes of one object record: oid, 4-byte big-endian length of
/// the state data, the state data, then the referenced oids back to back.
pub fn pack_record(oid: Oid, data: &[u8], refs: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(12 + data.len() + refs.len());
    record.extend_from_slice(&oid.to_bytes());
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, data.len() as u32);
    record.extend_from_slice(&len);
    record.extend_from_slice(data);
    record.extend_from_slice(refs);
    record
}

/// The inverse of pack_record: (oid, state data, packed reference oids).
pub fn unpack_record(record: &[u8]) -> Result<(Oid, &[u8], &[u8])> {
    if record.len() < 12 {
        return Err(Error::Corrupt(format!(
            "object record too short: {} bytes",
            record.len()
        )));
    }
    let mut oid = [0u8; 8];
    oid.copy_from_slice(&record[..8]);
    let data_length = BigEndian::read_u32(&record[8..12]) as usize;
    let data_end = 12 + data_length;
    if record.len() < data_end || (record.len() - data_end) % 8 != 0 {
        return Err(Error::Corrupt(format!(
            "bad object record: data length {} in {}-byte record",
            data_length,
            record.len()
        )));
    }
    Ok((
        Oid::from_bytes(oid),
        &record[12..data_end],
        &record[data_end..],
    ))
}

/// Split a packed string of 8-byte oids.
pub fn split_oids(bytes: &[u8]) -> Result<Vec<Oid>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::Corrupt(format!(
            "oid sequence of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut oid = [0u8; 8];
            oid.copy_from_slice(chunk);
            Oid::from_bytes(oid)
        })
        .collect())
}

/// The inverse of split_oids.
pub fn join_oids(oids: &[Oid]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(oids.len() * 8);
    for oid in oids {
        bytes.extend_from_slice(&oid.to_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let refs = join_oids(&[Oid(7), Oid(3)]);
        let record = pack_record(Oid(1), b"state", &refs);
        let (oid, data, refdata) = unpack_record(&record).unwrap();
        assert_eq!(oid, Oid(1));
        assert_eq!(data, b"state");
        assert_eq!(split_oids(refdata).unwrap(), vec![Oid(7), Oid(3)]);
    }

    #[test]
    fn record_with_bad_length_is_rejected() {
        let mut record = pack_record(Oid(1), b"state", &[]);
        record.truncate(14);
        assert!(unpack_record(&record).is_err());
        assert!(unpack_record(b"tiny").is_err());
    }
}
