//! The serialization boundary.  Object state is stored as a class tag
//! followed by a framed payload; references are collected while encoding
//! so records carry their outgoing oids for reachability traversal without
//! decoding.  A leading sentinel byte on the payload frame distinguishes
//! zlib-compressed from raw state.

use crate::error::{Error, Result};
use crate::persistent::{ClassRegistry, ObjectState, PObject, PRef};
use crate::record::{join_oids, Oid};
use crate::storage::Storage;
use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::{Read, Write};

const FRAME_RAW: u8 = 0;
const FRAME_ZLIB: u8 = 1;

/// Only payloads at least this large are worth compressing.
const COMPRESS_THRESHOLD: usize = 64;

/// Receives the references seen while encoding, assigning oids to objects
/// that have never been stored.
pub(crate) trait RefSink {
    fn connection_id(&self) -> u64;

    fn ref_oid(&mut self, obj: &PObject) -> Result<Oid>;
}

/// Accumulates one object's encoded state and the set of oids it refers to.
pub struct StateEncoder<'a> {
    buf: Vec<u8>,
    refs: BTreeSet<Oid>,
    sink: &'a mut dyn RefSink,
}

impl<'a> StateEncoder<'a> {
    pub(crate) fn new(sink: &'a mut dyn RefSink) -> StateEncoder<'a> {
        StateEncoder {
            buf: Vec::new(),
            refs: BTreeSet::new(),
            sink,
        }
    }

    pub fn put_u8(&mut self, n: u8) {
        self.buf.push(n);
    }

    pub fn put_u32(&mut self, n: u32) {
        let mut bytes = [0u8; 4];
        BigEndian::write_u32(&mut bytes, n);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_u64(&mut self, n: u64) {
        let mut bytes = [0u8; 8];
        BigEndian::write_u64(&mut bytes, n);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Write a reference as an 8-byte oid, assigning one if the target has
    /// never been stored, and record it in the reference set.  References
    /// to objects owned by a different connection are rejected.
    pub fn put_ref(&mut self, reference: &PRef) -> Result<()> {
        let oid = match reference.direct() {
            Some(obj) => self.sink.ref_oid(&obj)?,
            None => {
                if let Some(owner) = reference.owner() {
                    if owner != self.sink.connection_id() {
                        return Err(Error::InvalidObjectReference);
                    }
                }
                reference
                    .oid()
                    .expect("reference is neither direct nor named")
            }
        };
        reference.normalize();
        self.refs.insert(oid);
        self.buf.extend_from_slice(&oid.to_bytes());
        Ok(())
    }

    fn finish(self) -> (Vec<u8>, BTreeSet<Oid>) {
        (self.buf, self.refs)
    }
}

/// Reads back what StateEncoder wrote.
pub struct StateDecoder<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> StateDecoder<'a> {
    pub fn new(data: &'a [u8]) -> StateDecoder<'a> {
        StateDecoder { data, position: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.position < n {
            return Err(Error::ShortRead);
        }
        let bytes = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.get_u32()? as usize;
        self.take(n)
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.get_bytes()?)
            .map_err(|_| Error::Corrupt("state string is not utf-8".to_string()))
    }

    pub fn get_ref(&mut self) -> Result<PRef> {
        Ok(PRef::from_oid(Oid(self.get_u64()?)))
    }
}

/// Build the state-data portion of a record: class tag, then the payload
/// frame, compressed when that pays off.
pub fn pack_state(class_name: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + class_name.len() + 1 + payload.len());
    let mut tag_len = [0u8; 2];
    BigEndian::write_u16(&mut tag_len, class_name.len() as u16);
    data.extend_from_slice(&tag_len);
    data.extend_from_slice(class_name.as_bytes());
    if payload.len() >= COMPRESS_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        // Writing into a Vec cannot fail.
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();
        if compressed.len() < payload.len() {
            data.push(FRAME_ZLIB);
            data.extend_from_slice(&compressed);
            return data;
        }
    }
    data.push(FRAME_RAW);
    data.extend_from_slice(payload);
    data
}

/// Read the class tag alone; enough to construct a ghost.
pub fn extract_class_name(data: &[u8]) -> Result<&str> {
    if data.len() < 2 {
        return Err(Error::ShortRead);
    }
    let tag_len = BigEndian::read_u16(&data[..2]) as usize;
    if data.len() < 2 + tag_len {
        return Err(Error::ShortRead);
    }
    std::str::from_utf8(&data[2..2 + tag_len])
        .map_err(|_| Error::Corrupt("class tag is not utf-8".to_string()))
}

/// Split state data into its class tag and decompressed payload.
pub fn unpack_state(data: &[u8]) -> Result<(&str, Vec<u8>)> {
    let class_name = extract_class_name(data)?;
    let frame = &data[2 + class_name.len()..];
    if frame.is_empty() {
        return Err(Error::ShortRead);
    }
    let payload = match frame[0] {
        FRAME_RAW => frame[1..].to_vec(),
        FRAME_ZLIB => {
            let mut payload = Vec::new();
            ZlibDecoder::new(&frame[1..])
                .read_to_end(&mut payload)
                .map_err(|_| Error::Corrupt("bad compressed state frame".to_string()))?;
            payload
        }
        other => {
            return Err(Error::Corrupt(format!("unknown state frame sentinel {}", other)));
        }
    };
    Ok((class_name, payload))
}

/// Decode full state through the registry.
pub(crate) fn decode_state(
    registry: &ClassRegistry,
    data: &[u8],
) -> Result<Box<dyn ObjectState>> {
    let (class_name, payload) = unpack_state(data)?;
    let (_, decode) = registry
        .lookup(class_name)
        .ok_or_else(|| Error::Corrupt(format!("unknown class tag {:?}", class_name)))?;
    decode(&mut StateDecoder::new(&payload))
}

/// Serializes the objects of one commit.  Encoding a changed object may
/// discover referenced objects that have never been assigned an oid; they
/// are named on the spot and queued so the commit stores them too.
pub(crate) struct ObjectWriter<'a> {
    pub storage: &'a mut dyn Storage,
    pub connection_id: u64,
    found: std::collections::VecDeque<PObject>,
}

impl<'a> ObjectWriter<'a> {
    pub fn new(storage: &'a mut dyn Storage, connection_id: u64) -> ObjectWriter<'a> {
        ObjectWriter {
            storage,
            connection_id,
            found: std::collections::VecDeque::new(),
        }
    }

    /// The next discovered object that still needs storing.
    pub fn next_new_object(&mut self) -> Option<PObject> {
        self.found.pop_front()
    }

    /// Encode one object's state: (state data, packed reference oids).
    pub fn get_state(&mut self, obj: &PObject) -> Result<(Vec<u8>, Vec<u8>)> {
        let state_cell = obj.state().borrow();
        let state = state_cell
            .as_ref()
            .expect("cannot serialize a ghost");
        let class_name = state.class_name();
        let mut encoder = StateEncoder::new(self);
        state.encode(&mut encoder)?;
        let (payload, mut refs) = encoder.finish();
        if let Some(oid) = obj.oid() {
            refs.remove(&oid);
        }
        let sorted: Vec<Oid> = refs.into_iter().collect();
        Ok((pack_state(class_name, &payload), join_oids(&sorted)))
    }
}

impl RefSink for ObjectWriter<'_> {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn ref_oid(&mut self, obj: &PObject) -> Result<Oid> {
        match obj.oid() {
            Some(oid) => {
                if obj.owner() != Some(self.connection_id) {
                    return Err(Error::InvalidObjectReference);
                }
                Ok(oid)
            }
            None => {
                let oid = self.storage.new_oid()?;
                obj.set_oid(Some(oid));
                obj.set_owner(Some(self.connection_id));
                self.found.push_back(obj.clone());
                Ok(oid)
            }
        }
    }
}
