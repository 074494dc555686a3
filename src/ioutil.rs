//! Framed big-endian integer and byte-string I/O, shared by the on-disk
//! format and the wire protocol.  A read that comes up short maps to
//! Error::ShortRead so callers can tell truncation from other I/O trouble.

use crate::error::{Error, Result};
use crate::record::{join_oids, split_oids, Oid};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Write};

pub fn read_exact<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ShortRead),
        Err(err) => Err(Error::Io(err)),
    }
}

pub fn read_u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

pub fn read_u32<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(BigEndian::read_u32(&buf))
}

pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(BigEndian::read_u64(&buf))
}

pub fn read_oid<R: Read + ?Sized>(r: &mut R) -> Result<Oid> {
    Ok(Oid(read_u64(r)?))
}

pub fn read_bytes<R: Read + ?Sized>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

/// Read an 8-byte length followed by that many bytes.
pub fn read_u64_str<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let n = read_u64(r)?;
    read_bytes(r, n as usize)
}

/// Read a 4-byte length followed by that many bytes.
pub fn read_u32_str<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let n = read_u32(r)?;
    read_bytes(r, n as usize)
}

/// Read a 4-byte count followed by that many 8-byte oids.
pub fn read_oid_list<R: Read + ?Sized>(r: &mut R) -> Result<Vec<Oid>> {
    let n = read_u32(r)?;
    let bytes = read_bytes(r, n as usize * 8)?;
    split_oids(&bytes)
}

pub fn write_all<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_all(bytes)?;
    Ok(())
}

pub fn write_u8<W: Write + ?Sized>(w: &mut W, n: u8) -> Result<()> {
    write_all(w, &[n])
}

pub fn write_u32<W: Write + ?Sized>(w: &mut W, n: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, n);
    write_all(w, &buf)
}

pub fn write_u64<W: Write + ?Sized>(w: &mut W, n: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, n);
    write_all(w, &buf)
}

pub fn write_oid<W: Write + ?Sized>(w: &mut W, oid: Oid) -> Result<()> {
    write_u64(w, oid.0)
}

pub fn write_u64_str<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u64(w, bytes.len() as u64)?;
    write_all(w, bytes)
}

pub fn write_u32_str<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len() as u32)?;
    write_all(w, bytes)
}

pub fn write_oid_list<W: Write + ?Sized>(w: &mut W, oids: &[Oid]) -> Result<()> {
    write_u32(w, oids.len() as u32)?;
    write_all(w, &join_oids(oids))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_round_trip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0x0102030405060708).unwrap();
        write_u32_str(&mut buf, b"ok").unwrap();
        write_oid_list(&mut buf, &[Oid(5), Oid(9)]).unwrap();
        let mut r = &buf[..];
        assert_eq!(read_u64(&mut r).unwrap(), 0x0102030405060708);
        assert_eq!(read_u32_str(&mut r).unwrap(), b"ok");
        assert_eq!(read_oid_list(&mut r).unwrap(), vec![Oid(5), Oid(9)]);
    }

    #[test]
    fn big_endian_on_the_wire() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 1).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn truncated_read_is_short_read() {
        let mut r = &[0u8, 0, 0][..];
        match read_u64(&mut r) {
            Err(Error::ShortRead) => (),
            other => panic!("expected ShortRead, got {:?}", other.map(|_| ())),
        }
    }
}
