//! A Storage that talks to a storage server over the wire protocol.
//! Oids are requested in batches to amortize round trips; conflict and
//! key-error statuses come back as the typed error kinds.

use crate::address::{SocketAddress, StreamSock};
use crate::error::{Error, Result};
use crate::ioutil;
use crate::record::Oid;
use crate::server::{PROTOCOL_VERSION, STATUS_INVALID, STATUS_KEYERROR, STATUS_OKAY};
use crate::storage::Storage;
use log::debug;
use rustc_hash::FxHashMap;

const OID_POOL_SIZE: u8 = 32;

pub struct ClientStorage {
    sock: StreamSock,
    address: SocketAddress,
    /// Oids issued by the server and not yet used, popped from the back.
    oid_pool: Vec<Oid>,
    /// Records staged between begin and end.
    records: FxHashMap<Oid, Vec<u8>>,
    /// Pool oids consumed by the transaction underway, returned to the
    /// pool if the commit conflicts.
    transaction_new_oids: Vec<Oid>,
    closed: bool,
}

impl ClientStorage {
    pub fn connect(address: SocketAddress) -> Result<ClientStorage> {
        let sock = address.connect()?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("could not connect to {}", address),
            ))
        })?;
        let mut client = ClientStorage {
            sock,
            address,
            oid_pool: Vec::new(),
            records: FxHashMap::default(),
            transaction_new_oids: Vec::new(),
            closed: false,
        };
        ioutil::write_u8(&mut client.sock, b'V')?;
        ioutil::write_all(&mut client.sock, &PROTOCOL_VERSION)?;
        let mut server_version = [0u8; 4];
        ioutil::read_exact(&mut client.sock, &mut server_version)?;
        if server_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "server speaks protocol version {:?}",
                server_version
            )));
        }
        Ok(client)
    }

    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    fn read_load_response(&mut self, oid: Oid) -> Result<Vec<u8>> {
        match ioutil::read_u8(&mut self.sock)? {
            STATUS_OKAY => ioutil::read_u32_str(&mut self.sock),
            STATUS_INVALID => Err(Error::ReadConflict(vec![oid])),
            STATUS_KEYERROR => Err(Error::KeyNotFound(oid)),
            status => Err(Error::Protocol(format!(
                "load status {:?} for oid {}",
                status as char, oid
            ))),
        }
    }
}

impl Storage for ClientStorage {
    fn load(&mut self, oid: Oid) -> Result<Vec<u8>> {
        ioutil::write_u8(&mut self.sock, b'L')?;
        ioutil::write_oid(&mut self.sock, oid)?;
        self.read_load_response(oid)
    }

    fn begin(&mut self) {
        self.records.clear();
        self.transaction_new_oids.clear();
    }

    fn store(&mut self, oid: Oid, record: Vec<u8>) {
        debug_assert!(!self.records.contains_key(&oid), "oid {} stored twice", oid);
        self.records.insert(oid, record);
    }

    fn end(&mut self, handle_invalidations: &mut dyn FnMut(&[Oid]) -> Result<()>) -> Result<()> {
        ioutil::write_u8(&mut self.sock, b'C')?;
        let invalid = ioutil::read_oid_list(&mut self.sock)?;
        if !invalid.is_empty() {
            if let Err(err) = handle_invalidations(&invalid) {
                // Return the oids this transaction consumed to the pool
                // and tell the server nothing is coming.
                self.transaction_new_oids.reverse();
                let returned = std::mem::take(&mut self.transaction_new_oids);
                self.oid_pool.extend(returned);
                self.records.clear();
                ioutil::write_u32(&mut self.sock, 0)?;
                return Err(err);
            }
        }
        let mut tdata = Vec::new();
        for (oid, record) in &self.records {
            ioutil::write_u32(&mut tdata, 8 + record.len() as u32)?;
            tdata.extend_from_slice(&oid.to_bytes());
            tdata.extend_from_slice(record);
        }
        ioutil::write_u32_str(&mut self.sock, &tdata)?;
        self.records.clear();
        if tdata.is_empty() {
            return Ok(());
        }
        match ioutil::read_u8(&mut self.sock)? {
            STATUS_OKAY => Ok(()),
            STATUS_INVALID => Err(Error::WriteConflict(Vec::new())),
            status => Err(Error::Protocol(format!(
                "commit status {:?}",
                status as char
            ))),
        }
    }

    fn sync(&mut self) -> Result<Vec<Oid>> {
        ioutil::write_u8(&mut self.sock, b'S')?;
        ioutil::read_oid_list(&mut self.sock)
    }

    fn new_oid(&mut self) -> Result<Oid> {
        if self.oid_pool.is_empty() {
            ioutil::write_u8(&mut self.sock, b'M')?;
            ioutil::write_u8(&mut self.sock, OID_POOL_SIZE)?;
            let bytes = ioutil::read_bytes(&mut self.sock, OID_POOL_SIZE as usize * 8)?;
            let mut batch = crate::record::split_oids(&bytes)?;
            debug!("issued {} oids", batch.len());
            batch.reverse();
            self.oid_pool = batch;
        }
        let oid = self.oid_pool.pop().expect("oid pool refilled above");
        self.transaction_new_oids.push(oid);
        Ok(oid)
    }

    fn bulk_load(&mut self, oids: &[Oid]) -> Result<Vec<Vec<u8>>> {
        ioutil::write_u8(&mut self.sock, b'B')?;
        ioutil::write_oid_list(&mut self.sock, oids)?;
        oids.iter()
            .map(|&oid| self.read_load_response(oid))
            .collect()
    }

    fn pack(&mut self) -> Result<()> {
        ioutil::write_u8(&mut self.sock, b'P')?;
        match ioutil::read_u8(&mut self.sock)? {
            STATUS_OKAY => Ok(()),
            status => Err(Error::Protocol(format!("pack status {:?}", status as char))),
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            // Closes the server side of the session.
            let _ = ioutil::write_u8(&mut self.sock, b'.');
            self.sock.shutdown();
        }
        Ok(())
    }
}

impl Drop for ClientStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
