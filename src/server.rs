//! The storage server: multiplexes many client sessions over one storage
//! with a single-threaded readiness loop, distributes invalidations,
//! allocates oids without collisions across clients, and advances an
//! incremental pack on idle cycles.

use crate::address::{Listener, SocketAddress, StreamSock};
use crate::error::{Error, Result};
use crate::ioutil;
use crate::record::{split_oids, Oid};
use crate::storage::Storage;
use log::{debug, info, warn};
use rustc_hash::FxHashSet;
use std::os::unix::io::{AsRawFd, RawFd};

pub const PROTOCOL_VERSION: [u8; 4] = [0, 0, 0, 1];

pub const STATUS_OKAY: u8 = b'O';
pub const STATUS_KEYERROR: u8 = b'K';
pub const STATUS_INVALID: u8 = b'I';

/// Bytes committed before the server starts a pack on its own; zero
/// disables automatic packing.
pub const DEFAULT_GCBYTES: u64 = 0;

struct Session {
    sock: StreamSock,
    peer: String,
    /// Oids committed by other sessions since this one last synced.
    invalid: FxHashSet<Oid>,
    /// Oids issued to this session that it has not committed yet.
    unused_oids: FxHashSet<Oid>,
}

enum HandleResult {
    Continue,
    SessionClosed,
    Quit,
}

pub struct StorageServer {
    storage: Box<dyn Storage>,
    address: SocketAddress,
    sessions: Vec<Session>,
    packing: bool,
    bytes_since_pack: u64,
    gcbytes: u64,
}

impl StorageServer {
    pub fn new(storage: Box<dyn Storage>, address: SocketAddress, gcbytes: u64) -> StorageServer {
        StorageServer {
            storage,
            address,
            sessions: Vec::new(),
            packing: false,
            bytes_since_pack: 0,
            gcbytes,
        }
    }

    /// Run until a client sends the quit command.  I/O trouble on a
    /// session closes just that session; storage corruption or lock loss
    /// takes the server down.
    pub fn serve(&mut self) -> Result<()> {
        let listener = self.address.listen()?;
        info!("ready on {}", self.address);
        let result = self.serve_loop(&listener);
        self.address.cleanup();
        result
    }

    fn serve_loop(&mut self, listener: &Listener) -> Result<()> {
        loop {
            // A pack in progress turns the wait into a poll so idle
            // cycles can advance it.
            let timeout_ms = if self.packing { 0 } else { -1 };
            let fds: Vec<RawFd> = self.sessions.iter().map(|s| s.sock.as_raw_fd()).collect();
            let (accept_ready, ready) = poll_sockets(listener.as_raw_fd(), &fds, timeout_ms)?;
            if accept_ready {
                match listener.accept() {
                    Ok((sock, peer)) => {
                        debug!("connection from {}", peer);
                        self.sessions.push(Session {
                            sock,
                            peer,
                            invalid: FxHashSet::default(),
                            unused_oids: FxHashSet::default(),
                        });
                    }
                    Err(err) => warn!("accept failed: {}", err),
                }
            }
            let idle = !accept_ready && ready.is_empty();
            // Highest index first so removals don't shift pending entries.
            for index in ready.into_iter().rev() {
                match self.handle(index) {
                    Ok(HandleResult::Continue) => {}
                    Ok(HandleResult::SessionClosed) => self.drop_session(index, None),
                    Ok(HandleResult::Quit) => {
                        info!("quit");
                        self.storage.close()?;
                        return Ok(());
                    }
                    Err(err) if is_session_error(&err) => self.drop_session(index, Some(err)),
                    Err(err) => return Err(err),
                }
            }
            if !self.packing && self.gcbytes > 0 && self.bytes_since_pack >= self.gcbytes {
                self.packing = self.storage.start_pack()?;
                if self.packing {
                    info!("gc pack started after {} bytes", self.bytes_since_pack);
                } else {
                    // This storage cannot pack; stop asking.
                    self.bytes_since_pack = 0;
                }
            }
            if idle && self.packing && self.storage.pack_step()? {
                self.packing = false;
                self.bytes_since_pack = 0;
                info!("gc pack finished");
            }
        }
    }

    fn drop_session(&mut self, index: usize, err: Option<Error>) {
        let session = self.sessions.remove(index);
        match err {
            Some(err) => debug!("closing session {}: {}", session.peer, err),
            None => debug!("session {} closed", session.peer),
        }
        session.sock.shutdown();
    }

    fn handle(&mut self, index: usize) -> Result<HandleResult> {
        let command = ioutil::read_u8(&mut self.sessions[index].sock)?;
        match command {
            b'V' => self.handle_version(index)?,
            b'N' => self.handle_new_oid(index)?,
            b'M' => self.handle_new_oid_batch(index)?,
            b'L' => self.handle_load(index)?,
            b'B' => self.handle_bulk_load(index)?,
            b'C' => self.handle_commit(index)?,
            b'S' => self.handle_sync(index)?,
            b'P' => self.handle_pack(index)?,
            b'Q' => return Ok(HandleResult::Quit),
            b'.' => return Ok(HandleResult::SessionClosed),
            other => {
                return Err(Error::Protocol(format!(
                    "unknown command code {:?}",
                    other as char
                )));
            }
        }
        Ok(HandleResult::Continue)
    }

    fn handle_version(&mut self, index: usize) -> Result<()> {
        let sock = &mut self.sessions[index].sock;
        let mut client_version = [0u8; 4];
        ioutil::read_exact(sock, &mut client_version)?;
        ioutil::write_all(sock, &PROTOCOL_VERSION)?;
        if client_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "protocol version {:?} not supported",
                client_version
            )));
        }
        Ok(())
    }

    /// Issue oids, skipping any an uninformed session might still load
    /// stale state for.
    fn new_oids(&mut self, index: usize, count: usize) -> Result<Vec<Oid>> {
        let mut oids = Vec::with_capacity(count);
        while oids.len() < count {
            let oid = self.storage.new_oid()?;
            if self.sessions.iter().any(|s| s.invalid.contains(&oid)) {
                continue;
            }
            oids.push(oid);
        }
        self.sessions[index].unused_oids.extend(oids.iter().copied());
        Ok(oids)
    }

    fn handle_new_oid(&mut self, index: usize) -> Result<()> {
        let oid = self.new_oids(index, 1)?[0];
        ioutil::write_oid(&mut self.sessions[index].sock, oid)
    }

    fn handle_new_oid_batch(&mut self, index: usize) -> Result<()> {
        let count = ioutil::read_u8(&mut self.sessions[index].sock)? as usize;
        debug!("{} oids for {}", count, self.sessions[index].peer);
        let oids = self.new_oids(index, count)?;
        let sock = &mut self.sessions[index].sock;
        for oid in oids {
            ioutil::write_oid(sock, oid)?;
        }
        Ok(())
    }

    fn handle_load(&mut self, index: usize) -> Result<()> {
        let oid = ioutil::read_oid(&mut self.sessions[index].sock)?;
        self.send_load_response(index, oid)
    }

    fn send_load_response(&mut self, index: usize, oid: Oid) -> Result<()> {
        if self.sessions[index].invalid.contains(&oid) {
            return ioutil::write_u8(&mut self.sessions[index].sock, STATUS_INVALID);
        }
        match self.storage.load(oid) {
            Ok(record) => {
                let sock = &mut self.sessions[index].sock;
                ioutil::write_u8(sock, STATUS_OKAY)?;
                ioutil::write_u32_str(sock, &record)
            }
            Err(Error::KeyNotFound(_)) => {
                debug!("KeyError {}", oid);
                ioutil::write_u8(&mut self.sessions[index].sock, STATUS_KEYERROR)
            }
            Err(Error::ReadConflict(_)) => {
                debug!("ReadConflict {}", oid);
                ioutil::write_u8(&mut self.sessions[index].sock, STATUS_INVALID)
            }
            Err(err) => Err(err),
        }
    }

    fn handle_bulk_load(&mut self, index: usize) -> Result<()> {
        let oids = ioutil::read_oid_list(&mut self.sessions[index].sock)?;
        for oid in oids {
            self.send_load_response(index, oid)?;
        }
        Ok(())
    }

    /// Distribute pack-produced invalidations to every session.
    fn sync_storage(&mut self) -> Result<()> {
        let invalid = self.storage.sync()?;
        if !invalid.is_empty() {
            for session in &mut self.sessions {
                session.invalid.extend(invalid.iter().copied());
            }
        }
        Ok(())
    }

    fn handle_sync(&mut self, index: usize) -> Result<()> {
        self.sync_storage()?;
        let session = &mut self.sessions[index];
        let invalid: Vec<Oid> = session.invalid.drain().collect();
        debug!("sync {}: {} invalid", session.peer, invalid.len());
        ioutil::write_oid_list(&mut session.sock, &invalid)
    }

    fn handle_commit(&mut self, index: usize) -> Result<()> {
        self.sync_storage()?;
        let session = &mut self.sessions[index];
        let invalid: Vec<Oid> = session.invalid.drain().collect();
        ioutil::write_oid_list(&mut session.sock, &invalid)?;
        let tdata = ioutil::read_u32_str(&mut session.sock)?;
        if tdata.is_empty() {
            // The client decided not to commit, e.g. after a conflict.
            return Ok(());
        }
        debug!("committing {} bytes", tdata.len());
        let mut records = Vec::new();
        let mut cursor = &tdata[..];
        while !cursor.is_empty() {
            let record_length = ioutil::read_u32(&mut cursor)? as usize;
            if record_length < 8 || cursor.len() < record_length {
                return Err(Error::Protocol(format!(
                    "bad record framing in commit of {} bytes",
                    tdata.len()
                )));
            }
            let oid = split_oids(&cursor[..8])?[0];
            let record = cursor[8..record_length].to_vec();
            cursor = &cursor[record_length..];
            // A client may only commit oids it was issued or already owns
            // on disk; an oid issued to another session is a protocol
            // violation.
            if self
                .sessions
                .iter()
                .enumerate()
                .any(|(i, other)| i != index && other.unused_oids.contains(&oid))
            {
                return Err(Error::Protocol(format!(
                    "commit of oid {} issued to another client",
                    oid
                )));
            }
            records.push((oid, record));
        }
        self.storage.begin();
        let mut oids = Vec::with_capacity(records.len());
        for (oid, record) in records {
            self.storage.store(oid, record);
            oids.push(oid);
        }
        let StorageServer {
            storage, sessions, ..
        } = self;
        let result = storage.end(&mut |invalidated| {
            for session in sessions.iter_mut() {
                session.invalid.extend(invalidated.iter().copied());
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                info!("committed {} objects, {} bytes", oids.len(), tdata.len());
                for oid in &oids {
                    self.sessions[index].unused_oids.remove(oid);
                }
                for (other_index, other) in self.sessions.iter_mut().enumerate() {
                    if other_index != index {
                        other.invalid.extend(oids.iter().copied());
                    }
                }
                self.bytes_since_pack += tdata.len() as u64 + 8;
                ioutil::write_u8(&mut self.sessions[index].sock, STATUS_OKAY)
            }
            Err(err) if err.is_conflict() => {
                info!("conflict during commit");
                ioutil::write_u8(&mut self.sessions[index].sock, STATUS_INVALID)
            }
            Err(err) => Err(err),
        }
    }

    fn handle_pack(&mut self, index: usize) -> Result<()> {
        if !self.packing {
            info!("pack requested by {}", self.sessions[index].peer);
            self.packing = self.storage.start_pack()?;
            if !self.packing {
                // No incremental packer; do it all now.
                self.storage.pack()?;
            }
        } else {
            info!("pack already in progress");
        }
        ioutil::write_u8(&mut self.sessions[index].sock, STATUS_OKAY)
    }
}

fn is_session_error(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Protocol(_) | Error::ShortRead)
}

/// Wait for readiness on the listener and every session socket.  Returns
/// whether the listener is ready plus the indexes of ready sessions.
/// A negative timeout blocks until something happens.
fn poll_sockets(
    listener_fd: RawFd,
    session_fds: &[RawFd],
    timeout_ms: i32,
) -> Result<(bool, Vec<usize>)> {
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(session_fds.len() + 1);
    fds.push(libc::pollfd {
        fd: listener_fd,
        events: libc::POLLIN,
        revents: 0,
    });
    for &fd in session_fds {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok((false, Vec::new()));
        }
        return Err(Error::Io(err));
    }
    let ready_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    let accept_ready = fds[0].revents & ready_mask != 0;
    let ready = fds[1..]
        .iter()
        .enumerate()
        .filter(|(_, fd)| fd.revents & ready_mask != 0)
        .map(|(i, _)| i)
        .collect();
    Ok((accept_ready, ready))
}
