//! Integration tests.  Run the durus server binary against a temp
//! directory and drive it with live client connections over TCP.

use durus::address::{wait_for_server, SocketAddress};
use durus::client_storage::ClientStorage;
use durus::connection::Connection;
use durus::error::Error;
use durus::persistent::{ClassRegistry, PersistentObject};
use durus::pmap::PMap;
use durus::record::{Oid, ROOT_OID};
use durus::server::PROTOCOL_VERSION;
use durus::storage::Storage;
use std::io::{Read, Write};
use std::time::Duration;

fn durus_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("durus")
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind to any port");
    listener.local_addr().unwrap().port()
}

/// Manages a server process on its own port with its own storage file.
struct TestServer {
    child: std::process::Child,
    address: SocketAddress,
    dir: tempfile::TempDir,
}

impl TestServer {
    fn start(extra_args: &[&str]) -> anyhow::Result<TestServer> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("test.durus");
        let port = free_port();
        let child = std::process::Command::new(durus_binary())
            .arg("serve")
            .args(["--file", file.to_str().unwrap()])
            .args(["--port", &port.to_string()])
            .args(extra_args)
            .spawn()?;
        let address = SocketAddress::inet("127.0.0.1", port);
        wait_for_server(&address, 200, Duration::from_millis(25))?;
        Ok(TestServer {
            child,
            address,
            dir,
        })
    }

    fn client(&self) -> ClientStorage {
        ClientStorage::connect(self.address.clone()).expect("connect to test server")
    }

    fn connection(&self) -> Connection {
        Connection::open(Box::new(self.client())).expect("open connection")
    }

    fn storage_file(&self) -> std::path::PathBuf {
        self.dir.path().join("test.durus")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn commit_on_one_client_invalidates_the_other() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let mut a = server.connection();
    let mut b = server.connection();

    let root_a = a.root();
    let child = PersistentObject::new(Box::new(PMap::new()));
    a.update(&root_a, |map: &mut PMap| {
        map.insert_object("x", &child);
    })?;
    a.commit()?;
    // A's own view is clean after its commit.
    assert!(a.sync()?.is_empty());

    let invalid = b.sync()?;
    assert!(invalid.contains(&ROOT_OID), "invalid: {:?}", invalid);
    let root_b = b.root();
    assert!(b.read(&root_b, |map: &PMap| map.contains_key("x"))?);
    Ok(())
}

#[test]
fn write_conflict_goes_to_the_second_committer() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let mut a = server.connection();
    let mut b = server.connection();

    let root_a = a.root();
    a.read(&root_a, |map: &PMap| map.len())?;

    let root_b = b.root();
    b.update(&root_b, |map: &mut PMap| {
        map.insert_bytes("winner", &b"b"[..]);
    })?;
    b.commit()?;

    a.update(&root_a, |map: &mut PMap| {
        map.insert_bytes("loser", &b"a"[..]);
    })?;
    match a.commit() {
        Err(Error::WriteConflict(_)) => (),
        other => panic!("expected WriteConflict, got {:?}", other.err()),
    }
    a.abort()?;
    let winner = a.read(&root_a, |map: &PMap| map.get_bytes("winner").unwrap().to_vec())?;
    assert_eq!(winner, b"b");
    Ok(())
}

#[test]
fn stale_reads_conflict_until_abort() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let mut registry = ClassRegistry::new();
    durus::pmap::register(&mut registry);
    // A tiny cache so objects age out into ghosts quickly.
    let mut a = Connection::open_with(Box::new(server.client()), registry, 1)?;
    let mut b = server.connection();

    // B publishes two children.
    let root_b = b.root();
    let w = PersistentObject::new(Box::new(PMap::new()));
    let x = PersistentObject::new(Box::new(PMap::new()));
    b.update(&root_b, |map: &mut PMap| {
        map.insert_object("w", &w);
        map.insert_object("x", &x);
    })?;
    b.commit()?;

    a.sync()?;
    let root_a = a.root();
    let (w_oid, x_oid) = a.read(&root_a, |map: &PMap| {
        (
            map.get_ref("w").unwrap().oid().unwrap(),
            map.get_ref("x").unwrap().oid().unwrap(),
        )
    })?;
    let x_a = a.get(x_oid)?.unwrap();
    a.read(&x_a, |map: &PMap| map.len())?;
    // Age x out of the cache: two transactions without touching it.
    a.commit()?;
    a.commit()?;
    assert!(x_a.is_ghost());

    // W is accessed in the current transaction.
    let w_a = a.get(w_oid)?.unwrap();
    a.read(&w_a, |map: &PMap| map.len())?;

    // B updates both objects.
    b.update(&w, |map: &mut PMap| {
        map.insert_bytes("v", &b"2"[..]);
    })?;
    b.update(&x, |map: &mut PMap| {
        map.insert_bytes("v", &b"2"[..]);
    })?;
    b.commit()?;

    // Loading the ghost now trips over the invalidation of w, which was
    // accessed this transaction.
    match a.read(&x_a, |map: &PMap| map.len()) {
        Err(Error::ReadConflict(oids)) => assert_eq!(oids, vec![x_oid]),
        other => panic!("expected ReadConflict, got {:?}", other.err()),
    }
    // The connection stays conflicted: committing without an abort is
    // refused.
    a.update(&w_a, |map: &mut PMap| {
        map.insert_bytes("dirty", &b"1"[..]);
    })?;
    match a.commit() {
        Err(Error::WriteConflict(_)) => (),
        other => panic!("expected WriteConflict, got {:?}", other.err()),
    }
    a.abort()?;
    let v = a.read(&x_a, |map: &PMap| map.get_bytes("v").unwrap().to_vec())?;
    assert_eq!(v, b"2");
    Ok(())
}

#[test]
fn load_of_unknown_oid_is_a_key_error() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let mut conn = server.connection(); // bootstraps the root
    assert!(conn.get(Oid(999))?.is_none());

    let mut client = server.client();
    match client.load(Oid(999)) {
        Err(Error::KeyNotFound(Oid(999))) => (),
        other => panic!("expected KeyNotFound, got {:?}", other.err()),
    }
    // Bulk load mixes hits and the root.
    let records = client.bulk_load(&[ROOT_OID])?;
    assert_eq!(records.len(), 1);
    Ok(())
}

#[test]
fn server_pack_keeps_data_and_leaves_a_prepack_file() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let mut conn = server.connection();
    let root = conn.root();
    for i in 0..10 {
        let child = PersistentObject::new(Box::new(PMap::new()));
        conn.update(&root, |map: &mut PMap| {
            map.insert_object(format!("c{}", i), &child);
        })?;
    }
    conn.commit()?;
    // Drop four children.
    conn.update(&root, |map: &mut PMap| {
        for i in 0..4 {
            map.remove(&format!("c{}", i));
        }
    })?;
    conn.commit()?;

    conn.pack()?;
    // The pack advances on the server's idle cycles; wait for the swap.
    let prepack = {
        let mut name = server.storage_file().into_os_string();
        name.push(".prepack");
        std::path::PathBuf::from(name)
    };
    for _ in 0..200 {
        if prepack.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    assert!(prepack.exists(), "pack did not complete");

    // Everything still reachable is still readable from a fresh client.
    let mut fresh = server.connection();
    let fresh_root = fresh.root();
    let len = fresh.read(&fresh_root, |map: &PMap| map.len())?;
    assert_eq!(len, 6);
    for i in 4..10 {
        let reference = fresh
            .read(&fresh_root, |map: &PMap| map.get_ref(&format!("c{}", i)))?
            .unwrap();
        let child = fresh.get(reference.oid().unwrap())?.unwrap();
        fresh.read(&child, |map: &PMap| assert!(map.is_empty()))?;
    }
    Ok(())
}

#[test]
fn autopack_by_gcbytes_survives_concurrent_commits() -> anyhow::Result<()> {
    let server = TestServer::start(&["--gcbytes", "1"])?;
    let mut conn = server.connection();
    let root = conn.root();
    // Keep committing while the server is packing between requests.
    for round in 0..10 {
        let child = PersistentObject::new(Box::new(PMap::new()));
        conn.update(&root, |map: &mut PMap| {
            map.insert_object(format!("r{}", round), &child);
        })?;
        conn.commit()?;
    }
    std::thread::sleep(Duration::from_millis(250));

    let mut fresh = server.connection();
    let fresh_root = fresh.root();
    let len = fresh.read(&fresh_root, |map: &PMap| map.len())?;
    assert_eq!(len, 10);
    Ok(())
}

#[test]
fn protocol_version_mismatch_closes_only_that_session() -> anyhow::Result<()> {
    let server = TestServer::start(&[])?;
    let SocketAddress::Inet { host, port } = &server.address else {
        unreachable!();
    };
    let mut raw = std::net::TcpStream::connect((host.as_str(), *port))?;
    raw.write_all(b"V\x00\x00\x00\x09")?;
    let mut reply = [0u8; 4];
    raw.read_exact(&mut reply)?;
    assert_eq!(reply, PROTOCOL_VERSION);
    // The server hangs up on us.
    let mut scratch = [0u8; 1];
    assert_eq!(raw.read(&mut scratch)?, 0);

    // But other sessions are unaffected.
    let mut conn = server.connection();
    assert!(conn.get(ROOT_OID)?.is_some());
    Ok(())
}

#[test]
fn pack_subcommand_packs_a_file_directly() -> anyhow::Result<()> {
    use durus::shelf_storage::ShelfStorage;
    use durus::storage::RecordWalk;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("offline.durus");
    {
        let storage = ShelfStorage::open(&path, false, false)?;
        let mut conn = Connection::open(Box::new(storage))?;
        let root = conn.root();
        let child = PersistentObject::new(Box::new(PMap::new()));
        conn.update(&root, |map: &mut PMap| {
            map.insert_object("keep", &child);
        })?;
        conn.commit()?;
        conn.update(&root, |map: &mut PMap| {
            map.remove("keep");
        })?;
        conn.commit()?;
    }
    let status = std::process::Command::new(durus_binary())
        .args(["pack", "--file", path.to_str().unwrap()])
        .status()?;
    assert!(status.success());

    let mut storage = ShelfStorage::open(&path, false, false)?;
    let mut walk = RecordWalk::full(&mut storage)?;
    let mut live = 0;
    while walk.next(&mut storage)?.is_some() {
        live += 1;
    }
    assert_eq!(live, 1); // only the root survives
    Ok(())
}

#[test]
fn stop_subcommand_shuts_the_server_down() -> anyhow::Result<()> {
    let mut server = TestServer::start(&[])?;
    let SocketAddress::Inet { port, .. } = &server.address else {
        unreachable!();
    };
    let status = std::process::Command::new(durus_binary())
        .args(["stop", "--port", &port.to_string()])
        .status()?;
    assert!(status.success());
    let exit = server.child.wait()?;
    assert!(exit.success());
    Ok(())
}
