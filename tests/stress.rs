//! Randomized multi-connection workload against a live server: a model
//! map tracks every successfully committed change, conflicted commits are
//! aborted and retried by later rounds, and packs run underneath it all.
//! At the end, a fresh connection must agree with the model exactly.

use durus::address::{wait_for_server, SocketAddress};
use durus::client_storage::ClientStorage;
use durus::connection::Connection;
use durus::persistent::PersistentObject;
use durus::pmap::PMap;
use durus::storage::Storage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
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

#[test]
fn random_workload_converges_on_the_committed_state() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("stress.durus");
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let server = ServerGuard(
        std::process::Command::new(durus_binary())
            .arg("serve")
            .args(["--file", file.to_str().unwrap()])
            .args(["--port", &port.to_string()])
            .spawn()?,
    );
    let address = SocketAddress::inet("127.0.0.1", port);
    wait_for_server(&address, 200, Duration::from_millis(25))?;

    let keys = ["a", "b", "c", "d", "e", "f", "g", "h"];
    let mut rng = StdRng::seed_from_u64(2972);
    let mut connections: Vec<Connection> = (0..3)
        .map(|_| Connection::open(Box::new(ClientStorage::connect(address.clone()).unwrap())))
        .collect::<Result<_, _>>()?;
    // What the store must contain: only changes whose commit succeeded.
    let mut model: HashMap<String, Vec<u8>> = HashMap::new();

    for round in 0..120u32 {
        let conn = &mut connections[rng.gen_range(0..3)];
        let key = keys[rng.gen_range(0..keys.len())];
        let root = conn.root();
        let committed = if rng.gen_bool(0.7) {
            // Store the value inside a fresh child object.
            let value = format!("value-{}", round).into_bytes();
            let child = PersistentObject::new(Box::new(PMap::new()));
            match conn.update(&root, |map: &mut PMap| {
                map.insert_object(key, &child);
            }) {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {
                    conn.abort()?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            conn.update(&child, |map: &mut PMap| {
                map.insert_bytes("v", value.clone());
            })?;
            match conn.commit() {
                Ok(()) => {
                    model.insert(key.to_string(), value);
                    true
                }
                Err(err) if err.is_conflict() => false,
                Err(err) => return Err(err.into()),
            }
        } else {
            match conn.update(&root, |map: &mut PMap| {
                map.remove(key);
            }) {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {
                    conn.abort()?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            match conn.commit() {
                Ok(()) => {
                    model.remove(key);
                    true
                }
                Err(err) if err.is_conflict() => false,
                Err(err) => return Err(err.into()),
            }
        };
        if !committed {
            conn.abort()?;
        }
        if round % 40 == 39 {
            let mut packer = ClientStorage::connect(address.clone())?;
            packer.pack()?;
            // Let the server's idle cycles finish the pack.
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    // A fresh connection sees exactly the committed state.
    let mut fresh = Connection::open(Box::new(ClientStorage::connect(address)?))?;
    let root = fresh.root();
    let stored_keys: Vec<String> = fresh.read(&root, |map: &PMap| {
        map.keys().map(str::to_string).collect()
    })?;
    let mut expected: Vec<&String> = model.keys().collect();
    expected.sort();
    let mut actual: Vec<&String> = stored_keys.iter().collect();
    actual.sort();
    assert_eq!(actual, expected);
    for (key, value) in &model {
        let reference = fresh
            .read(&root, |map: &PMap| map.get_ref(key))?
            .expect("committed key has a child");
        let child = fresh.get(reference.oid().unwrap())?.expect("child record");
        let stored = fresh.read(&child, |map: &PMap| map.get_bytes("v").unwrap().to_vec())?;
        assert_eq!(&stored, value, "key {:?}", key);
    }

    drop(server);
    Ok(())
}

struct ServerGuard(std::process::Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}
