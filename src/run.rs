//! Command line argument parsing and server/client entry points.

use crate::address::{SocketAddress, DEFAULT_HOST, DEFAULT_PORT};
use crate::client_storage::ClientStorage;
use crate::ioutil;
use crate::server::{StorageServer, DEFAULT_GCBYTES};
use crate::shelf_storage::ShelfStorage;
use crate::storage::Storage;
use anyhow::Context;
use argh::FromArgs;

#[derive(FromArgs)]
/// durus: a persistent object-graph store with a storage server.
struct TopArgs {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Pack(PackArgs),
    Stop(StopArgs),
}

#[derive(FromArgs)]
/// Run a storage server.
#[argh(subcommand, name = "serve")]
struct ServeArgs {
    /// storage file; a new temporary file is used if not given
    #[argh(option)]
    file: Option<String>,

    /// host to listen on [default: 127.0.0.1]
    #[argh(option, default = "String::from(DEFAULT_HOST)")]
    host: String,

    /// port to listen on [default: 2972]
    #[argh(option, default = "DEFAULT_PORT")]
    port: u16,

    /// unix socket path, or @name for the Linux abstract namespace;
    /// overrides host and port
    #[argh(option)]
    address: Option<String>,

    /// truncate a malformed storage tail instead of failing the open
    #[argh(switch)]
    repair: bool,

    /// open the storage file read-only
    #[argh(switch)]
    readonly: bool,

    /// start a pack automatically after this many committed bytes
    /// [default: off]
    #[argh(option, default = "DEFAULT_GCBYTES")]
    gcbytes: u64,
}

#[derive(FromArgs)]
/// Ask a running server to pack its storage, or pack a storage file
/// directly.
#[argh(subcommand, name = "pack")]
struct PackArgs {
    /// pack this storage file in place instead of asking a server
    #[argh(option)]
    file: Option<String>,

    /// server host [default: 127.0.0.1]
    #[argh(option, default = "String::from(DEFAULT_HOST)")]
    host: String,

    /// server port [default: 2972]
    #[argh(option, default = "DEFAULT_PORT")]
    port: u16,

    /// unix socket path, or @name; overrides host and port
    #[argh(option)]
    address: Option<String>,
}

#[derive(FromArgs)]
/// Stop a running server gracefully.
#[argh(subcommand, name = "stop")]
struct StopArgs {
    /// server host [default: 127.0.0.1]
    #[argh(option, default = "String::from(DEFAULT_HOST)")]
    host: String,

    /// server port [default: 2972]
    #[argh(option, default = "DEFAULT_PORT")]
    port: u16,

    /// unix socket path, or @name; overrides host and port
    #[argh(option)]
    address: Option<String>,
}

fn pick_address(address: Option<String>, host: String, port: u16) -> SocketAddress {
    match address {
        Some(spec) => SocketAddress::parse_unix(&spec),
        None => SocketAddress::inet(host, port),
    }
}

fn serve(args: ServeArgs) -> anyhow::Result<i32> {
    if args.repair && args.readonly {
        anyhow::bail!("--repair needs write access; drop --readonly");
    }
    let storage: Box<dyn Storage> = match &args.file {
        Some(file) => Box::new(
            ShelfStorage::open(file, args.readonly, args.repair)
                .with_context(|| format!("opening storage {:?}", file))?,
        ),
        None => Box::new(ShelfStorage::temporary()?),
    };
    let address = pick_address(args.address, args.host, args.port);
    StorageServer::new(storage, address, args.gcbytes).serve()?;
    Ok(0)
}

fn pack(args: PackArgs) -> anyhow::Result<i32> {
    if let Some(file) = &args.file {
        let mut storage = ShelfStorage::open(file, false, false)
            .with_context(|| format!("opening storage {:?}", file))?;
        storage.pack()?;
        return Ok(0);
    }
    let address = pick_address(args.address, args.host, args.port);
    let mut client = ClientStorage::connect(address)?;
    client.pack()?;
    Ok(0)
}

fn stop(args: StopArgs) -> anyhow::Result<i32> {
    let address = pick_address(args.address, args.host, args.port);
    match address.connect()? {
        Some(mut sock) => {
            ioutil::write_u8(&mut sock, b'Q')?;
            Ok(0)
        }
        None => {
            eprintln!("no durus server seems to be running at {}", address);
            Ok(1)
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: TopArgs = argh::from_env();
    match args.command {
        Command::Serve(args) => serve(args),
        Command::Pack(args) => pack(args),
        Command::Stop(args) => stop(args),
    }
}
