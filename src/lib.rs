pub mod address;
pub mod client_storage;
pub mod connection;
pub mod error;
pub mod file;
pub mod intarray;
pub mod ioutil;
pub mod persistent;
pub mod pmap;
pub mod record;
pub mod run;
pub mod serialize;
pub mod server;
pub mod shelf;
pub mod shelf_storage;
pub mod storage;
