//! Persistent catalogs (§4.3, §4.4, §6.2): `LocalCatalog` on the client
//! (one device's view of its watched tree) and `ServerCatalog` on the server
//! (every device's view, keyed by `(username, mac, path)`).

mod local;
mod server;

pub use local::LocalCatalog;
pub use server::ServerCatalog;
