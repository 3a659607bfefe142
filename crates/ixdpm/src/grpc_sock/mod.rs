//! Unix socket plumbing for tonic.
//!
//! tonic has no built-in support for serving or dialing unix sockets, so
//! this module supplies the two small pieces the plugin needs: a listener
//! wrapped as a connection `Stream` for `serve_with_incoming`, and a
//! channel constructor that dials a socket path instead of a URI. Device
//! plugins only ever run on Linux nodes, so there is no non-unix variant.

pub mod client;
pub mod server;
