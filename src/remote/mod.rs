//! Remote Cache
//!
//! Lets calculation processes share one identifier authority and one shared
//! value store held by a cache server.
//!
//! ```text
//!  process A                         server                      process B
//! ┌────────────────────┐          ┌──────────────────┐          ┌────────────────────┐
//! │ RemoteCacheSource  │─ frames ►│ CacheServer      │◄ frames ─│ RemoteCacheSource  │
//! │  private: local    │          │  identifier map  │          │  private: local    │
//! │  shared:  remote   │          │  shared stores   │          │  shared:  remote   │
//! └────────────────────┘          └──────────────────┘          └────────────────────┘
//! ```

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{
    RemoteCacheClient, RemoteCacheSource, RemoteDataStore, RemoteIdentifierMap,
    RemoteStoreFactory,
};
pub use protocol::{CacheRequest, CacheResponse, Envelope};
pub use server::CacheServer;
pub use transport::{
    serve_connection, DirectConnection, FrameHandler, MessageConnection, TcpConnection,
    DEFAULT_REQUEST_TIMEOUT,
};
