//! parley-gateway: sessions, group fan-out and the network surface
//!
//! Turns one user message into a stream of fragments (echo, growing reply,
//! tool-call phases), keeps per-thread history, multiplexes fragments to
//! broadcast groups, and serves all of it over HTTP and a WebSocket hub.

pub mod broadcast;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod threads;
pub mod wire;

pub use broadcast::{BroadcastConfig, BroadcastRegistry, Subscription};
pub use server::{ApiError, GatewayConfig, GatewayServer};
pub use stream::{FragmentStream, SessionConfig, SessionRequest, StreamSession};
pub use threads::{ThreadConfig, ThreadKeyError, ThreadStore};
