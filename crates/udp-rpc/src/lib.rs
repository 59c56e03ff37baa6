//! Session-oriented request/response RPC over UDP.
//!
//! An [`Endpoint`] binds one UDP port and acts as both server and client.
//! Peers are tracked as sessions identified by random tokens; requests carry
//! a per-session sequence number and are answered by an acknowledgment that
//! echoes it.
//!
//! # Features
//!
//! - **Sessions**: Created on a peer's first message, evicted when idle
//! - **Promise**: Send a request and wait for its acknowledgment with a timeout
//! - **Tell**: Fire-and-forget messages
//! - **Routing**: Handlers registered per message identifier
//!
//! Delivery is not guaranteed. A request that is lost, or whose reply is
//! lost, surfaces as a timeout; nothing is retransmitted.
//!
//! # Example
//!
//! ```no_run
//! use proven_udp_rpc::{Endpoint, Message};
//!
//! async fn example() -> proven_udp_rpc::Result<()> {
//!     let server = Endpoint::builder().port(9000).bind().await?;
//!     server
//!         .router()
//!         .register("ping", |_: &Message| "pong".to_string());
//!     server.start()?;
//!
//!     let client = Endpoint::builder().bind().await?;
//!     client.start()?;
//!
//!     let (session, reply) = client
//!         .connect("127.0.0.1:9000".parse().unwrap(), "ping", "")
//!         .await?;
//!     assert_eq!(reply, "pong");
//!
//!     let reply = client.promise(&session, "ping", "").await?;
//!     assert_eq!(reply, "pong");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod reaper;
pub mod router;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{EndpointBuilder, EndpointConfig, MIN_SESSION_ID_LEN};
pub use endpoint::Endpoint;
pub use error::{CodecError, Error, Result};
pub use protocol::{ACK_IDENTIFIER, CONTROL_PREFIX, Message, NO_SEQUENCE, SessionId, codec};
pub use router::{Handler, Router};
pub use session::{SessionInfo, SessionTable};
pub use transport::DatagramSocket;

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
