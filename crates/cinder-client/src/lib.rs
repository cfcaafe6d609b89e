//! cinder-client: a pipelining RESP client engine.
//!
//! Many callers share a few physical connections. Each connection keeps a
//! strict FIFO of pending requests, so replies are matched purely by
//! order; push values (pub/sub messages) are diverted to a subscription
//! registry instead. Cluster redirects (`MOVED`, `ASK`) and transient
//! errors are retried transparently according to a [`RetryPolicy`].
//!
//! # quick start
//!
//! ```no_run
//! use cinder_client::{ClientConfig, Command, Multiplexer};
//!
//! # async fn run() -> Result<(), cinder_client::ClientError> {
//! let config = ClientConfig::new("127.0.0.1:6379".parse()?);
//! let client = Multiplexer::connect(config).await?;
//!
//! client.submit(Command::new(["SET", "greeting", "hello"])).await?;
//! let reply = client.submit(Command::new(["GET", "greeting"])).await?;
//! assert_eq!(reply.as_str(), Some("hello"));
//!
//! let mut news = client.subscribe("news").await?;
//! if let Some(msg) = news.next().await {
//!     println!("{:?}", msg.payload);
//! }
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod policy;
pub mod pubsub;
pub mod routing;
mod stats;
pub mod transport;

pub use cinder_protocol::Frame;
pub use config::{parse_duration, ClientConfig};
pub use error::ClientError;
pub use multiplexer::{Multiplexer, MultiplexerBuilder};
pub use policy::{Decision, Failure, RetransmitReason, RetryPolicy};
pub use pubsub::{Message, Subscription, SubscriptionKind};
pub use routing::{key_slot, Command, Endpoint, FirstKey, KeyExtractor, SlotTable, SLOT_COUNT};
pub use stats::StatsSnapshot;
pub use transport::{BoxTransport, ConnectFuture, Connector, TcpConnector};
