//! Real-time chat synchronization over a single duplex socket.
//!
//! A [`ChatClient`] keeps one connection to the chat server, joins at most one
//! channel at a time, sends messages optimistically, reconciles server echoes
//! against the local timeline, and fetches each channel's history once per
//! session (over the socket, falling back to HTTP).
//!
//! ```no_run
//! use gtalk_sync::{ChatClient, ClientConfig, Credential, Sender};
//!
//! # async fn demo() -> gtalk_sync::Result<()> {
//! let client = ChatClient::start(ClientConfig::default())?;
//! client.connect(Credential::new("session-token"));
//! client.select_channel(Some("c1".into()));
//! let timeline = client.load_history("c1".into()).await?;
//! println!("{} messages", timeline.len());
//! client
//!     .send_message("c1".into(), Sender::new("7", "amy"), "hello", Vec::new())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod protocol;
pub mod store;
pub mod subscription;
pub mod transport;

pub use client::{AddKind, ChatClient, SyncEvent};
pub use config::ClientConfig;
pub use error::{Result, SyncError};
pub use protocol::{ChannelId, InboundFrame, Message, MessageId, Provenance, Sender, UserId};
pub use store::Timeline;
pub use transport::{ConnectionState, Connector, Credential};
