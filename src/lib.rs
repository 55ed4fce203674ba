//! A UDP datapath abstraction layer underlying a QUIC transport: one
//! readiness-driven worker thread per logical CPU, fixed-size pools of
//! receive blocks and send buffers, and the ancillary-data plumbing
//! (`IP_PKTINFO`/`IPV6_PKTINFO`) needed to support connection migration on
//! multi-homed hosts.
//!
//! The entry point is [`Datapath::init`]; everything else — resolving a
//! hostname, creating a [`Binding`], sending and receiving datagrams —
//! hangs off the handle it returns.

mod addr;
mod binding;
mod callback;
mod cmsg;
mod config;
mod datapath;
mod error;
mod pool;
mod recv;
mod rundown;
mod send;
mod socket;
mod worker;

pub use addr::{QuicAddr, Tuple};
pub use binding::Binding;
pub use callback::{ClientContext, ReceiveHandler, UnreachableHandler};
pub use config::DatapathConfig;
pub use datapath::Datapath;
pub use error::{Error, Result};
pub use recv::{return_recv_datagrams, PartitionIndex, ReceiveBlock, MAX_UDP_PAYLOAD_LENGTH};
pub use send::{SendBuffer, SendContext, MAX_SEND_BATCH_SIZE};
