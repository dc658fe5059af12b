//! Veil overlay core.
//! Peers run as state machines; traffic is sealed twice, per session and per group.

pub mod chunk;
pub mod client;
pub mod command;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod identity;
pub mod journal;
pub mod machine;
pub mod options;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod share;
pub mod transfer;
pub mod wire;

pub use client::{Client, ClientMachine};
pub use command::{ClientSession, Command, CommandError};
pub use crypto::{Group, SessionKey};
pub use dispatch::{Reply, Server, Service};
pub use identity::{Keypair, PublicKey};
pub use journal::{Exchange, Journal};
pub use machine::{Demon, Machine, MachineState, Status};
pub use options::Options;
pub use peer::{Endpoint, Peer, PeerEvent, PeerRegistry, RegistryError, Role};
pub use protocol::{
    Code, FileRef, Message, MessageKind, Packet, Request, Response, PROTOCOL_VERSION,
};
pub use relay::RelayService;
pub use share::ShareService;
pub use transfer::{TransferError, TransferJob, TransferQueue};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
