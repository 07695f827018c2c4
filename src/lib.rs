//! RPC gateway fronting a blockchain node cluster.
//!
//! The gateway terminates client connections, serves a JSON-RPC
//! request/response API over HTTP and a framed WebSocket channel,
//! multiplexes long-lived event subscriptions over that channel, and relays
//! topic-routed application messages (AMOP) between clients and peer nodes.
//!
//! The host process embeds [`service::RpcService`], supplies the upstream
//! collaborators ([`group::NodeServiceFactory`] and [`amop::PeerGateway`])
//! and feeds it block, group and peer notifications; [`api::serve`] runs the
//! client-facing server.

pub mod amop;
pub mod api;
pub mod configuration;
pub mod event;
pub mod group;
pub mod jsonrpc;
pub mod message;
pub mod router;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod topic;
pub mod types;
pub mod utils;
