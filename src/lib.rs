//! errlimits: probe what happens to RPC clients and servers when error
//! responses approach or exceed transport size limits.
//!
//! - `errrequest`: request tokens and deterministic error messages
//! - `protocol` / `status`: the line-framed wire format and status codes
//! - `server`: answers each call with an error of the requested size
//! - `client` / `channel`: single and multi-address clients
//! - `probe`: drivers that log what came back

pub mod channel;
pub mod client;
pub mod config;
pub mod errrequest;
pub mod probe;
pub mod protocol;
pub mod server;
pub mod status;
