//! # dctk-client
//!
//! A client for the Direct Connect peer-to-peer network.
//!
//! This crate provides:
//! - [`Client`], the orchestrator owning one hub session, the peer
//!   connections, the transfers and the local share
//! - Hub login, keep-alive, chat and search over NMDC or ADC
//! - The peer-connection handshake with direction election
//! - Download/upload scheduling with slot arbitration and TTH validation
//!
//! Events are delivered to the embedder as [`ClientEvent`]s over a channel;
//! the consumer may reentrantly call any public API.

mod client;
mod config;
mod download;
mod events;
mod hub;
mod peer;
mod peer_conn;
mod search;
mod transport;
mod upload;

pub use client::{Client, DownloadId};
pub use config::{ClientConfig, EncryptionMode, HubUrl};
pub use download::DownloadConf;
pub use events::{ClientEvent, DownloadResult, SearchResult};
pub use peer::Peer;

use thiserror::Error;

/// Client errors, grouped by the §7 kinds.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration, reported synchronously at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP/TLS/UDP failure; fails the owning connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire-level violation; fails the connection, never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A transfer went wrong; reported to the transfer.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The peer did not dial back within the allowed window.
    #[error("timed out")]
    PeerTimeout,

    /// Cooperative shutdown sentinel; never surfaced to the embedder.
    #[error("terminated")]
    Terminated,
}

impl ClientError {
    /// True for the shutdown sentinel.
    pub fn is_terminated(&self) -> bool {
        matches!(self, ClientError::Terminated)
    }
}

impl From<dctk_proto::ProtoError> for ClientError {
    fn from(e: dctk_proto::ProtoError) -> Self {
        match e {
            dctk_proto::ProtoError::Io(e) => ClientError::Transport(e.to_string()),
            dctk_proto::ProtoError::ConnectionClosed => {
                ClientError::Transport("connection closed".into())
            }
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

impl From<dctk_share::ShareError> for ClientError {
    fn from(e: dctk_share::ShareError) -> Self {
        match e {
            dctk_share::ShareError::BadPath(p) => {
                ClientError::Config(format!("share path is not a directory: {}", p.display()))
            }
            other => ClientError::Transfer(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
