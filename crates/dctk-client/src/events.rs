//! Events delivered to the embedder.

use crate::client::DownloadId;
use crate::peer::Peer;
use dctk_hash::TigerHash;
use std::path::PathBuf;

/// A search hit, from either dialect.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Nick of the peer holding the content.
    pub peer_nick: String,
    /// Logical path inside the peer's share.
    pub path: String,
    /// `None` for directory results.
    pub size: Option<u64>,
    /// Content address, when the peer reported one.
    pub tth: Option<TigerHash>,
    /// Free upload slots the peer advertises.
    pub slot_avail: u32,
}

/// A finished download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub id: DownloadId,
    pub peer_nick: String,
    /// Content bytes when no save path was configured.
    pub content: Option<Vec<u8>>,
    /// Final on-disk path when one was configured.
    pub save_path: Option<PathBuf>,
    /// Bytes received.
    pub size: u64,
}

/// Everything the client reports back to its embedder.
///
/// The consumer runs outside the orchestrator lock and may reentrantly
/// call any public API.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Listeners are bound; the client is ready for share and hub calls.
    Initialized,
    /// An indexing pass finished and the file list was regenerated.
    ShareIndexed,
    /// Hub login completed.
    HubConnected,
    PeerConnected(Peer),
    PeerUpdated(Peer),
    PeerDisconnected(Peer),
    PublicMessage {
        peer_nick: String,
        content: String,
    },
    PrivateMessage {
        peer_nick: String,
        content: String,
    },
    SearchResult(SearchResult),
    DownloadSuccessful(DownloadResult),
    DownloadError {
        id: DownloadId,
        peer_nick: String,
        error: String,
    },
}
