//! The client orchestrator: one hub session, peer connections, transfers
//! and the local share, all owned through id-keyed tables behind one lock.

use crate::config::{ClientConfig, EncryptionMode, HubUrl};
use crate::download::{self, DownloadConf, DownloadEntry};
use crate::events::ClientEvent;
use crate::peer::Peer;
use crate::peer_conn::{self, ConnHandle};
use crate::transport::TlsIdentity;
use crate::{hub, search, ClientError, ClientResult};
use dctk_hash::TigerHash;
use dctk_proto::{Message, ProtoKind};
use dctk_share::{FileListFile, ShareTree};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tiger::{Digest, Tiger};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Stable id of a download, unique for the client's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadId(pub u64);

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dl-{}", self.0)
    }
}

/// Stable id of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Negotiated role of a peer connection, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// Handle used by any task to push messages onto the hub writer.
#[derive(Clone)]
pub(crate) struct HubHandle {
    pub tx: mpsc::UnboundedSender<Message>,
}

impl HubHandle {
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }
}

/// Everything mutable, guarded by the orchestrator lock. The lock is only
/// held across non-await sections.
pub(crate) struct State {
    pub peers: HashMap<String, Peer>,
    /// ADC SID → nick.
    pub sid_to_nick: HashMap<String, String>,
    pub share_mounts: Vec<(String, PathBuf)>,
    pub share: Arc<ShareTree>,
    /// Cached `files.xml.bz2`, regenerated once per indexing pass.
    pub file_list: Arc<Vec<u8>>,
    pub download_slot_avail: i64,
    pub upload_slot_avail: i64,
    /// Ordered by id, which is insertion order; wait queues are FIFO.
    pub downloads: BTreeMap<DownloadId, DownloadEntry>,
    pub active_download_by_peer: HashMap<String, DownloadId>,
    pub conns: HashMap<ConnId, ConnHandle>,
    pub conns_by_key: HashMap<(String, Direction), ConnId>,
    pub hub: Option<HubHandle>,
    pub hub_started: bool,
    pub hub_ready: bool,
    pub hub_name: Option<String>,
    /// Local address of the hub socket, advertised to peers.
    pub local_ip: Option<String>,
    /// Our ADC session id.
    pub my_sid: Option<String>,
    next_id: u64,
}

impl State {
    fn new(conf: &ClientConfig) -> Self {
        Self {
            peers: HashMap::new(),
            sid_to_nick: HashMap::new(),
            share_mounts: Vec::new(),
            share: Arc::new(ShareTree::empty()),
            file_list: Arc::new(Vec::new()),
            download_slot_avail: conf.download_slots as i64,
            upload_slot_avail: conf.upload_slots as i64,
            downloads: BTreeMap::new(),
            active_download_by_peer: HashMap::new(),
            conns: HashMap::new(),
            conns_by_key: HashMap::new(),
            hub: None,
            hub_started: false,
            hub_ready: false,
            hub_name: None,
            local_ip: None,
            my_sid: None,
            next_id: 0,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(conf: &ClientConfig) -> Self {
        Self::new(conf)
    }
}

/// Shared core behind every task.
pub(crate) struct Inner {
    pub conf: ClientConfig,
    pub url: HubUrl,
    pub state: Mutex<State>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    /// ADC private id; the client id is its Tiger digest.
    pub pid: [u8; 24],
    pub cid: TigerHash,
    pub tls: Option<TlsIdentity>,
    pub rng: Mutex<StdRng>,
    pub udp: Mutex<Option<Arc<UdpSocket>>>,
}

impl Inner {
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn proto_kind(&self) -> ProtoKind {
        if self.url.adc {
            ProtoKind::Adc
        } else {
            ProtoKind::Nmdc
        }
    }

    /// Direction-election bet, in [1, 0x7FFF]; zero is unreachable.
    pub fn random_bet(&self) -> u32 {
        self.rng.lock().gen_range(1..=0x7FFF)
    }

    /// Fresh 16-character base-32 token for ADC connect-to-me matching.
    pub fn random_token(&self) -> String {
        let mut raw = [0u8; 10];
        self.rng.lock().fill(&mut raw);
        dctk_hash::base32_encode(&raw)
    }

    /// Generator string for the file list.
    pub fn generator(&self) -> String {
        format!("{} {}", self.conf.client_string, env!("CARGO_PKG_VERSION"))
    }
}

/// A Direct Connect client. Cheap to clone; all clones drive the same
/// session.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl Client {
    /// Validate the configuration and build a client plus its event
    /// stream. Nothing touches the network yet; call [`Client::run`].
    pub fn new(
        conf: ClientConfig,
    ) -> ClientResult<(Client, mpsc::UnboundedReceiver<ClientEvent>)> {
        let url = conf.validate()?;

        let tls = if url.secure || conf.peer_encryption_mode != EncryptionMode::DisableEncryption
        {
            Some(TlsIdentity::generate()?)
        } else {
            None
        };

        let mut rng = StdRng::from_entropy();
        let mut pid = [0u8; 24];
        rng.fill(&mut pid);
        let cid = TigerHash(Tiger::digest(pid).into());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = State::new(&conf);
        let inner = Arc::new(Inner {
            conf,
            url,
            state: Mutex::new(state),
            events: events_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pid,
            cid,
            tls,
            rng: Mutex::new(rng),
            udp: Mutex::new(None),
        });
        Ok((Client { inner }, events_rx))
    }

    /// Bind listeners, start the hub session (unless manual connect) and
    /// block until [`Client::terminate`]. All spawned tasks are joined
    /// before returning.
    pub async fn run(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let conf = &inner.conf;

        if !conf.is_passive {
            let listener = TcpListener::bind(("0.0.0.0", conf.tcp_port))
                .await
                .map_err(|e| {
                    ClientError::Config(format!("cannot bind tcp port {}: {}", conf.tcp_port, e))
                })?;
            info!(port = conf.tcp_port, "peer listener bound");
            spawn_accept_loop(inner.clone(), listener, false);

            if conf.tcp_tls_port != 0 && inner.tls.is_some() {
                let listener = TcpListener::bind(("0.0.0.0", conf.tcp_tls_port))
                    .await
                    .map_err(|e| {
                        ClientError::Config(format!(
                            "cannot bind tls port {}: {}",
                            conf.tcp_tls_port, e
                        ))
                    })?;
                info!(port = conf.tcp_tls_port, "encrypted peer listener bound");
                spawn_accept_loop(inner.clone(), listener, true);
            }

            let udp = UdpSocket::bind(("0.0.0.0", conf.udp_port))
                .await
                .map_err(|e| {
                    ClientError::Config(format!("cannot bind udp port {}: {}", conf.udp_port, e))
                })?;
            let udp = Arc::new(udp);
            *inner.udp.lock() = Some(udp.clone());
            let udp_inner = inner.clone();
            inner
                .tracker
                .spawn(async move { search::run_udp_listener(udp_inner, udp).await });
        }

        inner.emit(ClientEvent::Initialized);

        if !conf.hub_manual_connect {
            self.hub_connect();
        }

        inner.cancel.cancelled().await;
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("client stopped");
        Ok(())
    }

    /// Start the hub session; needed only with `hub_manual_connect`.
    /// Safe to call more than once.
    pub fn hub_connect(&self) {
        let mut st = self.inner.state.lock();
        if st.hub_started {
            return;
        }
        st.hub_started = true;
        drop(st);
        let inner = self.inner.clone();
        self.inner
            .tracker
            .spawn(async move { hub::run_hub(inner).await });
    }

    /// Begin a graceful shutdown. Idempotent; `run` returns once every
    /// task has joined.
    pub fn terminate(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("terminate requested");
            self.inner.cancel.cancel();
        }
    }

    /// Mount a directory into the share and reindex.
    pub async fn share_add(&self, alias: &str, path: impl Into<PathBuf>) -> ClientResult<()> {
        let path = path.into();
        {
            let mut st = self.inner.state.lock();
            if st.share_mounts.iter().any(|(a, _)| a == alias) {
                return Err(ClientError::Config(format!(
                    "share alias already mounted: {}",
                    alias
                )));
            }
            st.share_mounts.push((alias.to_string(), path));
        }
        self.reindex().await
    }

    /// Unmount a share alias and reindex.
    pub async fn share_del(&self, alias: &str) -> ClientResult<()> {
        {
            let mut st = self.inner.state.lock();
            let before = st.share_mounts.len();
            st.share_mounts.retain(|(a, _)| a != alias);
            if st.share_mounts.len() == before {
                return Err(ClientError::Config(format!("no such share alias: {}", alias)));
            }
        }
        self.reindex().await
    }

    /// Rescan every mount, rebuild the file list and swap both in
    /// atomically. Hashing runs on the blocking pool.
    pub async fn reindex(&self) -> ClientResult<()> {
        let mounts = self.inner.state.lock().share_mounts.clone();
        let generator = self.inner.generator();
        let cid = self.inner.cid.to_string();

        let built = tokio::task::spawn_blocking(move || {
            let tree = ShareTree::index(&mounts)?;
            let list = dctk_share::generate_file_list(&tree, &generator, &cid)?;
            Ok::<_, dctk_share::ShareError>((tree, list))
        })
        .await
        .map_err(|e| ClientError::Transfer(format!("index worker failed: {}", e)))??;

        let (tree, list) = built;
        debug!(files = tree.file_count(), "share reindexed");
        {
            let mut st = self.inner.state.lock();
            st.share = Arc::new(tree);
            st.file_list = Arc::new(list);
            if st.hub_ready {
                hub::advertise(&self.inner, &mut st);
            }
        }
        self.inner.emit(ClientEvent::ShareIndexed);
        Ok(())
    }

    /// Send a line of public hub chat.
    pub fn public_message(&self, content: &str) -> ClientResult<()> {
        let st = self.inner.state.lock();
        hub::send_public_message(&self.inner, &st, content)
    }

    /// Send a private message to a peer.
    pub fn private_message(&self, peer_nick: &str, content: &str) -> ClientResult<()> {
        let st = self.inner.state.lock();
        hub::send_private_message(&self.inner, &st, peer_nick, content)
    }

    /// Search the hub for content by exact TTH.
    pub fn search_tth(&self, tth: TigerHash) -> ClientResult<()> {
        let st = self.inner.state.lock();
        search::send_search(&self.inner, &st, Some(tth), None)
    }

    /// Search the hub for content by name.
    pub fn search_name(&self, pattern: &str) -> ClientResult<()> {
        let st = self.inner.state.lock();
        search::send_search(&self.inner, &st, None, Some(pattern.to_string()))
    }

    /// Start downloading content by TTH. Returns immediately; completion
    /// arrives as a `DownloadSuccessful` or `DownloadError` event.
    pub fn download_file(&self, conf: DownloadConf) -> ClientResult<DownloadId> {
        download::start_download(&self.inner, conf)
    }

    /// Start downloading a peer's file list.
    pub fn download_file_list(
        &self,
        peer_nick: &str,
        save_path: Option<PathBuf>,
    ) -> ClientResult<DownloadId> {
        download::start_download(&self.inner, DownloadConf::file_list(peer_nick, save_path))
    }

    /// Start downloading a file picked from a parsed file list.
    pub fn download_fl_file(
        &self,
        peer_nick: &str,
        file: &FileListFile,
        save_path: Option<PathBuf>,
    ) -> ClientResult<DownloadId> {
        let mut conf = DownloadConf::new(peer_nick, file.tth);
        conf.save_path = save_path;
        download::start_download(&self.inner, conf)
    }

    /// Stop a download. No terminal event is delivered for it.
    pub fn download_close(&self, id: DownloadId) {
        download::close_download(&self.inner, id);
    }

    /// Number of remaining downloads, queued or active.
    pub fn download_count(&self) -> usize {
        self.inner.state.lock().downloads.len()
    }

    /// Snapshot of the hub userlist.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.state.lock().peers.values().cloned().collect()
    }

    /// Look up one peer by nick.
    pub fn peer(&self, nick: &str) -> Option<Peer> {
        self.inner.state.lock().peers.get(nick).cloned()
    }
}

fn spawn_accept_loop(inner: Arc<Inner>, listener: TcpListener, encrypted: bool) {
    let tracker = inner.tracker.clone();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, encrypted, "incoming peer connection");
                        peer_conn::spawn_inbound(&inner, stream, encrypted);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf() -> ClientConfig {
        ClientConfig {
            nick: "tester".into(),
            is_passive: true,
            hub_manual_connect: true,
            peer_encryption_mode: EncryptionMode::DisableEncryption,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates_config() {
        let mut conf = test_conf();
        conf.nick = String::new();
        assert!(matches!(Client::new(conf), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_bet_range() {
        let (client, _events) = Client::new(test_conf()).unwrap();
        for _ in 0..1000 {
            let bet = client.inner.random_bet();
            assert!((1..=0x7FFF).contains(&bet));
        }
    }

    #[test]
    fn test_token_shape() {
        let (client, _events) = Client::new(test_conf()).unwrap();
        let token = client.inner.random_token();
        assert_eq!(token.len(), 16);
        assert_ne!(token, client.inner.random_token());
    }

    #[tokio::test]
    async fn test_run_emits_initialized_and_joins_on_terminate() {
        let (client, mut events) = Client::new(test_conf()).unwrap();
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };

        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Initialized)
        ));

        client.terminate();
        client.terminate(); // idempotent
        tokio::time::timeout(std::time::Duration::from_secs(1), runner)
            .await
            .expect("run did not join in time")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_cid_is_tiger_of_pid() {
        let (client, _events) = Client::new(test_conf()).unwrap();
        let expected = TigerHash(Tiger::digest(client.inner.pid).into());
        assert_eq!(client.inner.cid, expected);
    }
}
