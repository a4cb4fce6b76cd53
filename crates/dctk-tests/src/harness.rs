//! Test harness: a minimal in-process NMDC hub and client launch helpers.
//!
//! The hub implements just enough of the protocol for real clients to log
//! in, see each other, chat, search and arrange peer connections: lock
//! challenge, userlist bookkeeping, and relaying of the hub-routed
//! messages.

use dctk_client::{Client, ClientConfig, ClientEvent, EncryptionMode};
use dctk_proto::conn::{split, DcWriter, Frame, ProtoKind};
use dctk_proto::nmdc::{NmdcMessage, NmdcMyInfo};
use dctk_proto::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-test port allocator; TCP and UDP share the number.
static NEXT_PORT: AtomicU16 = AtomicU16::new(23000);

pub fn alloc_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct HubUsers {
    senders: HashMap<String, mpsc::UnboundedSender<NmdcMessage>>,
    infos: HashMap<String, NmdcMyInfo>,
}

impl HubUsers {
    fn broadcast(&self, msg: &NmdcMessage) {
        for tx in self.senders.values() {
            let _ = tx.send(msg.clone());
        }
    }

    fn forward(&self, nick: &str, msg: NmdcMessage) {
        if let Some(tx) = self.senders.get(nick) {
            let _ = tx.send(msg);
        }
    }
}

/// A tiny NMDC hub bound to an ephemeral localhost port.
pub struct TestHub {
    pub port: u16,
    cancel: CancellationToken,
}

impl TestHub {
    pub async fn start() -> TestHub {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind hub");
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let users = Arc::new(Mutex::new(HubUsers::default()));

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let users = users.clone();
                        let cancel = accept_cancel.clone();
                        tokio::spawn(async move {
                            hub_connection(stream, users, cancel).await;
                        });
                    }
                }
            }
        });

        TestHub { port, cancel }
    }

    pub fn url(&self) -> String {
        format!("nmdc://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn hub_connection(
    stream: TcpStream,
    users: Arc<Mutex<HubUsers>>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = split(stream, ProtoKind::Nmdc);
    let (tx, mut rx) = mpsc::unbounded_channel::<NmdcMessage>();

    let _ = writer
        .write_message(&Message::Nmdc(NmdcMessage::Lock {
            lock: "EXTENDEDPROTOCOLABCABCABCABCABCABC".into(),
            pk: "testhub".into(),
            reference: None,
        }))
        .await;

    let mut nick: Option<String> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            queued = rx.recv() => {
                let Some(msg) = queued else { break };
                if write_hub_message(&mut writer, msg).await.is_err() {
                    break;
                }
            }
            frame = reader.read_frame() => {
                let msg = match frame {
                    Ok(Frame::Message(Message::Nmdc(msg))) => msg,
                    Ok(Frame::KeepAlive) => continue,
                    Ok(_) => continue,
                    Err(_) => break,
                };
                if handle_hub_message(&users, &tx, &mut nick, msg).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(nick) = nick {
        let mut u = users.lock();
        u.senders.remove(&nick);
        u.infos.remove(&nick);
        u.broadcast(&NmdcMessage::Quit { nick: nick.clone() });
        debug!(nick = %nick, "hub user left");
    }
}

async fn write_hub_message(
    writer: &mut DcWriter<WriteHalf<TcpStream>>,
    msg: NmdcMessage,
) -> Result<(), dctk_proto::ProtoError> {
    writer.write_message(&Message::Nmdc(msg)).await
}

fn handle_hub_message(
    users: &Arc<Mutex<HubUsers>>,
    tx: &mpsc::UnboundedSender<NmdcMessage>,
    nick: &mut Option<String>,
    msg: NmdcMessage,
) -> Result<(), ()> {
    match msg {
        NmdcMessage::Key { .. }
        | NmdcMessage::Supports { .. }
        | NmdcMessage::Version { .. }
        | NmdcMessage::KeepAlive => {}
        NmdcMessage::ValidateNick { nick: wanted } => {
            let mut u = users.lock();
            if u.senders.contains_key(&wanted) {
                return Err(());
            }
            u.senders.insert(wanted.clone(), tx.clone());
            let _ = tx.send(NmdcMessage::Hello {
                nick: wanted.clone(),
            });
            debug!(nick = %wanted, "hub user joined");
            *nick = Some(wanted);
        }
        NmdcMessage::GetNickList => {
            let u = users.lock();
            for info in u.infos.values() {
                let _ = tx.send(NmdcMessage::MyInfo(info.clone()));
            }
        }
        NmdcMessage::MyInfo(info) => {
            let mut u = users.lock();
            u.infos.insert(info.nick.clone(), info.clone());
            u.broadcast(&NmdcMessage::MyInfo(info));
        }
        NmdcMessage::ConnectToMe { ref target, .. } => {
            let target = target.clone();
            users.lock().forward(&target, msg);
        }
        NmdcMessage::RevConnectToMe { ref to, .. } => {
            let to = to.clone();
            users.lock().forward(&to, msg);
        }
        NmdcMessage::PrivateMessage { ref to, .. } => {
            let to = to.clone();
            users.lock().forward(&to, msg);
        }
        NmdcMessage::Search { .. } => {
            users.lock().broadcast(&msg);
        }
        NmdcMessage::SearchResult(mut res) => {
            if let Some(target) = res.target_nick.take() {
                users.lock().forward(&target, NmdcMessage::SearchResult(res));
            }
        }
        NmdcMessage::PublicMessage { .. } => {
            users.lock().broadcast(&msg);
        }
        _ => {}
    }
    Ok(())
}

/// Event stream wrapper with timeouts and predicates.
pub struct Events(mpsc::UnboundedReceiver<ClientEvent>);

impl Events {
    /// Wait until an event matching the predicate arrives, discarding
    /// everything else.
    pub async fn expect<F>(&mut self, what: &str, pred: F) -> ClientEvent
    where
        F: Fn(&ClientEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.0.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
                .unwrap_or_else(|| panic!("event stream closed waiting for {}", what));
            if pred(&event) {
                return event;
            }
        }
    }
}

/// Build a config wired to the given hub, with unique local ports.
pub fn test_config(nick: &str, hub_url: &str) -> ClientConfig {
    let port = alloc_port();
    ClientConfig {
        hub_url: hub_url.to_string(),
        nick: nick.to_string(),
        private_ip: true,
        tcp_port: port,
        udp_port: port,
        is_passive: false,
        peer_encryption_mode: EncryptionMode::DisableEncryption,
        hub_manual_connect: true,
        ..Default::default()
    }
}

/// Install a test subscriber once so `RUST_LOG` works under `cargo test`.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Launch a client: run it, optionally mount a share, then log into the
/// hub. Mirrors the embedder flow: Initialized → share → connect.
pub async fn launch(
    conf: ClientConfig,
    share: Option<&Path>,
) -> (Client, Events, JoinHandle<()>) {
    init_tracing();
    let (client, events) = Client::new(conf).expect("client config");
    let mut events = Events(events);

    let runner = {
        let client = client.clone();
        tokio::spawn(async move {
            client.run().await.expect("client run");
        })
    };

    events
        .expect("Initialized", |e| matches!(e, ClientEvent::Initialized))
        .await;

    if let Some(path) = share {
        client.share_add("share", path).await.expect("share_add");
        events
            .expect("ShareIndexed", |e| matches!(e, ClientEvent::ShareIndexed))
            .await;
    }

    client.hub_connect();
    events
        .expect("HubConnected", |e| matches!(e, ClientEvent::HubConnected))
        .await;

    (client, events, runner)
}

/// Tear a client down and wait for its tasks to join.
pub async fn shutdown(client: Client, runner: JoinHandle<()>) {
    client.terminate();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("client did not stop in time")
        .expect("client task panicked");
}
