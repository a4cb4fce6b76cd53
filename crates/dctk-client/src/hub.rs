//! The hub session: login, keep-alive, userlist sync, chat and search
//! routing, and connect-to-me orchestration.

use crate::client::{HubHandle, Inner, State};
use crate::events::ClientEvent;
use crate::peer::Peer;
use crate::peer_conn;
use crate::transport::{self, BoxStream, DIAL_TIMEOUT};
use crate::{search, ClientError, ClientResult};
use dctk_proto::adc::{self, AdcBody, AdcMessage, AdcRoute};
use dctk_proto::conn::{split, DcWriter, Frame};
use dctk_proto::nmdc::{nmdc_key, NmdcMessage, NmdcMyInfo};
use dctk_proto::Message;
use std::sync::Arc;
use std::time::Duration;
use tiger::{Digest, Tiger};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Hub-level NMDC extensions we announce.
const NMDC_HUB_FEATURES: &[&str] = &[
    "UserCommand",
    "NoGetINFO",
    "NoHello",
    "UserIP2",
    "TTHSearch",
];

/// NMDC client version advertised to hubs.
const NMDC_VERSION: &str = "1,0091";

/// Delay between hub redial attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Plain and TLS ADC transfer protocol names, as used in `CTM`/`RCM`.
const ADC_PROTO_PLAIN: &str = "ADC/1.0";
const ADC_PROTO_TLS: &str = "ADCS/0.10";

/// Supervisor: run hub sessions with bounded reconnects. Losing the hub
/// for good terminates the client.
pub(crate) async fn run_hub(inner: Arc<Inner>) {
    let mut attempts = 0u32;
    loop {
        match hub_session(&inner).await {
            Ok(()) => break,
            Err(e) if e.is_terminated() => break,
            Err(e) => {
                attempts += 1;
                error!(error = %e, attempt = attempts, "hub session failed");
                {
                    let mut st = inner.state.lock();
                    st.hub = None;
                    st.hub_ready = false;
                    st.my_sid = None;
                    st.peers.clear();
                    st.sid_to_nick.clear();
                }
                if attempts > inner.conf.hub_reconnect_tries {
                    error!("giving up on hub, terminating client");
                    inner.cancel.cancel();
                    break;
                }
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

struct Session {
    ready: bool,
}

async fn hub_session(inner: &Arc<Inner>) -> ClientResult<()> {
    let url = inner.url.clone();
    let stream = transport::dial(&url.host, url.port, DIAL_TIMEOUT).await?;
    let local_ip = stream.local_addr().ok().map(|a| a.ip().to_string());

    let stream: BoxStream = if url.secure {
        let identity = inner
            .tls
            .as_ref()
            .ok_or_else(|| ClientError::Config("secure hub url without tls identity".into()))?;
        identity.connect(stream, &url.host).await?.0
    } else {
        Box::new(stream)
    };
    info!(hub = %url.addr(), adc = url.adc, secure = url.secure, "hub dialed");

    let (mut reader, mut writer) = split(stream, inner.proto_kind());
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut st = inner.state.lock();
        st.hub = Some(HubHandle { tx });
        st.local_ip = local_ip;
    }

    // ADC clients speak first; NMDC waits for the hub's $Lock.
    if url.adc {
        writer
            .write_message(&Message::Adc(AdcMessage::new(
                AdcRoute::Hub,
                AdcBody::Sup {
                    add: vec![adc::FEATURE_BASE.to_string(), adc::FEATURE_TIGR.to_string()],
                    remove: vec![],
                },
            )))
            .await?;
    }

    let keepalive = Duration::from_secs(inner.conf.hub_keepalive_secs);
    let recv_timeout = keepalive * 5;
    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await; // the immediate first tick

    enum Step {
        Command(Option<Message>),
        Tick,
        Frame(Frame),
    }

    let mut session = Session { ready: false };
    let mut last_rx = tokio::time::Instant::now();
    loop {
        let step = tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            cmd = rx.recv() => Step::Command(cmd),
            _ = ticker.tick() => Step::Tick,
            _ = tokio::time::sleep_until(last_rx + recv_timeout) => {
                return Err(ClientError::Transport("hub receive timeout".into()))
            }
            frame = reader.read_frame() => Step::Frame(frame?),
        };
        match step {
            Step::Command(Some(msg)) => writer.write_message(&msg).await?,
            Step::Command(None) => return Err(ClientError::Terminated),
            Step::Tick => writer.write_keepalive().await?,
            Step::Frame(frame) => {
                last_rx = tokio::time::Instant::now();
                match frame {
                    Frame::KeepAlive => {}
                    Frame::Binary(_) => {
                        return Err(ClientError::Protocol("binary data from hub".into()))
                    }
                    Frame::Message(msg) => {
                        dispatch(inner, &mut session, &mut writer, msg).await?
                    }
                }
            }
        }
    }
}

async fn dispatch<W>(
    inner: &Arc<Inner>,
    session: &mut Session,
    writer: &mut DcWriter<W>,
    msg: Message,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        Message::Nmdc(m) => dispatch_nmdc(inner, session, writer, m).await,
        Message::Adc(m) => dispatch_adc(inner, session, writer, m).await,
    }
}

async fn dispatch_nmdc<W>(
    inner: &Arc<Inner>,
    session: &mut Session,
    writer: &mut DcWriter<W>,
    msg: NmdcMessage,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        NmdcMessage::Lock { lock, .. } => {
            writer
                .write_message(&Message::Nmdc(NmdcMessage::Key {
                    key: nmdc_key(lock.as_bytes()),
                }))
                .await?;
            writer
                .write_message(&Message::Nmdc(NmdcMessage::Supports {
                    features: NMDC_HUB_FEATURES.iter().map(|s| s.to_string()).collect(),
                }))
                .await?;
            writer
                .write_message(&Message::Nmdc(NmdcMessage::ValidateNick {
                    nick: inner.conf.nick.clone(),
                }))
                .await?;
        }
        NmdcMessage::GetPass => {
            writer
                .write_message(&Message::Nmdc(NmdcMessage::MyPass {
                    password: inner.conf.password.clone(),
                }))
                .await?;
        }
        NmdcMessage::BadPass => return Err(ClientError::Protocol("bad hub password".into())),
        NmdcMessage::ValidateDenide => {
            return Err(ClientError::Protocol("hub refused our nick".into()))
        }
        NmdcMessage::Hello { nick } => {
            if nick == inner.conf.nick && !session.ready {
                writer
                    .write_message(&Message::Nmdc(NmdcMessage::Version {
                        version: NMDC_VERSION.to_string(),
                    }))
                    .await?;
                writer
                    .write_message(&Message::Nmdc(NmdcMessage::GetNickList))
                    .await?;
                let my_info = {
                    let st = inner.state.lock();
                    my_info_message(inner, &st)
                };
                writer.write_message(&my_info).await?;
                session.ready = true;
                inner.state.lock().hub_ready = true;
                info!("hub login complete");
                inner.emit(ClientEvent::HubConnected);
            }
        }
        NmdcMessage::HubName { name } => {
            inner.state.lock().hub_name = Some(name);
        }
        NmdcMessage::MyInfo(info) => {
            if info.nick != inner.conf.nick {
                let mut st = inner.state.lock();
                upsert_nmdc_peer(inner, &mut st, &info);
            }
        }
        NmdcMessage::OpList { nicks } => {
            let mut st = inner.state.lock();
            for nick in nicks {
                if let Some(peer) = st.peers.get_mut(&nick) {
                    peer.is_operator = true;
                }
            }
        }
        NmdcMessage::BotList { nicks } => {
            let mut st = inner.state.lock();
            for nick in nicks {
                if let Some(peer) = st.peers.get_mut(&nick) {
                    peer.is_bot = true;
                }
            }
        }
        NmdcMessage::Quit { nick } => {
            let removed = inner.state.lock().peers.remove(&nick);
            if let Some(peer) = removed {
                inner.emit(ClientEvent::PeerDisconnected(peer));
            }
        }
        NmdcMessage::PublicMessage { from, content } => {
            inner.emit(ClientEvent::PublicMessage {
                peer_nick: from,
                content,
            });
        }
        NmdcMessage::PrivateMessage { from, content, .. } => {
            inner.emit(ClientEvent::PrivateMessage {
                peer_nick: from,
                content,
            });
        }
        NmdcMessage::ConnectToMe {
            target,
            ip,
            port,
            secure,
        } => {
            if target != inner.conf.nick {
                debug!(target = %target, "connect-to-me for someone else, ignoring");
            } else if secure && inner.tls.is_none() {
                warn!("secure connect-to-me but encryption is disabled");
            } else {
                peer_conn::spawn_outbound(inner, ip, port, secure, None);
            }
        }
        NmdcMessage::RevConnectToMe { from, .. } => {
            let st = inner.state.lock();
            if inner.conf.is_passive {
                debug!(from = %from, "revconnect while passive, cannot serve");
            } else {
                match choose_peer_port(inner) {
                    Ok((port, secure)) => {
                        let ip = st.local_ip.clone().unwrap_or_default();
                        if let Some(hub) = &st.hub {
                            hub.send(Message::Nmdc(NmdcMessage::ConnectToMe {
                                target: from.clone(),
                                ip,
                                port,
                                secure,
                            }));
                        }
                    }
                    Err(e) => warn!(from = %from, error = %e, "cannot serve revconnect"),
                }
            }
        }
        NmdcMessage::Search { origin, query } => {
            search::respond_nmdc(inner, &origin, &query);
        }
        NmdcMessage::SearchResult(res) => {
            search::handle_nmdc_result(inner, res);
        }
        NmdcMessage::KeepAlive | NmdcMessage::UserCommand { .. } => {}
        NmdcMessage::Unhandled { command, .. } => {
            debug!(command = %command, "unhandled hub message ignored");
        }
        other => {
            debug!(?other, "unexpected hub message ignored");
        }
    }
    Ok(())
}

async fn dispatch_adc<W>(
    inner: &Arc<Inner>,
    session: &mut Session,
    writer: &mut DcWriter<W>,
    msg: AdcMessage,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    let AdcMessage { route, body } = msg;
    match body {
        AdcBody::Sup { .. } => {}
        AdcBody::Sid { sid } => {
            debug!(sid = %sid, "session id assigned");
            inner.state.lock().my_sid = Some(sid);
            let binf = {
                let st = inner.state.lock();
                adc_info_message(inner, &st, true)
            };
            if let Some(binf) = binf {
                writer.write_message(&binf).await?;
            }
        }
        AdcBody::Inf { fields } => match route {
            AdcRoute::Info => {
                if let Some((_, name)) = fields.iter().find(|(k, _)| k == "NI") {
                    inner.state.lock().hub_name = Some(name.clone());
                }
            }
            AdcRoute::Broadcast { sid } => {
                let is_me = inner.state.lock().my_sid.as_deref() == Some(sid.as_str());
                if is_me {
                    if !session.ready {
                        session.ready = true;
                        inner.state.lock().hub_ready = true;
                        info!("hub login complete");
                        inner.emit(ClientEvent::HubConnected);
                    }
                } else {
                    let mut st = inner.state.lock();
                    upsert_adc_peer(inner, &mut st, &sid, &fields);
                }
            }
            _ => {}
        },
        AdcBody::Gpa { data } => {
            let mut hasher = Tiger::new();
            hasher.update(inner.conf.password.as_bytes());
            hasher.update(&data);
            let hash: [u8; 24] = hasher.finalize().into();
            writer
                .write_message(&Message::Adc(AdcMessage::new(
                    AdcRoute::Hub,
                    AdcBody::Pas {
                        hash: hash.to_vec(),
                    },
                )))
                .await?;
        }
        AdcBody::Sta(sta) => {
            if sta.severity == adc::SEV_FATAL {
                return Err(ClientError::Protocol(format!(
                    "hub error ({}): {}",
                    sta.code, sta.message
                )));
            }
            debug!(code = sta.code, message = %sta.message, "hub status");
        }
        AdcBody::Msg { text, pm } => {
            let nick = match &route {
                AdcRoute::Broadcast { sid } => sid_nick(inner, sid),
                AdcRoute::Direct { from, .. } | AdcRoute::Echo { from, .. } => {
                    sid_nick(inner, from)
                }
                _ => None,
            };
            let Some(nick) = nick else { return Ok(()) };
            if nick == inner.conf.nick {
                return Ok(());
            }
            if pm.is_some() {
                inner.emit(ClientEvent::PrivateMessage {
                    peer_nick: nick,
                    content: text,
                });
            } else {
                inner.emit(ClientEvent::PublicMessage {
                    peer_nick: nick,
                    content: text,
                });
            }
        }
        AdcBody::Qui { sid } => {
            let removed = {
                let mut st = inner.state.lock();
                if st.my_sid.as_deref() == Some(sid.as_str()) {
                    return Err(ClientError::Protocol("hub disconnected us".into()));
                }
                let nick = st.sid_to_nick.remove(&sid);
                nick.and_then(|nick| st.peers.remove(&nick))
            };
            if let Some(peer) = removed {
                inner.emit(ClientEvent::PeerDisconnected(peer));
            }
        }
        AdcBody::Sch(terms) => {
            let from = match &route {
                AdcRoute::Broadcast { sid } => Some(sid.clone()),
                AdcRoute::Feature { sid, .. } => Some(sid.clone()),
                AdcRoute::Direct { from, .. } => Some(from.clone()),
                _ => None,
            };
            if let Some(sid) = from {
                search::respond_adc(inner, &sid, &terms);
            }
        }
        AdcBody::Res(res) => {
            let nick = match &route {
                AdcRoute::Direct { from, .. } => sid_nick(inner, from),
                _ => None,
            };
            if let Some(nick) = nick {
                search::handle_adc_result(inner, &nick, res);
            }
        }
        AdcBody::Ctm {
            protocol,
            port,
            token,
        } => {
            let AdcRoute::Direct { from, .. } = route else {
                return Ok(());
            };
            let secure = match protocol.as_str() {
                ADC_PROTO_PLAIN => false,
                ADC_PROTO_TLS => true,
                other => {
                    warn!(protocol = other, "connect-to-me with unknown protocol");
                    return Ok(());
                }
            };
            if secure && inner.tls.is_none() {
                warn!("secure connect-to-me but encryption is disabled");
                return Ok(());
            }
            let ip = {
                let st = inner.state.lock();
                st.sid_to_nick
                    .get(&from)
                    .and_then(|nick| st.peers.get(nick))
                    .and_then(|peer| peer.ip.clone())
            };
            match ip {
                Some(ip) => peer_conn::spawn_outbound(inner, ip, port, secure, Some(token)),
                None => warn!(sid = %from, "connect-to-me from peer without address"),
            }
        }
        AdcBody::Rcm { token, .. } => {
            let AdcRoute::Direct { from, .. } = route else {
                return Ok(());
            };
            if inner.conf.is_passive {
                debug!(sid = %from, "revconnect while passive, cannot serve");
                return Ok(());
            }
            let (port, secure) = match choose_peer_port(inner) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(sid = %from, error = %e, "cannot serve revconnect");
                    return Ok(());
                }
            };
            let protocol = if secure { ADC_PROTO_TLS } else { ADC_PROTO_PLAIN };
            let my_sid = inner.state.lock().my_sid.clone();
            if let Some(my_sid) = my_sid {
                writer
                    .write_message(&Message::Adc(AdcMessage::new(
                        AdcRoute::Direct {
                            from: my_sid,
                            to: from,
                        },
                        AdcBody::Ctm {
                            protocol: protocol.to_string(),
                            port,
                            token,
                        },
                    )))
                    .await?;
            }
        }
        AdcBody::GetFile { .. } | AdcBody::SendFile { .. } => {
            return Err(ClientError::Protocol("transfer command on hub link".into()))
        }
        AdcBody::Unhandled { cmd, .. } => {
            debug!(cmd = %cmd, "unhandled hub message ignored");
        }
        AdcBody::Pas { .. } => {}
    }
    Ok(())
}

fn sid_nick(inner: &Arc<Inner>, sid: &str) -> Option<String> {
    inner.state.lock().sid_to_nick.get(sid).cloned()
}

fn upsert_nmdc_peer(inner: &Arc<Inner>, st: &mut State, info: &NmdcMyInfo) {
    match st.peers.get_mut(&info.nick) {
        Some(peer) => {
            peer.apply_my_info(info);
            let peer = peer.clone();
            inner.emit(ClientEvent::PeerUpdated(peer));
        }
        None => {
            let mut peer = Peer::default();
            peer.apply_my_info(info);
            st.peers.insert(info.nick.clone(), peer.clone());
            debug!(nick = %info.nick, "peer joined");
            inner.emit(ClientEvent::PeerConnected(peer));
        }
    }
}

fn upsert_adc_peer(inner: &Arc<Inner>, st: &mut State, sid: &str, fields: &[(String, String)]) {
    if let Some(nick) = st.sid_to_nick.get(sid).cloned() {
        if let Some(peer) = st.peers.get_mut(&nick) {
            peer.apply_adc_fields(fields);
            let peer = peer.clone();
            inner.emit(ClientEvent::PeerUpdated(peer));
        }
        return;
    }
    let mut peer = Peer {
        sid: Some(sid.to_string()),
        ..Default::default()
    };
    peer.apply_adc_fields(fields);
    if peer.nick.is_empty() {
        warn!(sid, "peer info without a nick, ignoring");
        return;
    }
    st.sid_to_nick.insert(sid.to_string(), peer.nick.clone());
    st.peers.insert(peer.nick.clone(), peer.clone());
    debug!(nick = %peer.nick, sid, "peer joined");
    inner.emit(ClientEvent::PeerConnected(peer));
}

/// Which port (and whether TLS) we offer peers that dial us.
fn choose_peer_port(inner: &Arc<Inner>) -> ClientResult<(u16, bool)> {
    let tls_ready = inner.tls.is_some() && inner.conf.tcp_tls_port != 0;
    match inner.conf.peer_encryption_mode {
        crate::EncryptionMode::DisableEncryption => Ok((inner.conf.tcp_port, false)),
        crate::EncryptionMode::PreferEncryption => {
            if tls_ready {
                Ok((inner.conf.tcp_tls_port, true))
            } else {
                Ok((inner.conf.tcp_port, false))
            }
        }
        crate::EncryptionMode::ForceEncryption => {
            if tls_ready {
                Ok((inner.conf.tcp_tls_port, true))
            } else {
                Err(ClientError::Config(
                    "forced encryption needs a tls listen port".into(),
                ))
            }
        }
    }
}

/// Ask the hub to get us a peer link: connect-to-me when we are
/// reachable, reverse connect-to-me when only the peer is.
pub(crate) fn request_peer_connection(
    inner: &Arc<Inner>,
    st: &mut State,
    nick: &str,
    token: Option<String>,
) -> ClientResult<()> {
    let peer = st
        .peers
        .get(nick)
        .ok_or_else(|| ClientError::Transfer(format!("peer not on hub: {}", nick)))?
        .clone();
    let hub = st
        .hub
        .clone()
        .ok_or_else(|| ClientError::Transfer("not connected to hub".into()))?;

    if !inner.conf.is_passive {
        let (port, secure) = choose_peer_port(inner)?;
        if inner.url.adc {
            let (my_sid, peer_sid) = (st.my_sid.clone(), peer.sid.clone());
            let (Some(my_sid), Some(peer_sid)) = (my_sid, peer_sid) else {
                return Err(ClientError::Transfer("hub session not ready".into()));
            };
            let protocol = if secure { ADC_PROTO_TLS } else { ADC_PROTO_PLAIN };
            hub.send(Message::Adc(AdcMessage::new(
                AdcRoute::Direct {
                    from: my_sid,
                    to: peer_sid,
                },
                AdcBody::Ctm {
                    protocol: protocol.to_string(),
                    port,
                    token: token.unwrap_or_default(),
                },
            )));
        } else {
            let ip = st
                .local_ip
                .clone()
                .ok_or_else(|| ClientError::Transfer("local address unknown".into()))?;
            hub.send(Message::Nmdc(NmdcMessage::ConnectToMe {
                target: nick.to_string(),
                ip,
                port,
                secure,
            }));
        }
    } else if !peer.is_passive {
        if inner.url.adc {
            let (my_sid, peer_sid) = (st.my_sid.clone(), peer.sid.clone());
            let (Some(my_sid), Some(peer_sid)) = (my_sid, peer_sid) else {
                return Err(ClientError::Transfer("hub session not ready".into()));
            };
            // We will be the dialing side, so only our willingness to
            // speak TLS matters here.
            let secure = inner.tls.is_some()
                && inner.conf.peer_encryption_mode != crate::EncryptionMode::DisableEncryption;
            let protocol = if secure { ADC_PROTO_TLS } else { ADC_PROTO_PLAIN };
            hub.send(Message::Adc(AdcMessage::new(
                AdcRoute::Direct {
                    from: my_sid,
                    to: peer_sid,
                },
                AdcBody::Rcm {
                    protocol: protocol.to_string(),
                    token: token.unwrap_or_default(),
                },
            )));
        } else {
            hub.send(Message::Nmdc(NmdcMessage::RevConnectToMe {
                from: inner.conf.nick.clone(),
                to: nick.to_string(),
            }));
        }
    } else {
        return Err(ClientError::Transfer(
            "cannot connect to passive peer".into(),
        ));
    }
    Ok(())
}

/// Push a refreshed identity to the hub after the share changed.
pub(crate) fn advertise(inner: &Arc<Inner>, st: &mut State) {
    let msg = if inner.url.adc {
        adc_info_message(inner, st, false)
    } else {
        Some(my_info_message(inner, st))
    };
    if let (Some(hub), Some(msg)) = (st.hub.clone(), msg) {
        hub.send(msg);
    }
}

pub(crate) fn send_public_message(
    inner: &Arc<Inner>,
    st: &State,
    content: &str,
) -> ClientResult<()> {
    let hub = st
        .hub
        .clone()
        .ok_or_else(|| ClientError::Transfer("not connected to hub".into()))?;
    if inner.url.adc {
        let my_sid = st
            .my_sid
            .clone()
            .ok_or_else(|| ClientError::Transfer("hub session not ready".into()))?;
        hub.send(Message::Adc(AdcMessage::new(
            AdcRoute::Broadcast { sid: my_sid },
            AdcBody::Msg {
                text: content.to_string(),
                pm: None,
            },
        )));
    } else {
        hub.send(Message::Nmdc(NmdcMessage::PublicMessage {
            from: inner.conf.nick.clone(),
            content: content.to_string(),
        }));
    }
    Ok(())
}

pub(crate) fn send_private_message(
    inner: &Arc<Inner>,
    st: &State,
    nick: &str,
    content: &str,
) -> ClientResult<()> {
    let hub = st
        .hub
        .clone()
        .ok_or_else(|| ClientError::Transfer("not connected to hub".into()))?;
    if inner.url.adc {
        let my_sid = st
            .my_sid
            .clone()
            .ok_or_else(|| ClientError::Transfer("hub session not ready".into()))?;
        let peer_sid = st
            .peers
            .get(nick)
            .and_then(|p| p.sid.clone())
            .ok_or_else(|| ClientError::Transfer(format!("peer not on hub: {}", nick)))?;
        hub.send(Message::Adc(AdcMessage::new(
            AdcRoute::Echo {
                from: my_sid.clone(),
                to: peer_sid,
            },
            AdcBody::Msg {
                text: content.to_string(),
                pm: Some(my_sid),
            },
        )));
    } else {
        if !st.peers.contains_key(nick) {
            return Err(ClientError::Transfer(format!("peer not on hub: {}", nick)));
        }
        hub.send(Message::Nmdc(NmdcMessage::PrivateMessage {
            to: nick.to_string(),
            from: inner.conf.nick.clone(),
            content: content.to_string(),
        }));
    }
    Ok(())
}

/// Our NMDC `$MyINFO` line.
fn my_info_message(inner: &Arc<Inner>, st: &State) -> Message {
    let mode = if inner.conf.is_passive { 'P' } else { 'A' };
    let tag = format!(
        "{} V:{},M:{},H:1/0/0,S:{}",
        inner.conf.client_string,
        env!("CARGO_PKG_VERSION"),
        mode,
        inner.conf.upload_slots,
    );
    Message::Nmdc(NmdcMessage::MyInfo(NmdcMyInfo {
        nick: inner.conf.nick.clone(),
        description: inner.conf.description.clone(),
        tag: Some(tag),
        connection: "Cable".to_string(),
        flag: 0x01,
        email: inner.conf.email.clone(),
        share_size: st.share.total_size(),
    }))
}

/// Our ADC `BINF`; `with_pid` only during login.
fn adc_info_message(inner: &Arc<Inner>, st: &State, with_pid: bool) -> Option<Message> {
    let my_sid = st.my_sid.clone()?;
    let mut fields = vec![("ID".to_string(), inner.cid.to_string())];
    if with_pid {
        fields.push(("PD".to_string(), dctk_hash::base32_encode(&inner.pid)));
    }
    fields.push(("NI".to_string(), inner.conf.nick.clone()));
    fields.push(("DE".to_string(), inner.conf.description.clone()));
    fields.push(("EM".to_string(), inner.conf.email.clone()));
    fields.push(("VE".to_string(), inner.generator()));
    fields.push(("SL".to_string(), inner.conf.upload_slots.to_string()));
    fields.push(("SS".to_string(), st.share.total_size().to_string()));
    fields.push(("SF".to_string(), st.share.file_count().to_string()));
    if !inner.conf.is_passive {
        fields.push(("SU".to_string(), "TCP4,UDP4".to_string()));
        fields.push(("I4".to_string(), "0.0.0.0".to_string()));
        fields.push(("U4".to_string(), inner.conf.udp_port.to_string()));
    }
    if let Some(tls) = &inner.tls {
        fields.push(("KP".to_string(), tls.keyprint.clone()));
    }
    Some(Message::Adc(AdcMessage::new(
        AdcRoute::Broadcast { sid: my_sid },
        AdcBody::Inf { fields },
    )))
}
