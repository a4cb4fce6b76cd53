//! Peer connections: dial/accept, the NMDC and ADC handshakes, direction
//! election and the handover to the transfer engine.
//!
//! Each connection is one task owning its socket. After the handshake the
//! task either serves uploads (`wait_upload`) or runs downloads delegated
//! to it (`wait_download`).

use crate::client::{ConnId, Direction, Inner};
use crate::download::{self, DownloadJob};
use crate::transport::{self, BoxStream};
use crate::upload;
use crate::{ClientError, ClientResult};
use dctk_proto::adc::{self, AdcBody, AdcMessage, AdcRoute};
use dctk_proto::conn::{split, DcReader, DcWriter, Frame};
use dctk_proto::nmdc::{nmdc_key, NmdcMessage};
use dctk_proto::Message;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The lock value every NMDC client sends.
pub(crate) const NMDC_LOCK: &str = "EXTENDEDPROTOCOLABCABCABCABCABCABC";

/// Peer-level NMDC extensions we announce.
const NMDC_PEER_FEATURES: &[&str] = &["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF"];

/// Commands delivered to a connection task.
pub(crate) enum ConnCmd {
    /// Run a download on this (already idle, download-direction) link.
    Delegate(DownloadJob),
}

/// Orchestrator-side handle of one connection.
pub(crate) struct ConnHandle {
    pub nick: Option<String>,
    pub direction: Option<Direction>,
    pub cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    pub cancel: CancellationToken,
}

/// Accept-side entry point; the TLS handshake, when any, runs inside the
/// spawned task.
pub(crate) fn spawn_inbound(inner: &Arc<Inner>, stream: TcpStream, encrypted: bool) {
    let (conn_id, cmd_rx, cancel) = register(inner);
    let inner = inner.clone();
    inner.tracker.clone().spawn(async move {
        let mut cmd_rx = cmd_rx;
        let stream: ClientResult<BoxStream> = if encrypted {
            match &inner.tls {
                Some(identity) => identity.accept(stream).await,
                None => Err(ClientError::Transport(
                    "encrypted connection without tls identity".into(),
                )),
            }
        } else {
            Ok(Box::new(stream))
        };
        match stream {
            Ok(stream) => {
                run_conn(inner, conn_id, stream, true, encrypted, None, None, cmd_rx, cancel).await
            }
            Err(e) => {
                warn!(%conn_id, error = %e, "inbound tls failed");
                cleanup(&inner, conn_id, &mut cmd_rx);
            }
        }
    });
}

/// Dial-side entry point, used when the hub relays a connect-to-me.
pub(crate) fn spawn_outbound(
    inner: &Arc<Inner>,
    ip: String,
    port: u16,
    secure: bool,
    adc_token: Option<String>,
) {
    let (conn_id, cmd_rx, cancel) = register(inner);
    let inner = inner.clone();
    inner.tracker.clone().spawn(async move {
        let mut cmd_rx = cmd_rx;
        let dialed = transport::dial_retries(&ip, port, &cancel).await;
        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                if !e.is_terminated() {
                    warn!(%conn_id, ip = %ip, port, error = %e, "peer dial failed");
                }
                cleanup(&inner, conn_id, &mut cmd_rx);
                return;
            }
        };
        info!(%conn_id, ip = %ip, port, secure, "peer connected");

        let (stream, keyprint): (BoxStream, Option<String>) = if secure {
            match &inner.tls {
                Some(identity) => match identity.connect(stream, &ip).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%conn_id, error = %e, "peer tls failed");
                        cleanup(&inner, conn_id, &mut cmd_rx);
                        return;
                    }
                },
                None => {
                    warn!(%conn_id, "secure connect-to-me but encryption is disabled");
                    cleanup(&inner, conn_id, &mut cmd_rx);
                    return;
                }
            }
        } else {
            (Box::new(stream), None)
        };
        run_conn(
            inner, conn_id, stream, false, secure, adc_token, keyprint, cmd_rx, cancel,
        )
        .await;
    });
}

fn register(inner: &Arc<Inner>) -> (ConnId, mpsc::UnboundedReceiver<ConnCmd>, CancellationToken) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let cancel = inner.cancel.child_token();
    let mut st = inner.state.lock();
    let conn_id = ConnId(st.next_id());
    st.conns.insert(
        conn_id,
        ConnHandle {
            nick: None,
            direction: None,
            cmd_tx,
            cancel: cancel.clone(),
        },
    );
    (conn_id, cmd_rx, cancel)
}

#[allow(clippy::too_many_arguments)]
async fn run_conn(
    inner: Arc<Inner>,
    conn_id: ConnId,
    stream: BoxStream,
    inbound: bool,
    encrypted: bool,
    adc_token: Option<String>,
    remote_keyprint: Option<String>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = split(stream, inner.proto_kind());
    let result = conn_main(
        &inner,
        conn_id,
        inbound,
        encrypted,
        adc_token,
        remote_keyprint,
        &mut reader,
        &mut writer,
        &mut cmd_rx,
        &cancel,
    )
    .await;

    match &result {
        Err(e) if !e.is_terminated() => warn!(%conn_id, error = %e, "peer connection failed"),
        _ => debug!(%conn_id, "peer disconnected"),
    }
    let _ = writer.shutdown().await;
    cleanup(&inner, conn_id, &mut cmd_rx);
}

/// Remove the connection from the index and fail anything still queued.
fn cleanup(inner: &Arc<Inner>, conn_id: ConnId, cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>) {
    {
        let mut st = inner.state.lock();
        if let Some(handle) = st.conns.remove(&conn_id) {
            if let (Some(nick), Some(dir)) = (handle.nick, handle.direction) {
                let key = (nick, dir);
                if st.conns_by_key.get(&key).copied() == Some(conn_id) {
                    st.conns_by_key.remove(&key);
                }
            }
        }
    }
    while let Ok(ConnCmd::Delegate(job)) = cmd_rx.try_recv() {
        download::finish_download(
            inner,
            job.id,
            Err(ClientError::Transfer("peer connection lost".into())),
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn conn_main<R, W>(
    inner: &Arc<Inner>,
    conn_id: ConnId,
    inbound: bool,
    encrypted: bool,
    adc_token: Option<String>,
    remote_keyprint: Option<String>,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (nick, direction, first_job) = if inner.url.adc {
        handshake_adc(
            inner,
            conn_id,
            inbound,
            encrypted,
            adc_token,
            remote_keyprint,
            reader,
            writer,
            cancel,
        )
        .await?
    } else {
        handshake_nmdc(inner, conn_id, inbound, reader, writer, cancel).await?
    };
    debug!(%conn_id, nick = %nick, direction = direction.as_str(), "handshake complete");

    match direction {
        Direction::Download => {
            download_loop(inner, first_job, reader, writer, cmd_rx, cancel).await
        }
        Direction::Upload => upload_loop(inner, &nick, reader, writer, cancel).await,
    }
}

/// Read one frame, bailing out on cancellation.
async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut DcReader<R>,
    cancel: &CancellationToken,
) -> ClientResult<Frame> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Terminated),
        frame = reader.read_frame() => Ok(frame?),
    }
}

/// NMDC five-message handshake with interleaved substates, then direction
/// election.
async fn handshake_nmdc<R, W>(
    inner: &Arc<Inner>,
    conn_id: ConnId,
    inbound: bool,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
    cancel: &CancellationToken,
) -> ClientResult<(String, Direction, Option<DownloadJob>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Sub {
        Connected,
        MyNick,
        Lock,
        Supports,
        Direction,
    }

    // The dialing side speaks first.
    if !inbound {
        send_nmdc_intro(inner, writer, true).await?;
    }

    let mut sub = Sub::Connected;
    let mut nick = String::new();
    let mut local_download = false;
    let mut local_bet = 0u32;
    let mut remote_download = false;
    let mut remote_bet = 0u32;

    loop {
        let msg = match next_frame(reader, cancel).await? {
            Frame::KeepAlive => continue,
            Frame::Binary(_) => {
                return Err(ClientError::Protocol("binary during handshake".into()))
            }
            Frame::Message(Message::Nmdc(m)) => m,
            Frame::Message(other) => {
                return Err(ClientError::Protocol(format!(
                    "wrong dialect during handshake: {:?}",
                    other
                )))
            }
        };
        match msg {
            NmdcMessage::MyNick { nick: remote } => {
                expect(sub == Sub::Connected, "MyNick", sub)?;
                sub = Sub::MyNick;
                let known = inner.state.lock().peers.contains_key(&remote);
                if !known {
                    return Err(ClientError::Protocol(format!(
                        "peer not connected to hub ({})",
                        remote
                    )));
                }
                nick = remote;
            }
            NmdcMessage::Lock { lock, .. } => {
                expect(sub == Sub::MyNick, "Lock", sub)?;
                sub = Sub::Lock;

                // The accepting side answers the intro only now.
                if inbound {
                    send_nmdc_intro(inner, writer, false).await?;
                }

                let mut features: Vec<String> =
                    NMDC_PEER_FEATURES.iter().map(|s| s.to_string()).collect();
                if !inner.conf.peer_disable_compression {
                    features.push("ZLIG".to_string());
                }
                writer
                    .write_message(&Message::Nmdc(NmdcMessage::Supports { features }))
                    .await?;

                local_bet = inner.random_bet();
                local_download = {
                    let st = inner.state.lock();
                    download::has_pending_download(&st, &nick)
                };
                writer
                    .write_message(&Message::Nmdc(NmdcMessage::Direction {
                        download: local_download,
                        bet: local_bet,
                    }))
                    .await?;
                writer
                    .write_message(&Message::Nmdc(NmdcMessage::Key {
                        key: nmdc_key(lock.as_bytes()),
                    }))
                    .await?;
            }
            NmdcMessage::Supports { .. } => {
                expect(sub == Sub::Lock, "Supports", sub)?;
                sub = Sub::Supports;
            }
            NmdcMessage::Direction { download, bet } => {
                expect(sub == Sub::Supports, "Direction", sub)?;
                sub = Sub::Direction;
                remote_download = download;
                remote_bet = bet;
            }
            NmdcMessage::Key { .. } => {
                expect(sub == Sub::Direction, "Key", sub)?;
                if remote_bet == 0 {
                    return Err(ClientError::Protocol("direction bet 0".into()));
                }

                let direction = match (local_download, remote_download) {
                    (false, true) => Direction::Upload,
                    (true, false) => Direction::Download,
                    (true, true) => {
                        if local_bet > remote_bet {
                            Direction::Download
                        } else if local_bet < remote_bet {
                            // The pending download needs another link.
                            let mut st = inner.state.lock();
                            if download::has_pending_download(&st, &nick) {
                                let _ = crate::hub::request_peer_connection(
                                    inner, &mut st, &nick, None,
                                );
                            }
                            Direction::Upload
                        } else {
                            return Err(ClientError::Protocol("equal random numbers".into()));
                        }
                    }
                    (false, false) => {
                        return Err(ClientError::Protocol("double upload request".into()))
                    }
                };

                let mut st = inner.state.lock();
                register_direction(&mut st, conn_id, &nick, direction)?;
                let job = if direction == Direction::Download {
                    let job = download::claim_pending_download(inner, &mut st, &nick);
                    if job.is_none() {
                        return Err(ClientError::Protocol(
                            "download connection but cannot find download".into(),
                        ));
                    }
                    job
                } else {
                    None
                };
                return Ok((nick, direction, job));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected handshake message: {:?}",
                    other
                )))
            }
        }
    }
}

async fn send_nmdc_intro<W: AsyncWrite + Unpin>(
    inner: &Arc<Inner>,
    writer: &mut DcWriter<W>,
    with_ref: bool,
) -> ClientResult<()> {
    writer
        .write_message(&Message::Nmdc(NmdcMessage::MyNick {
            nick: inner.conf.nick.clone(),
        }))
        .await?;
    writer
        .write_message(&Message::Nmdc(NmdcMessage::Lock {
            lock: NMDC_LOCK.to_string(),
            pk: inner.conf.pk_value.clone(),
            reference: with_ref.then(|| inner.url.addr()),
        }))
        .await?;
    Ok(())
}

fn expect(ok: bool, what: &str, sub: impl std::fmt::Debug) -> ClientResult<()> {
    if ok {
        Ok(())
    } else {
        Err(ClientError::Protocol(format!(
            "[{}] invalid handshake state: {:?}",
            what, sub
        )))
    }
}

/// ADC `CSUP` → `CINF` handshake with token matching and, on the dialing
/// side, TLS keyprint validation.
#[allow(clippy::too_many_arguments)]
async fn handshake_adc<R, W>(
    inner: &Arc<Inner>,
    conn_id: ConnId,
    inbound: bool,
    encrypted: bool,
    mut token: Option<String>,
    remote_keyprint: Option<String>,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
    cancel: &CancellationToken,
) -> ClientResult<(String, Direction, Option<DownloadJob>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !inbound {
        write_adc_supports(writer).await?;
    }

    let mut seen_sup = false;
    loop {
        let msg = match next_frame(reader, cancel).await? {
            Frame::KeepAlive => continue,
            Frame::Binary(_) => {
                return Err(ClientError::Protocol("binary during handshake".into()))
            }
            Frame::Message(Message::Adc(m)) => m,
            Frame::Message(other) => {
                return Err(ClientError::Protocol(format!(
                    "wrong dialect during handshake: {:?}",
                    other
                )))
            }
        };
        match msg.body {
            AdcBody::Sta(sta) if sta.is_ok() => continue,
            AdcBody::Sta(sta) => {
                return Err(ClientError::Protocol(format!(
                    "({}) {}",
                    sta.code, sta.message
                )))
            }
            AdcBody::Sup { .. } => {
                if seen_sup {
                    return Err(ClientError::Protocol("[Supports] invalid state".into()));
                }
                seen_sup = true;
                if inbound {
                    write_adc_supports(writer).await?;
                } else {
                    // The dialer identifies itself and echoes the token
                    // it was given in the connect-to-me.
                    let mut fields = vec![("ID".to_string(), inner.cid.to_string())];
                    if let Some(token) = &token {
                        fields.push(("TO".to_string(), token.clone()));
                    }
                    writer
                        .write_message(&Message::Adc(AdcMessage::new(
                            AdcRoute::Client,
                            AdcBody::Inf { fields },
                        )))
                        .await?;
                }
            }
            AdcBody::Inf { fields } => {
                if !seen_sup {
                    return Err(ClientError::Protocol("[Infos] invalid state".into()));
                }
                let client_id = fields
                    .iter()
                    .find(|(k, _)| k == "ID")
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ClientError::Protocol("client id not provided".into()))?;
                let raw_id = dctk_hash::base32_decode(&client_id)
                    .map_err(|_| ClientError::Protocol("malformed client id".into()))?;

                let nick = {
                    let st = inner.state.lock();
                    st.peers
                        .values()
                        .find(|p| p.client_id.as_deref() == Some(raw_id.as_slice()))
                        .map(|p| p.nick.clone())
                }
                .ok_or_else(|| {
                    ClientError::Protocol(format!("unknown client id ({})", client_id))
                })?;

                if inbound {
                    token = Some(
                        fields
                            .iter()
                            .find(|(k, _)| k == "TO")
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| {
                                ClientError::Protocol("token not provided".into())
                            })?,
                    );
                    // Token is not echoed back on the accepting side.
                    writer
                        .write_message(&Message::Adc(AdcMessage::new(
                            AdcRoute::Client,
                            AdcBody::Inf {
                                fields: vec![("ID".to_string(), inner.cid.to_string())],
                            },
                        )))
                        .await?;
                } else if encrypted {
                    // Keyprint check is the dialer's job; accepting peers
                    // often omit their certificate.
                    let advertised = inner
                        .state
                        .lock()
                        .peers
                        .get(&nick)
                        .and_then(|p| p.fingerprint.clone());
                    if let Some(expected) = advertised {
                        match &remote_keyprint {
                            Some(got) if *got == expected => {
                                debug!(%conn_id, "peer keyprint validated");
                            }
                            got => {
                                return Err(ClientError::Transport(format!(
                                    "unable to validate peer fingerprint ({:?} vs {})",
                                    got, expected
                                )))
                            }
                        }
                    }
                }

                let mut st = inner.state.lock();
                let job = token
                    .as_deref()
                    .and_then(|t| download::claim_download_by_token(inner, &mut st, t));
                let direction = if job.is_some() {
                    Direction::Download
                } else {
                    Direction::Upload
                };
                register_direction(&mut st, conn_id, &nick, direction)?;
                return Ok((nick, direction, job));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected handshake message: {:?}",
                    other
                )))
            }
        }
    }
}

async fn write_adc_supports<W: AsyncWrite + Unpin>(writer: &mut DcWriter<W>) -> ClientResult<()> {
    writer
        .write_message(&Message::Adc(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::Sup {
                add: vec![
                    adc::FEATURE_BAS0.to_string(),
                    adc::FEATURE_BASE.to_string(),
                    adc::FEATURE_TIGR.to_string(),
                    adc::FEATURE_BZIP.to_string(),
                    adc::FEATURE_ZLIG.to_string(),
                ],
                remove: vec![],
            },
        )))
        .await?;
    Ok(())
}

fn register_direction(
    st: &mut crate::client::State,
    conn_id: ConnId,
    nick: &str,
    direction: Direction,
) -> ClientResult<()> {
    let key = (nick.to_string(), direction);
    if st.conns_by_key.contains_key(&key) {
        return Err(ClientError::Protocol(
            "a connection with this peer and direction already exists".into(),
        ));
    }
    st.conns_by_key.insert(key, conn_id);
    if let Some(handle) = st.conns.get_mut(&conn_id) {
        handle.nick = Some(nick.to_string());
        handle.direction = Some(direction);
    }
    Ok(())
}

/// Idle in `wait_download`, running downloads as they are delegated.
async fn download_loop<R, W>(
    inner: &Arc<Inner>,
    mut next_job: Option<DownloadJob>,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        if let Some(job) = next_job.take() {
            let id = job.id;
            match download::process_download(inner, &job, reader, writer).await {
                Ok(outcome) => download::finish_download(inner, id, Ok(outcome)),
                Err(e) => {
                    let terminated = e.is_terminated();
                    let text = e.to_string();
                    download::finish_download(inner, id, Err(e));
                    return Err(if terminated {
                        ClientError::Terminated
                    } else {
                        ClientError::Transfer(text)
                    });
                }
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Terminated),
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Delegate(job)) => next_job = Some(job),
                None => return Err(ClientError::Terminated),
            },
            frame = reader.read_frame() => match frame? {
                Frame::KeepAlive => {}
                Frame::Message(Message::Adc(AdcMessage { body: AdcBody::Sta(sta), .. }))
                    if sta.is_ok() => {}
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected message while idle: {:?}",
                        other
                    )))
                }
            },
        }
    }
}

/// Idle in `wait_upload`, serving content requests.
async fn upload_loop<R, W>(
    inner: &Arc<Inner>,
    nick: &str,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = next_frame(reader, cancel).await?;
        let (query, start, length, compressed) = match frame {
            Frame::KeepAlive => continue,
            Frame::Message(Message::Nmdc(NmdcMessage::GetFile {
                query,
                start,
                length,
                compressed,
            }))
            | Frame::Message(Message::Adc(AdcMessage {
                body:
                    AdcBody::GetFile {
                        query,
                        start,
                        length,
                        compressed,
                    },
                ..
            })) => (query, start, length, compressed),
            Frame::Message(Message::Adc(AdcMessage {
                body: AdcBody::Sta(sta),
                ..
            })) if sta.is_ok() => continue,
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected message while waiting for upload: {:?}",
                    other
                )))
            }
        };
        upload::serve_upload(inner, nick, writer, &query, start, length, compressed, cancel)
            .await?;
    }
}
