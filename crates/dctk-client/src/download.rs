//! Downloads: the serial gating pipeline and the transfer processing that
//! runs on a delegated peer connection.
//!
//! A new download passes, in order: the per-peer gate (one active download
//! per peer), the slot gate, and the peer-connection gate (reusing an idle
//! download connection or asking the hub for a fresh one). Each gate is a
//! one-shot wake signal; the finishing download hands its claim to the
//! next waiter before waking it, in insertion order.

use crate::client::{Direction, DownloadId, Inner, State};
use crate::peer_conn::ConnCmd;
use crate::{ClientError, ClientResult};
use dctk_hash::TigerHash;
use dctk_proto::adc::{AdcBody, AdcMessage, AdcRoute};
use dctk_proto::conn::{DcReader, DcWriter, Frame};
use dctk_proto::nmdc::NmdcMessage;
use dctk_proto::{Message, ProtoKind};
use dctk_share::FILE_LIST_NAME;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a download waits for the peer to dial back after a
/// connect-to-me request.
pub(crate) const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Compression is only worth negotiating above this length.
const COMPRESS_MIN_LENGTH: i64 = 10 * 1024;

/// Download configuration.
#[derive(Debug, Clone)]
pub struct DownloadConf {
    /// Nick of the peer to download from.
    pub peer_nick: String,
    /// Content address; `None` only for file-list downloads.
    pub tth: Option<TigerHash>,
    /// Starting offset in bytes.
    pub start: u64,
    /// Length of the part; anything non-positive means "to the end".
    pub length: i64,
    /// Save to this path; `None` keeps the content in memory.
    pub save_path: Option<PathBuf>,
    /// Skip the whole-file TTH check after completion.
    pub skip_validation: bool,
    pub(crate) is_filelist: bool,
}

impl DownloadConf {
    /// Download a whole file by content address.
    pub fn new(peer_nick: &str, tth: TigerHash) -> Self {
        Self {
            peer_nick: peer_nick.to_string(),
            tth: Some(tth),
            start: 0,
            length: -1,
            save_path: None,
            skip_validation: false,
            is_filelist: false,
        }
    }

    pub(crate) fn file_list(peer_nick: &str, save_path: Option<PathBuf>) -> Self {
        Self {
            peer_nick: peer_nick.to_string(),
            tth: None,
            start: 0,
            length: -1,
            save_path,
            skip_validation: false,
            is_filelist: true,
        }
    }
}

/// Pipeline position of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DlState {
    /// Running between gates.
    Starting,
    WaitingActive,
    WaitingSlot,
    WaitingPeer,
    Processing,
}

/// Orchestrator-side bookkeeping for one download.
pub(crate) struct DownloadEntry {
    pub conf: DownloadConf,
    pub query: String,
    pub state: DlState,
    pub adc_token: Option<String>,
    pub holds_slot: bool,
    pub wake_active: Option<oneshot::Sender<()>>,
    pub wake_slot: Option<oneshot::Sender<()>>,
    pub wake_peer: Option<oneshot::Sender<()>>,
    pub cancel: CancellationToken,
    pub closed: bool,
}

/// Everything a connection task needs to run one download.
#[derive(Debug, Clone)]
pub(crate) struct DownloadJob {
    pub id: DownloadId,
    pub peer_nick: String,
    pub query: String,
    pub start: u64,
    pub length: i64,
    pub compressed: bool,
    pub save_path: Option<PathBuf>,
    pub skip_validation: bool,
    pub tth: Option<TigerHash>,
    pub is_filelist: bool,
    pub cancel: CancellationToken,
}

/// Result data of a finished download.
#[derive(Debug)]
pub(crate) struct DownloadOutcome {
    pub content: Option<Vec<u8>>,
    pub size: u64,
}

/// Register a download and start its pipeline task.
pub(crate) fn start_download(inner: &Arc<Inner>, mut conf: DownloadConf) -> ClientResult<DownloadId> {
    if conf.length <= 0 {
        conf.length = -1;
    }
    if !conf.is_filelist && conf.tth.is_none() {
        return Err(ClientError::Config("download needs a TTH".into()));
    }

    let query = if conf.is_filelist {
        format!("file {}", FILE_LIST_NAME)
    } else {
        format!("file TTH/{}", conf.tth.expect("checked above"))
    };

    let id = {
        let mut st = inner.state.lock();
        if !st.peers.contains_key(&conf.peer_nick) {
            return Err(ClientError::Config(format!(
                "peer not on hub: {}",
                conf.peer_nick
            )));
        }
        let id = DownloadId(st.next_id());
        st.downloads.insert(
            id,
            DownloadEntry {
                conf: conf.clone(),
                query: query.clone(),
                state: DlState::Starting,
                adc_token: None,
                holds_slot: false,
                wake_active: None,
                wake_slot: None,
                wake_peer: None,
                cancel: inner.cancel.child_token(),
                closed: false,
            },
        );
        id
    };

    info!(%id, peer = %conf.peer_nick, query = %query, start = conf.start,
        length = conf.length, "download requested");

    let inner = inner.clone();
    inner.tracker.clone().spawn(async move {
        if let Err(e) = pipeline(&inner, id).await {
            finish_download(&inner, id, Err(e));
        }
    });
    Ok(id)
}

/// Stop a download; no terminal event will be delivered for it.
pub(crate) fn close_download(inner: &Arc<Inner>, id: DownloadId) {
    let mut st = inner.state.lock();
    let st = &mut *st;
    let Some(entry) = st.downloads.get_mut(&id) else {
        return;
    };
    if entry.closed {
        return;
    }
    entry.closed = true;
    entry.cancel.cancel();
    debug!(%id, "download close requested");

    // A processing download is interrupted by closing its connection.
    if entry.state == DlState::Processing {
        let key = (entry.conf.peer_nick.clone(), Direction::Download);
        if let Some(conn_id) = st.conns_by_key.get(&key).copied() {
            if let Some(conn) = st.conns.get(&conn_id) {
                conn.cancel.cancel();
            }
        }
    }
}

/// The gating pipeline. Ends after handing the download to a connection
/// task; transfer processing continues there.
async fn pipeline(inner: &Arc<Inner>, id: DownloadId) -> ClientResult<()> {
    // Gate 1: one active download per peer.
    let wait_rx = {
        let mut st = inner.state.lock();
        let nick = entry(&mut st, id)?.conf.peer_nick.clone();
        if st.active_download_by_peer.contains_key(&nick) {
            let (tx, rx) = oneshot::channel();
            let e = entry(&mut st, id)?;
            e.state = DlState::WaitingActive;
            e.wake_active = Some(tx);
            Some(rx)
        } else {
            st.active_download_by_peer.insert(nick, id);
            None
        }
    };
    if let Some(rx) = wait_rx {
        gate_wait(inner, id, rx, None).await?;
    }

    // Gate 2: download slot.
    let wait_rx = {
        let mut st = inner.state.lock();
        if st.download_slot_avail <= 0 {
            let (tx, rx) = oneshot::channel();
            let e = entry(&mut st, id)?;
            e.state = DlState::WaitingSlot;
            e.wake_slot = Some(tx);
            Some(rx)
        } else {
            st.download_slot_avail -= 1;
            let e = entry(&mut st, id)?;
            e.state = DlState::Starting;
            e.holds_slot = true;
            None
        }
    };
    if let Some(rx) = wait_rx {
        gate_wait(inner, id, rx, None).await?;
    }

    // Gate 3: a peer connection in download direction.
    enum Gate3 {
        Existing(tokio::sync::mpsc::UnboundedSender<ConnCmd>, DownloadJob),
        Wait(oneshot::Receiver<()>),
    }
    let gate = {
        let mut st = inner.state.lock();
        let nick = entry(&mut st, id)?.conf.peer_nick.clone();
        let key = (nick.clone(), Direction::Download);
        if let Some(conn_id) = st.conns_by_key.get(&key).copied() {
            debug!(%id, peer = %nick, "using existing connection");
            let job = build_job(inner, entry(&mut st, id)?, id);
            entry(&mut st, id)?.state = DlState::Processing;
            let tx = st
                .conns
                .get(&conn_id)
                .map(|c| c.cmd_tx.clone())
                .ok_or_else(|| ClientError::Transfer("peer connection lost".into()))?;
            Gate3::Existing(tx, job)
        } else {
            debug!(%id, peer = %nick, "requesting new connection");
            let token = if inner.url.adc {
                let token = inner.random_token();
                entry(&mut st, id)?.adc_token = Some(token.clone());
                Some(token)
            } else {
                None
            };
            let (tx, rx) = oneshot::channel();
            let e = entry(&mut st, id)?;
            e.state = DlState::WaitingPeer;
            e.wake_peer = Some(tx);
            crate::hub::request_peer_connection(inner, &mut st, &nick, token)?;
            Gate3::Wait(rx)
        }
    };
    match gate {
        Gate3::Existing(tx, job) => {
            if tx.send(ConnCmd::Delegate(job)).is_err() {
                return Err(ClientError::Transfer("peer connection lost".into()));
            }
        }
        Gate3::Wait(rx) => {
            gate_wait(inner, id, rx, Some(PEER_WAIT_TIMEOUT)).await?;
        }
    }
    Ok(())
}

fn entry<'a>(st: &'a mut State, id: DownloadId) -> ClientResult<&'a mut DownloadEntry> {
    st.downloads
        .get_mut(&id)
        .ok_or(ClientError::Terminated)
}

async fn gate_wait(
    inner: &Arc<Inner>,
    id: DownloadId,
    rx: oneshot::Receiver<()>,
    timeout: Option<Duration>,
) -> ClientResult<()> {
    let cancel = {
        let mut st = inner.state.lock();
        entry(&mut st, id)?.cancel.clone()
    };
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Terminated),
        result = rx => result.map_err(|_| ClientError::Terminated),
        _ = deadline => Err(ClientError::PeerTimeout),
    }
}

/// True when the peer has a download queued on its connection gate.
pub(crate) fn has_pending_download(st: &State, nick: &str) -> bool {
    st.active_download_by_peer
        .get(nick)
        .and_then(|id| st.downloads.get(id))
        .is_some_and(|e| e.state == DlState::WaitingPeer && !e.closed)
}

/// Claim the download waiting on a connection to `nick`: mark it
/// processing, wake its pipeline and return the job to run.
pub(crate) fn claim_pending_download(
    inner: &Arc<Inner>,
    st: &mut State,
    nick: &str,
) -> Option<DownloadJob> {
    let id = *st.active_download_by_peer.get(nick)?;
    let ready = st
        .downloads
        .get(&id)
        .is_some_and(|e| e.state == DlState::WaitingPeer && !e.closed);
    if !ready {
        return None;
    }
    let job = build_job(inner, st.downloads.get(&id)?, id);
    let e = st.downloads.get_mut(&id)?;
    e.state = DlState::Processing;
    if let Some(tx) = e.wake_peer.take() {
        let _ = tx.send(());
    }
    Some(job)
}

/// Claim a download by its ADC connect-to-me token.
pub(crate) fn claim_download_by_token(
    inner: &Arc<Inner>,
    st: &mut State,
    token: &str,
) -> Option<DownloadJob> {
    let id = st
        .downloads
        .iter()
        .find(|(_, e)| {
            e.adc_token.as_deref() == Some(token) && e.state == DlState::WaitingPeer && !e.closed
        })
        .map(|(id, _)| *id)?;
    let job = build_job(inner, st.downloads.get(&id)?, id);
    let e = st.downloads.get_mut(&id)?;
    e.state = DlState::Processing;
    if let Some(tx) = e.wake_peer.take() {
        let _ = tx.send(());
    }
    Some(job)
}

fn build_job(inner: &Arc<Inner>, entry: &DownloadEntry, id: DownloadId) -> DownloadJob {
    let compressed = !inner.conf.peer_disable_compression
        && (entry.conf.length == -1 || entry.conf.length >= COMPRESS_MIN_LENGTH);
    DownloadJob {
        id,
        peer_nick: entry.conf.peer_nick.clone(),
        query: entry.query.clone(),
        start: entry.conf.start,
        length: entry.conf.length,
        compressed,
        save_path: entry.conf.save_path.clone(),
        skip_validation: entry.conf.skip_validation,
        tth: entry.conf.tth,
        is_filelist: entry.conf.is_filelist,
        cancel: entry.cancel.clone(),
    }
}

/// Terminal handler; runs exactly once per download. Frees the per-peer
/// claim and the slot, wakes the next waiter of each, and reports to the
/// embedder unless the download was closed or the client is shutting down.
pub(crate) fn finish_download(
    inner: &Arc<Inner>,
    id: DownloadId,
    result: Result<DownloadOutcome, ClientError>,
) {
    let mut event = None;
    {
        let mut st = inner.state.lock();
        let Some(entry) = st.downloads.remove(&id) else {
            return;
        };
        let nick = entry.conf.peer_nick.clone();

        if st.active_download_by_peer.get(&nick) == Some(&id) {
            st.active_download_by_peer.remove(&nick);
            let next = st
                .downloads
                .iter_mut()
                .find(|(_, e)| {
                    e.conf.peer_nick == nick && e.state == DlState::WaitingActive && !e.closed
                })
                .map(|(nid, e)| {
                    e.state = DlState::Starting;
                    (*nid, e.wake_active.take())
                });
            if let Some((next_id, tx)) = next {
                st.active_download_by_peer.insert(nick.clone(), next_id);
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
        }

        if entry.holds_slot {
            st.download_slot_avail += 1;
            let next = st
                .downloads
                .values_mut()
                .find(|e| e.state == DlState::WaitingSlot && !e.closed)
                .map(|e| {
                    e.state = DlState::Starting;
                    e.holds_slot = true;
                    e.wake_slot.take()
                });
            if let Some(tx) = next {
                st.download_slot_avail -= 1;
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }
        }

        match result {
            Ok(outcome) => {
                info!(%id, peer = %nick, size = outcome.size, "download finished");
                if !entry.closed {
                    event = Some(crate::ClientEvent::DownloadSuccessful(
                        crate::events::DownloadResult {
                            id,
                            peer_nick: nick,
                            content: outcome.content,
                            save_path: entry.conf.save_path.clone(),
                            size: outcome.size,
                        },
                    ));
                }
            }
            Err(e) => {
                if !entry.closed && !e.is_terminated() {
                    warn!(%id, peer = %nick, error = %e, "download failed");
                    event = Some(crate::ClientEvent::DownloadError {
                        id,
                        peer_nick: nick,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    if let Some(ev) = event {
        inner.emit(ev);
    }
}

/// Run one download on its delegated connection: request, validate the
/// answer, stream the content, post-process and hand back the outcome.
pub(crate) async fn process_download<R, W>(
    inner: &Arc<Inner>,
    job: &DownloadJob,
    reader: &mut DcReader<R>,
    writer: &mut DcWriter<W>,
) -> ClientResult<DownloadOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = match inner.proto_kind() {
        ProtoKind::Nmdc => Message::Nmdc(NmdcMessage::GetFile {
            query: job.query.clone(),
            start: job.start,
            length: job.length,
            compressed: job.compressed,
        }),
        ProtoKind::Adc => Message::Adc(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::GetFile {
                query: job.query.clone(),
                start: job.start,
                length: job.length,
                compressed: job.compressed,
            },
        )),
    };
    writer.write_message(&request).await?;

    // Wait for the answer and validate it against what we asked for.
    let (length, compressed) = loop {
        let frame = tokio::select! {
            _ = job.cancel.cancelled() => return Err(ClientError::Terminated),
            frame = reader.read_frame() => frame?,
        };
        let msg = match frame {
            Frame::KeepAlive => continue,
            Frame::Binary(_) => {
                return Err(ClientError::Protocol("binary before send answer".into()))
            }
            Frame::Message(m) => m,
        };
        let answer = match msg {
            Message::Nmdc(NmdcMessage::SendFile {
                query,
                start,
                length,
                compressed,
            })
            | Message::Adc(AdcMessage {
                body:
                    AdcBody::SendFile {
                        query,
                        start,
                        length,
                        compressed,
                    },
                ..
            }) => (query, start, length, compressed),
            Message::Nmdc(NmdcMessage::MaxedOut) => {
                return Err(ClientError::Transfer("maxed out".into()))
            }
            Message::Nmdc(NmdcMessage::Error { message }) => {
                return Err(ClientError::Transfer(message))
            }
            Message::Adc(AdcMessage {
                body: AdcBody::Sta(sta),
                ..
            }) if !sta.is_ok() => {
                return Err(ClientError::Transfer(format!(
                    "({}) {}",
                    sta.code, sta.message
                )))
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected answer to content request: {:?}",
                    other
                )))
            }
        };

        let (query, start, length, answer_compressed) = answer;
        if query != job.query {
            return Err(ClientError::Transfer(format!(
                "peer returned wrong query: {} instead of {}",
                query, job.query
            )));
        }
        if start != job.start {
            return Err(ClientError::Transfer(format!(
                "peer returned wrong start: {} instead of {}",
                start, job.start
            )));
        }
        if answer_compressed && inner.conf.peer_disable_compression {
            return Err(ClientError::Transfer(
                "compression is active but disabled".into(),
            ));
        }
        if job.length != -1 && length != job.length as u64 {
            return Err(ClientError::Transfer(format!(
                "peer returned wrong length: {} instead of {}",
                length, job.length
            )));
        }
        if length == 0 {
            return Err(ClientError::Transfer(
                "zero-length transfers are not supported".into(),
            ));
        }
        break (length, answer_compressed);
    };

    debug!(id = %job.id, length, compressed, "receiving content");

    enum Sink {
        File(tokio::fs::File, PathBuf),
        Ram(Vec<u8>),
    }
    let mut sink = match &job.save_path {
        Some(path) => {
            let tmp = tmp_path(path);
            let file = tokio::fs::File::create(&tmp)
                .await
                .map_err(|e| ClientError::Transfer(format!("cannot create {}: {}", tmp.display(), e)))?;
            Sink::File(file, tmp)
        }
        None => Sink::Ram(Vec::with_capacity(length as usize)),
    };

    reader.set_read_binary(length);
    if compressed {
        reader.enable_zlib();
    }

    let mut offset = 0u64;
    let mut last_sample = Instant::now();
    reader.take_counter();
    while offset < length {
        let frame = tokio::select! {
            _ = job.cancel.cancelled() => return Err(ClientError::Terminated),
            frame = reader.read_frame() => frame?,
        };
        let chunk = match frame {
            Frame::Binary(chunk) => chunk,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected content bytes, got {:?}",
                    other
                )))
            }
        };
        match &mut sink {
            Sink::File(file, _) => file
                .write_all(&chunk)
                .await
                .map_err(|e| ClientError::Transfer(format!("write failed: {}", e)))?,
            Sink::Ram(buf) => buf.extend_from_slice(&chunk),
        }
        offset += chunk.len() as u64;

        let since = last_sample.elapsed();
        if since >= Duration::from_secs(1) {
            last_sample = Instant::now();
            let speed = reader.take_counter() as f64 / 1024.0 / since.as_secs_f64();
            debug!(id = %job.id, received = offset, total = length, kib_per_s = speed, "recv");
        }
    }
    reader.set_read_line();

    // Post-process: decompress file lists, validate whole files, then
    // move the temporary file in place.
    let whole_file = job.start == 0 && job.length == -1;
    match sink {
        Sink::File(mut file, tmp) => {
            file.flush()
                .await
                .map_err(|e| ClientError::Transfer(format!("flush failed: {}", e)))?;
            drop(file);
            let path = job.save_path.clone().expect("file sink has a path");

            if job.is_filelist {
                let tmp2 = tmp.clone();
                let path2 = path.clone();
                tokio::task::spawn_blocking(move || bunzip_file(&tmp2, &path2))
                    .await
                    .map_err(|e| ClientError::Transfer(e.to_string()))?
                    .map_err(|e| ClientError::Transfer(format!("file list unpack failed: {}", e)))?;
            } else {
                if whole_file && !job.skip_validation {
                    let expected = job.tth.expect("non-filelist download has a TTH");
                    let tmp2 = tmp.clone();
                    let actual = tokio::task::spawn_blocking(move || dctk_hash::tth_of_file(&tmp2))
                        .await
                        .map_err(|e| ClientError::Transfer(e.to_string()))?
                        .map_err(|e| ClientError::Transfer(format!("validation read failed: {}", e)))?;
                    if actual != expected {
                        return Err(ClientError::Transfer("validation failed".into()));
                    }
                    debug!(id = %job.id, "content validated");
                }
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| ClientError::Transfer(format!("rename failed: {}", e)))?;
            }
            Ok(DownloadOutcome {
                content: None,
                size: offset,
            })
        }
        Sink::Ram(buf) => {
            let content = if job.is_filelist {
                tokio::task::spawn_blocking(move || bunzip(&buf))
                    .await
                    .map_err(|e| ClientError::Transfer(e.to_string()))?
                    .map_err(|e| ClientError::Transfer(format!("file list unpack failed: {}", e)))?
            } else {
                if whole_file && !job.skip_validation {
                    let expected = job.tth.expect("non-filelist download has a TTH");
                    let (actual, buf2) = tokio::task::spawn_blocking(move || {
                        (dctk_hash::tth_of_bytes(&buf), buf)
                    })
                    .await
                    .map_err(|e| ClientError::Transfer(e.to_string()))?;
                    if actual != expected {
                        return Err(ClientError::Transfer("validation failed".into()));
                    }
                    debug!(id = %job.id, "content validated");
                    buf2
                } else {
                    buf
                }
            };
            let size = offset;
            Ok(DownloadOutcome {
                content: Some(content),
                size,
            })
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn bunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn bunzip_file(tmp: &Path, dest: &Path) -> std::io::Result<()> {
    let src = std::fs::File::open(tmp)?;
    let mut dst = std::fs::File::create(dest)?;
    std::io::copy(&mut bzip2::read::BzDecoder::new(src), &mut dst)?;
    std::fs::remove_file(tmp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/downloads/test file.txt")),
            PathBuf::from("/downloads/test file.txt.tmp")
        );
    }

    #[test]
    fn test_conf_normalizes_length() {
        let conf = DownloadConf::new("peer", dctk_hash::tth_of_bytes(b"x"));
        assert_eq!(conf.length, -1);
        assert!(!conf.is_filelist);

        let conf = DownloadConf::file_list("peer", None);
        assert!(conf.is_filelist);
        assert!(conf.tth.is_none());
    }

    #[test]
    fn test_bunzip_roundtrip() {
        use std::io::Write;
        let mut enc =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
        enc.write_all(b"listing content").unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(bunzip(&packed).unwrap(), b"listing content");
    }
}
