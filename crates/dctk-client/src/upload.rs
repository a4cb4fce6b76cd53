//! Uploads: answer a content request from the share, the cached file list
//! or a TTH-leaves stream, with slot accounting.

use crate::client::Inner;
use crate::{ClientError, ClientResult};
use dctk_hash::TigerHash;
use dctk_proto::adc::{self, AdcBody, AdcMessage, AdcRoute, AdcStatus};
use dctk_proto::conn::DcWriter;
use dctk_proto::nmdc::NmdcMessage;
use dctk_proto::{Message, ProtoKind};
use dctk_share::FILE_LIST_NAME;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Streaming chunk size.
const UPLOAD_CHUNK: usize = 1024 * 1024;

enum Source {
    /// The cached `files.xml.bz2`.
    Buffer(Arc<Vec<u8>>),
    /// A TTH-leaves stream.
    Bytes(Vec<u8>),
    /// A shared file, opened lazily after the answer is sent.
    File { path: PathBuf, seek: u64, len: u64 },
}

#[derive(Debug)]
enum Refusal {
    NoSlots,
    NotAvailable(String),
}

/// Serve one `GetFile`/`GET`. Refusals answer the peer and leave the
/// connection idle; stream failures propagate and fail the connection.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_upload<W>(
    inner: &Arc<Inner>,
    nick: &str,
    writer: &mut DcWriter<W>,
    query: &str,
    start: u64,
    length: i64,
    compressed: bool,
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    info!(peer = %nick, query, start, length, "upload requested");

    let resolved: Result<(Source, u64), Refusal> = {
        let mut st = inner.state.lock();
        let outcome = if st.upload_slot_avail <= 0 {
            Err(Refusal::NoSlots)
        } else {
            resolve_source(&st, query, start, length)
        };
        if outcome.is_ok() {
            st.upload_slot_avail -= 1;
        }
        outcome
    };

    let (source, len) = match resolved {
        Ok(pair) => pair,
        Err(Refusal::NoSlots) => {
            info!(peer = %nick, "upload refused: no slots available");
            let answer = match inner.proto_kind() {
                ProtoKind::Nmdc => Message::Nmdc(NmdcMessage::MaxedOut),
                ProtoKind::Adc => Message::Adc(AdcMessage::new(
                    AdcRoute::Client,
                    AdcBody::Sta(AdcStatus {
                        severity: adc::SEV_WARNING,
                        code: adc::CODE_SLOTS_FULL,
                        message: "Slots full".into(),
                    }),
                )),
            };
            writer.write_message(&answer).await?;
            return Ok(());
        }
        Err(Refusal::NotAvailable(reason)) => {
            info!(peer = %nick, reason = %reason, "upload refused");
            let answer = match inner.proto_kind() {
                ProtoKind::Nmdc => Message::Nmdc(NmdcMessage::Error {
                    message: "File Not Available".into(),
                }),
                ProtoKind::Adc => Message::Adc(AdcMessage::new(
                    AdcRoute::Client,
                    AdcBody::Sta(AdcStatus {
                        severity: adc::SEV_WARNING,
                        code: adc::CODE_FILE_NOT_AVAILABLE,
                        message: "File Not Available".into(),
                    }),
                )),
            };
            writer.write_message(&answer).await?;
            return Ok(());
        }
    };

    let zlib = compressed && !inner.conf.peer_disable_compression;
    let answer = match inner.proto_kind() {
        ProtoKind::Nmdc => Message::Nmdc(NmdcMessage::SendFile {
            query: query.to_string(),
            start,
            length: len,
            compressed: zlib,
        }),
        ProtoKind::Adc => Message::Adc(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::SendFile {
                query: query.to_string(),
                start,
                length: len,
                compressed: zlib,
            },
        )),
    };
    writer.write_message(&answer).await?;

    let result = stream_content(writer, source, len, zlib, cancel).await;
    {
        inner.state.lock().upload_slot_avail += 1;
    }
    match &result {
        Ok(()) => info!(peer = %nick, query, start, length = len, "upload finished"),
        Err(e) if !e.is_terminated() => warn!(peer = %nick, query, error = %e, "upload failed"),
        Err(_) => {}
    }
    result
}

fn resolve_source(
    st: &crate::client::State,
    query: &str,
    start: u64,
    length: i64,
) -> Result<(Source, u64), Refusal> {
    if query == format!("file {}", FILE_LIST_NAME) {
        if start != 0 || length != -1 {
            return Err(Refusal::NotAvailable(
                "file list seeking is not supported".into(),
            ));
        }
        let buffer = st.file_list.clone();
        let len = buffer.len() as u64;
        if len == 0 {
            return Err(Refusal::NotAvailable("share is not indexed yet".into()));
        }
        return Ok((Source::Buffer(buffer), len));
    }

    let (is_leaves, b32) = if let Some(rest) = query.strip_prefix("file TTH/") {
        (false, rest)
    } else if let Some(rest) = query.strip_prefix("tthl TTH/") {
        (true, rest)
    } else {
        return Err(Refusal::NotAvailable(format!("unsupported query: {}", query)));
    };
    let tth = TigerHash::from_base32(b32)
        .map_err(|_| Refusal::NotAvailable("malformed TTH".into()))?;
    let file = st
        .share
        .find_by_tth(tth)
        .ok_or_else(|| Refusal::NotAvailable("file does not exist".into()))?;

    if is_leaves {
        if start != 0 || length != -1 {
            return Err(Refusal::NotAvailable("tthl seeking is not supported".into()));
        }
        let bytes = file.leaves_bytes();
        let len = bytes.len() as u64;
        return Ok((Source::Bytes(bytes), len));
    }

    if start > file.size {
        return Err(Refusal::NotAvailable("start past end of file".into()));
    }
    let max_len = file.size - start;
    let len = if length == -1 {
        max_len
    } else {
        let wanted = length as u64;
        if wanted > max_len {
            return Err(Refusal::NotAvailable("length too big".into()));
        }
        wanted
    };
    Ok((
        Source::File {
            path: file.real_path.clone(),
            seek: start,
            len,
        },
        len,
    ))
}

async fn stream_content<W>(
    writer: &mut DcWriter<W>,
    source: Source,
    len: u64,
    zlib: bool,
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.set_sync_mode(true);
    if zlib {
        writer.enable_zlib();
    }
    writer.take_counter();

    let mut sent = 0u64;
    let mut last_sample = Instant::now();
    let mut sample = |sent: u64, writer: &mut DcWriter<W>| {
        let since = last_sample.elapsed();
        if since >= Duration::from_secs(1) {
            last_sample = Instant::now();
            let speed = writer.take_counter() as f64 / 1024.0 / since.as_secs_f64();
            debug!(sent, total = len, kib_per_s = speed, "sent");
        }
    };

    match source {
        Source::Buffer(data) => {
            for chunk in data.chunks(UPLOAD_CHUNK) {
                write_chunk(writer, chunk, cancel).await?;
                sent += chunk.len() as u64;
                sample(sent, writer);
            }
        }
        Source::Bytes(data) => {
            for chunk in data.chunks(UPLOAD_CHUNK) {
                write_chunk(writer, chunk, cancel).await?;
                sent += chunk.len() as u64;
                sample(sent, writer);
            }
        }
        Source::File { path, seek, len } => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ClientError::Transfer(format!("cannot open source: {}", e)))?;
            file.seek(std::io::SeekFrom::Start(seek))
                .await
                .map_err(|e| ClientError::Transfer(format!("seek failed: {}", e)))?;

            let mut buf = vec![0u8; UPLOAD_CHUNK];
            while sent < len {
                let want = ((len - sent) as usize).min(UPLOAD_CHUNK);
                let n = file
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| ClientError::Transfer(format!("read failed: {}", e)))?;
                if n == 0 {
                    return Err(ClientError::Transfer("source file truncated".into()));
                }
                write_chunk(writer, &buf[..n], cancel).await?;
                sent += n as u64;
                sample(sent, writer);
            }
        }
    }

    if zlib {
        writer.finish_zlib().await?;
    }
    writer.set_sync_mode(false);
    Ok(())
}

async fn write_chunk<W>(
    writer: &mut DcWriter<W>,
    chunk: &[u8],
    cancel: &CancellationToken,
) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Terminated),
        result = writer.write_binary(chunk) => Ok(result?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::State;
    use crate::ClientConfig;
    use dctk_share::{ShareDirectory, ShareFile, ShareTree};

    fn state_with_share() -> State {
        let conf = ClientConfig {
            nick: "up".into(),
            is_passive: true,
            ..Default::default()
        };
        let mut st = State::new_for_tests(&conf);
        let digest = dctk_hash::leaves_of_bytes(b"shared content");
        st.share = Arc::new(ShareTree {
            roots: vec![ShareDirectory {
                name: "share".into(),
                dirs: vec![],
                files: vec![ShareFile {
                    name: "f.txt".into(),
                    real_path: "/tmp/f.txt".into(),
                    share_path: "share/f.txt".into(),
                    size: 14,
                    tth: digest.root,
                    leaves: digest.leaves,
                }],
            }],
        });
        st.file_list = Arc::new(vec![1, 2, 3]);
        st
    }

    #[test]
    fn test_resolve_file_list() {
        let st = state_with_share();
        let (source, len) = resolve_source(&st, "file files.xml.bz2", 0, -1).unwrap();
        assert!(matches!(source, Source::Buffer(_)));
        assert_eq!(len, 3);

        // Seeking into the list is refused.
        assert!(resolve_source(&st, "file files.xml.bz2", 1, -1).is_err());
        assert!(resolve_source(&st, "file files.xml.bz2", 0, 2).is_err());
    }

    #[test]
    fn test_resolve_file_by_tth() {
        let st = state_with_share();
        let tth = dctk_hash::tth_of_bytes(b"shared content");
        let query = format!("file TTH/{}", tth);

        let (_, len) = resolve_source(&st, &query, 0, -1).unwrap();
        assert_eq!(len, 14);

        let (_, len) = resolve_source(&st, &query, 4, -1).unwrap();
        assert_eq!(len, 10);

        let (_, len) = resolve_source(&st, &query, 4, 5).unwrap();
        assert_eq!(len, 5);

        assert!(matches!(
            resolve_source(&st, &query, 4, 11),
            Err(Refusal::NotAvailable(_))
        ));
        assert!(matches!(
            resolve_source(&st, &query, 15, -1),
            Err(Refusal::NotAvailable(_))
        ));
    }

    #[test]
    fn test_resolve_leaves() {
        let st = state_with_share();
        let tth = dctk_hash::tth_of_bytes(b"shared content");
        let query = format!("tthl TTH/{}", tth);

        let (source, len) = resolve_source(&st, &query, 0, -1).unwrap();
        assert!(matches!(source, Source::Bytes(_)));
        assert_eq!(len, dctk_hash::HASH_SIZE as u64);

        assert!(resolve_source(&st, &query, 1, -1).is_err());
    }

    #[test]
    fn test_resolve_missing_file() {
        let st = state_with_share();
        let tth = dctk_hash::tth_of_bytes(b"not shared");
        assert!(matches!(
            resolve_source(&st, &format!("file TTH/{}", tth), 0, -1),
            Err(Refusal::NotAvailable(_))
        ));
    }
}
