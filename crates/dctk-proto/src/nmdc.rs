//! NMDC text protocol: message grammar and the lock→key derivation.
//!
//! NMDC lines are ASCII, `|`-terminated. Commands begin with `$`; a line
//! without `$` is public chat. Free text travels with `$`, `|` and `&`
//! substituted by HTML-style entities.

use crate::{ProtoError, ProtoResult};
use dctk_hash::TigerHash;

/// Bytes that may never appear in an emitted key; they are substituted
/// with the ASCII string `/%DCN%03d%/` of their value.
pub const KEY_FORBIDDEN: &[u8] = &[0, 5, 36, 96, 124, 126];

/// Derive the raw key from lock bytes: same length as the lock.
///
/// `key[0] = lock[0] ^ lock[n-1] ^ lock[n-2] ^ 5`, then
/// `key[i] = lock[i] ^ lock[i-1]`.
pub fn nmdc_key_raw(lock: &[u8]) -> Vec<u8> {
    assert!(lock.len() >= 2, "lock must be at least 2 bytes");
    let n = lock.len();
    let mut key = vec![0u8; n];
    key[0] = lock[0] ^ lock[n - 1] ^ lock[n - 2] ^ 5;
    for i in 1..n {
        key[i] = lock[i] ^ lock[i - 1];
    }
    key
}

/// Derive the wire key from lock bytes, with forbidden bytes substituted.
pub fn nmdc_key(lock: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for &b in &nmdc_key_raw(lock) {
        if KEY_FORBIDDEN.contains(&b) {
            out.extend_from_slice(format!("/%DCN{:03}%/", b).as_bytes());
        } else {
            out.push(b);
        }
    }
    out
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('$', "&#36;")
        .replace('|', "&#124;")
}

fn unescape(s: &str) -> String {
    s.replace("&#124;", "|")
        .replace("&#36;", "$")
        .replace("&amp;", "&")
}

/// Where a search originated and how to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOrigin {
    /// Active requester: answer over UDP to `ip:udp_port`.
    Active { ip: String, udp_port: u16 },
    /// Passive requester: answer through the hub.
    Passive { nick: String },
}

/// What a search is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NmdcSearchQuery {
    /// Exact content address.
    Tth(TigerHash),
    /// Name substring; spaces travel as `$` on the wire.
    Name(String),
}

/// A `$SR` search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmdcSearchResult {
    pub nick: String,
    pub path: String,
    /// `None` for directory results.
    pub size: Option<u64>,
    pub slot_avail: u32,
    pub slot_total: u32,
    /// Filled for TTH results; otherwise the hub name travels instead.
    pub tth: Option<TigerHash>,
    pub hub_name: Option<String>,
    pub hub_addr: String,
    /// Present when the result is relayed through the hub to a passive
    /// requester; the hub strips it before delivery.
    pub target_nick: Option<String>,
}

/// A `$MyINFO` userlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmdcMyInfo {
    pub nick: String,
    pub description: String,
    /// Client tag without the angle brackets, e.g. `dctk V:0.1,M:A,H:1/0/0,S:2`.
    pub tag: Option<String>,
    pub connection: String,
    pub flag: u8,
    pub email: String,
    pub share_size: u64,
}

impl NmdcMyInfo {
    /// Passive peers advertise `M:P` in the tag.
    pub fn is_passive(&self) -> bool {
        self.tag.as_deref().is_some_and(|t| t.contains("M:P"))
    }
}

/// A decoded NMDC message.
#[derive(Debug, Clone, PartialEq)]
pub enum NmdcMessage {
    MyNick {
        nick: String,
    },
    Lock {
        lock: String,
        pk: String,
        reference: Option<String>,
    },
    Key {
        key: Vec<u8>,
    },
    Supports {
        features: Vec<String>,
    },
    Direction {
        download: bool,
        bet: u32,
    },
    /// `$ADCGET`: query is `file TTH/<b32>`, `file files.xml.bz2` or
    /// `tthl TTH/<b32>`; length −1 means "to the end".
    GetFile {
        query: String,
        start: u64,
        length: i64,
        compressed: bool,
    },
    /// `$ADCSND`: echoes the query with the true length.
    SendFile {
        query: String,
        start: u64,
        length: u64,
        compressed: bool,
    },
    Error {
        message: String,
    },
    MaxedOut,
    PrivateMessage {
        to: String,
        from: String,
        content: String,
    },
    PublicMessage {
        from: String,
        content: String,
    },
    Search {
        origin: SearchOrigin,
        query: NmdcSearchQuery,
    },
    SearchResult(NmdcSearchResult),
    ConnectToMe {
        target: String,
        ip: String,
        port: u16,
        secure: bool,
    },
    RevConnectToMe {
        from: String,
        to: String,
    },
    Quit {
        nick: String,
    },
    Hello {
        nick: String,
    },
    HubName {
        name: String,
    },
    MyInfo(NmdcMyInfo),
    OpList {
        nicks: Vec<String>,
    },
    BotList {
        nicks: Vec<String>,
    },
    UserCommand {
        raw: String,
    },
    GetPass,
    MyPass {
        password: String,
    },
    BadPass,
    ValidateDenide,
    ValidateNick {
        nick: String,
    },
    Version {
        version: String,
    },
    GetNickList,
    /// Empty line, sent periodically to keep the link alive.
    KeepAlive,
    /// Anything the codec does not recognize; dispatchers log and ignore.
    Unhandled {
        command: String,
        tail: String,
    },
}

fn bad(line: &str) -> ProtoError {
    ProtoError::InvalidMessage(format!("malformed NMDC line: {}", line))
}

fn split_nick_list(tail: &str) -> Vec<String> {
    tail.split("$$")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn join_nick_list(nicks: &[String]) -> String {
    let mut out = String::new();
    for n in nicks {
        out.push_str(n);
        out.push_str("$$");
    }
    out
}

impl NmdcMessage {
    /// Parse one line (without the trailing `|`).
    pub fn decode(line: &[u8]) -> ProtoResult<NmdcMessage> {
        if line.is_empty() {
            return Ok(NmdcMessage::KeepAlive);
        }
        if line[0] != b'$' {
            let text = String::from_utf8_lossy(line);
            // `<nick> text` is peer chat; anything else comes from the hub.
            if let Some(rest) = text.strip_prefix('<') {
                if let Some((nick, content)) = rest.split_once("> ") {
                    return Ok(NmdcMessage::PublicMessage {
                        from: nick.to_string(),
                        content: unescape(content),
                    });
                }
            }
            return Ok(NmdcMessage::PublicMessage {
                from: String::new(),
                content: unescape(&text),
            });
        }

        // `$Key` may carry arbitrary bytes; handle it before UTF-8 checks.
        if let Some(tail) = line.strip_prefix(b"$Key ".as_ref()) {
            return Ok(NmdcMessage::Key { key: tail.to_vec() });
        }

        let text = std::str::from_utf8(line)
            .map_err(|_| ProtoError::InvalidMessage("non-UTF-8 NMDC line".into()))?;
        let (command, tail) = match text[1..].split_once(' ') {
            Some((c, t)) => (c, t),
            None => (&text[1..], ""),
        };

        Ok(match command {
            "MyNick" => NmdcMessage::MyNick {
                nick: tail.to_string(),
            },
            "Lock" => {
                let (lock, rest) = tail.split_once(' ').ok_or_else(|| bad(text))?;
                let rest = rest.strip_prefix("Pk=").ok_or_else(|| bad(text))?;
                let (pk, reference) = match rest.split_once("Ref=") {
                    Some((p, r)) => (p.to_string(), Some(r.to_string())),
                    None => (rest.to_string(), None),
                };
                NmdcMessage::Lock {
                    lock: lock.to_string(),
                    pk,
                    reference,
                }
            }
            "Supports" => NmdcMessage::Supports {
                features: tail.split(' ').filter(|s| !s.is_empty()).map(String::from).collect(),
            },
            "Direction" => {
                let (dir, bet) = tail.split_once(' ').ok_or_else(|| bad(text))?;
                NmdcMessage::Direction {
                    download: dir.eq_ignore_ascii_case("download"),
                    bet: bet.parse().map_err(|_| bad(text))?,
                }
            }
            "ADCGET" => {
                let mut it = tail.split(' ');
                let kind = it.next().ok_or_else(|| bad(text))?;
                let ident = it.next().ok_or_else(|| bad(text))?;
                let start = it.next().ok_or_else(|| bad(text))?.parse().map_err(|_| bad(text))?;
                let length = it.next().ok_or_else(|| bad(text))?.parse().map_err(|_| bad(text))?;
                let compressed = it.next() == Some("ZL1");
                NmdcMessage::GetFile {
                    query: format!("{} {}", kind, ident),
                    start,
                    length,
                    compressed,
                }
            }
            "ADCSND" => {
                let mut it = tail.split(' ');
                let kind = it.next().ok_or_else(|| bad(text))?;
                let ident = it.next().ok_or_else(|| bad(text))?;
                let start = it.next().ok_or_else(|| bad(text))?.parse().map_err(|_| bad(text))?;
                let length = it.next().ok_or_else(|| bad(text))?.parse().map_err(|_| bad(text))?;
                let compressed = it.next() == Some("ZL1");
                NmdcMessage::SendFile {
                    query: format!("{} {}", kind, ident),
                    start,
                    length,
                    compressed,
                }
            }
            "Error" => NmdcMessage::Error {
                message: unescape(tail),
            },
            "MaxedOut" => NmdcMessage::MaxedOut,
            "To:" => {
                // $To: target From: sender $<sender> text
                let (to, rest) = tail.split_once(" From: ").ok_or_else(|| bad(text))?;
                let (from, rest) = rest.split_once(" $<").ok_or_else(|| bad(text))?;
                let (_, content) = rest.split_once("> ").ok_or_else(|| bad(text))?;
                NmdcMessage::PrivateMessage {
                    to: to.to_string(),
                    from: from.to_string(),
                    content: unescape(content),
                }
            }
            "Search" => decode_search(tail).ok_or_else(|| bad(text))?,
            "SR" => decode_search_result(tail).ok_or_else(|| bad(text))?,
            "ConnectToMe" => {
                let (target, addr) = tail.split_once(' ').ok_or_else(|| bad(text))?;
                let (ip, port) = addr.rsplit_once(':').ok_or_else(|| bad(text))?;
                let (port, secure) = match port.strip_suffix('S') {
                    Some(p) => (p, true),
                    None => (port, false),
                };
                NmdcMessage::ConnectToMe {
                    target: target.to_string(),
                    ip: ip.to_string(),
                    port: port.parse().map_err(|_| bad(text))?,
                    secure,
                }
            }
            "RevConnectToMe" => {
                let (from, to) = tail.split_once(' ').ok_or_else(|| bad(text))?;
                NmdcMessage::RevConnectToMe {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            "Quit" => NmdcMessage::Quit {
                nick: tail.to_string(),
            },
            "Hello" => NmdcMessage::Hello {
                nick: tail.to_string(),
            },
            "HubName" | "Hubname" => NmdcMessage::HubName {
                name: unescape(tail),
            },
            "MyINFO" => decode_my_info(tail).ok_or_else(|| bad(text))?,
            "OpList" => NmdcMessage::OpList {
                nicks: split_nick_list(tail),
            },
            "BotList" => NmdcMessage::BotList {
                nicks: split_nick_list(tail),
            },
            "UserCommand" => NmdcMessage::UserCommand {
                raw: tail.to_string(),
            },
            "GetPass" => NmdcMessage::GetPass,
            "MyPass" => NmdcMessage::MyPass {
                password: tail.to_string(),
            },
            "BadPass" => NmdcMessage::BadPass,
            "ValidateDenide" => NmdcMessage::ValidateDenide,
            "ValidateNick" => NmdcMessage::ValidateNick {
                nick: tail.to_string(),
            },
            "Version" => NmdcMessage::Version {
                version: tail.to_string(),
            },
            "GetNickList" => NmdcMessage::GetNickList,
            _ => NmdcMessage::Unhandled {
                command: command.to_string(),
                tail: tail.to_string(),
            },
        })
    }

    /// Emit one line (without the trailing `|`).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            NmdcMessage::MyNick { nick } => format!("$MyNick {}", nick).into_bytes(),
            NmdcMessage::Lock {
                lock,
                pk,
                reference,
            } => {
                let mut s = format!("$Lock {} Pk={}", lock, pk);
                if let Some(r) = reference {
                    s.push_str("Ref=");
                    s.push_str(r);
                }
                s.into_bytes()
            }
            NmdcMessage::Key { key } => {
                let mut out = b"$Key ".to_vec();
                out.extend_from_slice(key);
                out
            }
            NmdcMessage::Supports { features } => {
                format!("$Supports {}", features.join(" ")).into_bytes()
            }
            NmdcMessage::Direction { download, bet } => format!(
                "$Direction {} {}",
                if *download { "Download" } else { "Upload" },
                bet
            )
            .into_bytes(),
            NmdcMessage::GetFile {
                query,
                start,
                length,
                compressed,
            } => format!(
                "$ADCGET {} {} {}{}",
                query,
                start,
                length,
                if *compressed { " ZL1" } else { "" }
            )
            .into_bytes(),
            NmdcMessage::SendFile {
                query,
                start,
                length,
                compressed,
            } => format!(
                "$ADCSND {} {} {}{}",
                query,
                start,
                length,
                if *compressed { " ZL1" } else { "" }
            )
            .into_bytes(),
            NmdcMessage::Error { message } => format!("$Error {}", escape(message)).into_bytes(),
            NmdcMessage::MaxedOut => b"$MaxedOut".to_vec(),
            NmdcMessage::PrivateMessage { to, from, content } => {
                format!("$To: {} From: {} $<{}> {}", to, from, from, escape(content)).into_bytes()
            }
            NmdcMessage::PublicMessage { from, content } => {
                if from.is_empty() {
                    escape(content).into_bytes()
                } else {
                    format!("<{}> {}", from, escape(content)).into_bytes()
                }
            }
            NmdcMessage::Search { origin, query } => encode_search(origin, query).into_bytes(),
            NmdcMessage::SearchResult(res) => encode_search_result(res),
            NmdcMessage::ConnectToMe {
                target,
                ip,
                port,
                secure,
            } => format!(
                "$ConnectToMe {} {}:{}{}",
                target,
                ip,
                port,
                if *secure { "S" } else { "" }
            )
            .into_bytes(),
            NmdcMessage::RevConnectToMe { from, to } => {
                format!("$RevConnectToMe {} {}", from, to).into_bytes()
            }
            NmdcMessage::Quit { nick } => format!("$Quit {}", nick).into_bytes(),
            NmdcMessage::Hello { nick } => format!("$Hello {}", nick).into_bytes(),
            NmdcMessage::HubName { name } => format!("$HubName {}", escape(name)).into_bytes(),
            NmdcMessage::MyInfo(info) => encode_my_info(info),
            NmdcMessage::OpList { nicks } => {
                format!("$OpList {}", join_nick_list(nicks)).into_bytes()
            }
            NmdcMessage::BotList { nicks } => {
                format!("$BotList {}", join_nick_list(nicks)).into_bytes()
            }
            NmdcMessage::UserCommand { raw } => format!("$UserCommand {}", raw).into_bytes(),
            NmdcMessage::GetPass => b"$GetPass".to_vec(),
            NmdcMessage::MyPass { password } => format!("$MyPass {}", password).into_bytes(),
            NmdcMessage::BadPass => b"$BadPass".to_vec(),
            NmdcMessage::ValidateDenide => b"$ValidateDenide".to_vec(),
            NmdcMessage::ValidateNick { nick } => format!("$ValidateNick {}", nick).into_bytes(),
            NmdcMessage::Version { version } => format!("$Version {}", version).into_bytes(),
            NmdcMessage::GetNickList => b"$GetNickList".to_vec(),
            NmdcMessage::KeepAlive => Vec::new(),
            NmdcMessage::Unhandled { command, tail } => {
                if tail.is_empty() {
                    format!("${}", command).into_bytes()
                } else {
                    format!("${} {}", command, tail).into_bytes()
                }
            }
        }
    }
}

fn encode_search(origin: &SearchOrigin, query: &NmdcSearchQuery) -> String {
    let origin_s = match origin {
        SearchOrigin::Active { ip, udp_port } => format!("{}:{}", ip, udp_port),
        SearchOrigin::Passive { nick } => format!("Hub:{}", nick),
    };
    let query_s = match query {
        NmdcSearchQuery::Tth(tth) => format!("F?T?0?9?TTH:{}", tth),
        NmdcSearchQuery::Name(pattern) => {
            format!("F?T?0?1?{}", escape(pattern).replace(' ', "$"))
        }
    };
    format!("$Search {} {}", origin_s, query_s)
}

fn decode_search(tail: &str) -> Option<NmdcMessage> {
    let (origin_s, query_s) = tail.split_once(' ')?;
    let origin = if let Some(nick) = origin_s.strip_prefix("Hub:") {
        SearchOrigin::Passive {
            nick: nick.to_string(),
        }
    } else {
        let (ip, port) = origin_s.rsplit_once(':')?;
        SearchOrigin::Active {
            ip: ip.to_string(),
            udp_port: port.parse().ok()?,
        }
    };
    let parts: Vec<&str> = query_s.splitn(5, '?').collect();
    if parts.len() != 5 {
        return None;
    }
    let query = if parts[3] == "9" {
        let b32 = parts[4].strip_prefix("TTH:")?;
        NmdcSearchQuery::Tth(TigerHash::from_base32(b32).ok()?)
    } else {
        NmdcSearchQuery::Name(unescape(&parts[4].replace('$', " ")))
    };
    Some(NmdcMessage::Search { origin, query })
}

fn encode_search_result(res: &NmdcSearchResult) -> Vec<u8> {
    let mut s = format!("$SR {} {}", res.nick, escape(&res.path));
    s.push('\x05');
    if let Some(size) = res.size {
        s.push_str(&format!("{} ", size));
    }
    s.push_str(&format!("{}/{}", res.slot_avail, res.slot_total));
    s.push('\x05');
    match &res.tth {
        Some(tth) => s.push_str(&format!("TTH:{}", tth)),
        None => s.push_str(res.hub_name.as_deref().unwrap_or("")),
    }
    s.push_str(&format!(" ({})", res.hub_addr));
    if let Some(target) = &res.target_nick {
        s.push('\x05');
        s.push_str(target);
    }
    s.into_bytes()
}

fn decode_search_result(tail: &str) -> Option<NmdcMessage> {
    let mut segs = tail.split('\x05');
    let head = segs.next()?;
    let (nick, path) = head.split_once(' ')?;

    let slots_seg = segs.next()?;
    let (size, slots) = match slots_seg.split_once(' ') {
        Some((sz, sl)) => (Some(sz.parse().ok()?), sl),
        None => (None, slots_seg),
    };
    let (avail, total) = slots.split_once('/')?;

    let hub_seg = segs.next()?;
    let (hub_field, addr) = hub_seg.rsplit_once(" (")?;
    let hub_addr = addr.strip_suffix(')')?;
    let (tth, hub_name) = match hub_field.strip_prefix("TTH:") {
        Some(b32) => (Some(TigerHash::from_base32(b32).ok()?), None),
        None => (None, Some(hub_field.to_string())),
    };

    Some(NmdcMessage::SearchResult(NmdcSearchResult {
        nick: nick.to_string(),
        path: unescape(path),
        size,
        slot_avail: avail.parse().ok()?,
        slot_total: total.parse().ok()?,
        tth,
        hub_name,
        hub_addr: hub_addr.to_string(),
        target_nick: segs.next().map(String::from),
    }))
}

fn encode_my_info(info: &NmdcMyInfo) -> Vec<u8> {
    let mut desc = escape(&info.description);
    if let Some(tag) = &info.tag {
        desc.push('<');
        desc.push_str(tag);
        desc.push('>');
    }
    let mut out = format!("$MyINFO $ALL {} {}$ $", info.nick, desc).into_bytes();
    out.extend_from_slice(info.connection.as_bytes());
    out.push(info.flag);
    out.push(b'$');
    out.extend_from_slice(escape(&info.email).as_bytes());
    out.push(b'$');
    out.extend_from_slice(info.share_size.to_string().as_bytes());
    out.push(b'$');
    out
}

fn decode_my_info(tail: &str) -> Option<NmdcMessage> {
    let rest = tail.strip_prefix("$ALL ")?;
    let (nick, rest) = rest.split_once(' ')?;
    let mut segs = rest.split('$');

    let desc_seg = segs.next()?;
    let (description, tag) = match desc_seg.rfind('<') {
        Some(pos) if desc_seg.ends_with('>') => (
            unescape(&desc_seg[..pos]),
            Some(desc_seg[pos + 1..desc_seg.len() - 1].to_string()),
        ),
        _ => (unescape(desc_seg), None),
    };

    let _space = segs.next()?;
    let conn_seg = segs.next()?;
    let (connection, flag) = match conn_seg.as_bytes().split_last() {
        Some((last, head)) => (
            String::from_utf8_lossy(head).to_string(),
            *last,
        ),
        None => (String::new(), 0),
    };
    let email = unescape(segs.next()?);
    let share_seg = segs.next()?;
    let share_size = if share_seg.is_empty() {
        0
    } else {
        share_seg.parse().ok()?
    };

    Some(NmdcMessage::MyInfo(NmdcMyInfo {
        nick: nick.to_string(),
        description,
        tag,
        connection,
        flag,
        email,
        share_size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: NmdcMessage) {
        let encoded = msg.encode();
        let decoded = NmdcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg, "wire: {:?}", String::from_utf8_lossy(&encoded));
    }

    #[test]
    fn test_key_raw_length() {
        let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
        assert_eq!(nmdc_key_raw(lock).len(), lock.len());
    }

    #[test]
    fn test_key_has_no_forbidden_bytes() {
        let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
        let key = nmdc_key(lock);
        for b in key {
            assert!(!KEY_FORBIDDEN.contains(&b));
        }
    }

    #[test]
    fn test_key_substitution_format() {
        // A lock crafted so the XOR chain yields byte 5 at position 1.
        let lock = [b'A', b'A' ^ 5, b'B'];
        let key = nmdc_key(&lock);
        let text = String::from_utf8_lossy(&key);
        assert!(text.contains("/%DCN005%/"), "key: {:?}", text);
    }

    #[test]
    fn test_handshake_roundtrips() {
        roundtrip(NmdcMessage::MyNick {
            nick: "alice".into(),
        });
        roundtrip(NmdcMessage::Lock {
            lock: "EXTENDEDPROTOCOLABCABCABCABCABCABC".into(),
            pk: "DCPLUSPLUS0.777".into(),
            reference: Some("hub.example.com:411".into()),
        });
        roundtrip(NmdcMessage::Supports {
            features: vec!["MiniSlots".into(), "ADCGet".into(), "TTHF".into()],
        });
        roundtrip(NmdcMessage::Direction {
            download: true,
            bet: 12345,
        });
        roundtrip(NmdcMessage::Key {
            key: vec![0xB3, 0x01, b'C'],
        });
    }

    #[test]
    fn test_transfer_roundtrips() {
        roundtrip(NmdcMessage::GetFile {
            query: "file TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into(),
            start: 0,
            length: -1,
            compressed: true,
        });
        roundtrip(NmdcMessage::GetFile {
            query: "file files.xml.bz2".into(),
            start: 0,
            length: -1,
            compressed: false,
        });
        roundtrip(NmdcMessage::SendFile {
            query: "tthl TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into(),
            start: 0,
            length: 240,
            compressed: false,
        });
        roundtrip(NmdcMessage::MaxedOut);
        roundtrip(NmdcMessage::Error {
            message: "File Not Available".into(),
        });
    }

    #[test]
    fn test_chat_roundtrips() {
        roundtrip(NmdcMessage::PublicMessage {
            from: "alice".into(),
            content: "hello $ | world & co".into(),
        });
        roundtrip(NmdcMessage::PrivateMessage {
            to: "bob".into(),
            from: "alice".into(),
            content: "psst".into(),
        });
    }

    #[test]
    fn test_search_roundtrips() {
        let tth = TigerHash::from_base32("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY").unwrap();
        roundtrip(NmdcMessage::Search {
            origin: SearchOrigin::Active {
                ip: "10.0.0.1".into(),
                udp_port: 412,
            },
            query: NmdcSearchQuery::Tth(tth),
        });
        roundtrip(NmdcMessage::Search {
            origin: SearchOrigin::Passive {
                nick: "alice".into(),
            },
            query: NmdcSearchQuery::Name("test file".into()),
        });
        roundtrip(NmdcMessage::SearchResult(NmdcSearchResult {
            nick: "alice".into(),
            path: "share\\test file.txt".into(),
            size: Some(10_000),
            slot_avail: 2,
            slot_total: 5,
            tth: Some(tth),
            hub_name: None,
            hub_addr: "hub.example.com:411".into(),
            target_nick: None,
        }));
    }

    #[test]
    fn test_hub_roundtrips() {
        roundtrip(NmdcMessage::Hello {
            nick: "alice".into(),
        });
        roundtrip(NmdcMessage::HubName {
            name: "Test Hub".into(),
        });
        roundtrip(NmdcMessage::ConnectToMe {
            target: "bob".into(),
            ip: "10.0.0.1".into(),
            port: 3000,
            secure: false,
        });
        roundtrip(NmdcMessage::ConnectToMe {
            target: "bob".into(),
            ip: "10.0.0.1".into(),
            port: 3001,
            secure: true,
        });
        roundtrip(NmdcMessage::RevConnectToMe {
            from: "alice".into(),
            to: "bob".into(),
        });
        roundtrip(NmdcMessage::OpList {
            nicks: vec!["op1".into(), "op2".into()],
        });
        roundtrip(NmdcMessage::Quit {
            nick: "alice".into(),
        });
        roundtrip(NmdcMessage::MyInfo(NmdcMyInfo {
            nick: "alice".into(),
            description: "here to share".into(),
            tag: Some("dctk V:0.1,M:A,H:1/0/0,S:2".into()),
            connection: "Cable".into(),
            flag: 1,
            email: "a@example.com".into(),
            share_size: 1_234_567,
        }));
    }

    #[test]
    fn test_my_info_passive_flag() {
        let info = NmdcMyInfo {
            nick: "p".into(),
            description: String::new(),
            tag: Some("dctk V:0.1,M:P,H:1/0/0,S:2".into()),
            connection: "Cable".into(),
            flag: 1,
            email: String::new(),
            share_size: 0,
        };
        assert!(info.is_passive());
    }

    #[test]
    fn test_unknown_command_is_unhandled() {
        let msg = NmdcMessage::decode(b"$NickList alice$$bob$$").unwrap();
        assert_eq!(
            msg,
            NmdcMessage::Unhandled {
                command: "NickList".into(),
                tail: "alice$$bob$$".into(),
            }
        );
    }

    #[test]
    fn test_empty_line_is_keepalive() {
        assert_eq!(NmdcMessage::decode(b"").unwrap(), NmdcMessage::KeepAlive);
        assert!(NmdcMessage::KeepAlive.encode().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_key_length_and_forbidden_bytes(
            lock in proptest::collection::vec(proptest::prelude::any::<u8>(), 2..128)
        ) {
            let raw = nmdc_key_raw(&lock);
            proptest::prop_assert_eq!(raw.len(), lock.len());
            for b in nmdc_key(&lock) {
                proptest::prop_assert!(!KEY_FORBIDDEN.contains(&b));
            }
        }
    }
}
