//! ADC token protocol: routing header, named params and message grammar.
//!
//! ADC lines are space-separated fields terminated by `|`. The first field
//! is a four-character `TXXX` where `T` selects the routing type and `XXX`
//! the command. Field text escapes space as `\s`, newline as `\n` and
//! backslash as `\\`. Identifiers (CID, PID) are base-32 of 24-byte values.

use crate::{ProtoError, ProtoResult};
use dctk_hash::{base32_decode, base32_encode, TigerHash};

/// Protocol feature names (announced with an `AD` prefix in `SUP`).
pub const FEATURE_BAS0: &str = "BAS0";
pub const FEATURE_BASE: &str = "BASE";
pub const FEATURE_TIGR: &str = "TIGR";
pub const FEATURE_BZIP: &str = "BZIP";
pub const FEATURE_ZLIG: &str = "ZLIG";

/// `STA` severity: success.
pub const SEV_OK: u8 = 0;
/// `STA` severity: recoverable warning.
pub const SEV_WARNING: u8 = 1;
/// `STA` severity: fatal.
pub const SEV_FATAL: u8 = 2;

/// `STA` code: requested file is not shared.
pub const CODE_FILE_NOT_AVAILABLE: u8 = 51;
/// `STA` code: no upload slots left.
pub const CODE_SLOTS_FULL: u8 = 53;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            // The line terminator cannot be represented inside a field.
            '|' => {}
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> ProtoResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            other => {
                return Err(ProtoError::InvalidMessage(format!(
                    "bad ADC escape: \\{:?}",
                    other
                )))
            }
        }
    }
    Ok(out)
}

/// Routing header of an ADC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdcRoute {
    /// `H`: client to hub.
    Hub,
    /// `I`: hub to client.
    Info,
    /// `B`: broadcast, carries the source SID.
    Broadcast { sid: String },
    /// `C`: direct client-client connection, no addressing.
    Client,
    /// `D`: directed through the hub.
    Direct { from: String, to: String },
    /// `E`: directed, echoed back to the sender.
    Echo { from: String, to: String },
    /// `F`: feature broadcast.
    Feature { sid: String, features: String },
    /// `U`: UDP datagram, carries the source CID.
    Udp { cid: String },
}

/// Search terms of an `SCH`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdcSearch {
    /// `TR`: exact content address.
    pub tth: Option<TigerHash>,
    /// `AN`: name substrings, all of which must match.
    pub name_terms: Vec<String>,
    /// `TO`: token echoed in results.
    pub token: Option<String>,
}

/// A single `RES` search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcSearchResult {
    /// `FN`: full logical path.
    pub path: String,
    /// `SI`: size in bytes.
    pub size: u64,
    /// `SL`: free upload slots.
    pub slot_avail: u32,
    /// `TO`: token of the originating search.
    pub token: Option<String>,
    /// `TR`: content address.
    pub tth: Option<TigerHash>,
}

/// An `STA` status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcStatus {
    pub severity: u8,
    pub code: u8,
    pub message: String,
}

impl AdcStatus {
    pub fn is_ok(&self) -> bool {
        self.severity == SEV_OK
    }
}

/// Command payload of an ADC message.
#[derive(Debug, Clone, PartialEq)]
pub enum AdcBody {
    /// `SUP`: feature negotiation.
    Sup {
        add: Vec<String>,
        remove: Vec<String>,
    },
    /// `SID`: hub-assigned session id.
    Sid { sid: String },
    /// `INF`: identity fields, two-letter keys.
    Inf { fields: Vec<(String, String)> },
    /// `GPA`: password challenge data.
    Gpa { data: Vec<u8> },
    /// `PAS`: password response, `Tiger(password || data)`.
    Pas { hash: Vec<u8> },
    /// `STA`: status/error report.
    Sta(AdcStatus),
    /// `MSG`: chat; `pm` carries the group SID for private messages.
    Msg { text: String, pm: Option<String> },
    /// `SCH`: search request.
    Sch(AdcSearch),
    /// `RES`: search result.
    Res(AdcSearchResult),
    /// `CTM`: connect to me.
    Ctm {
        protocol: String,
        port: u16,
        token: String,
    },
    /// `RCM`: reverse connect to me.
    Rcm { protocol: String, token: String },
    /// `QUI`: a client left the hub.
    Qui { sid: String },
    /// `GET`: request content; length −1 means "to the end".
    GetFile {
        query: String,
        start: u64,
        length: i64,
        compressed: bool,
    },
    /// `SND`: answer to `GET` with the true length.
    SendFile {
        query: String,
        start: u64,
        length: u64,
        compressed: bool,
    },
    /// Anything the codec does not recognize; dispatchers log and ignore.
    Unhandled { cmd: String, params: Vec<String> },
}

/// A decoded ADC message: routing plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AdcMessage {
    pub route: AdcRoute,
    pub body: AdcBody,
}

impl AdcMessage {
    pub fn new(route: AdcRoute, body: AdcBody) -> Self {
        Self { route, body }
    }

    /// Parse one line (without the trailing `|`).
    pub fn decode(line: &[u8]) -> ProtoResult<AdcMessage> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ProtoError::InvalidMessage("non-UTF-8 ADC line".into()))?;
        let mut fields = text.split(' ');
        let head = fields
            .next()
            .filter(|h| h.len() == 4)
            .ok_or_else(|| ProtoError::InvalidMessage(format!("bad ADC header: {}", text)))?;

        let kind = head.as_bytes()[0];
        let cmd = &head[1..];
        let mut next =
            || -> ProtoResult<&str> {
                fields.next().ok_or_else(|| {
                    ProtoError::InvalidMessage(format!("truncated ADC route: {}", text))
                })
            };
        let route = match kind {
            b'H' => AdcRoute::Hub,
            b'I' => AdcRoute::Info,
            b'C' => AdcRoute::Client,
            b'B' => AdcRoute::Broadcast {
                sid: next()?.to_string(),
            },
            b'D' => AdcRoute::Direct {
                from: next()?.to_string(),
                to: next()?.to_string(),
            },
            b'E' => AdcRoute::Echo {
                from: next()?.to_string(),
                to: next()?.to_string(),
            },
            b'F' => AdcRoute::Feature {
                sid: next()?.to_string(),
                features: next()?.to_string(),
            },
            b'U' => AdcRoute::Udp {
                cid: next()?.to_string(),
            },
            other => {
                return Err(ProtoError::InvalidMessage(format!(
                    "unknown ADC routing type: {}",
                    other as char
                )))
            }
        };

        let params: Vec<&str> = fields.collect();
        let body = decode_body(cmd, &params)?;
        Ok(AdcMessage { route, body })
    }

    /// Emit one line (without the trailing `|`).
    pub fn encode(&self) -> Vec<u8> {
        let (cmd, params) = encode_body(&self.body);
        let mut out = String::new();
        match &self.route {
            AdcRoute::Hub => out.push('H'),
            AdcRoute::Info => out.push('I'),
            AdcRoute::Client => out.push('C'),
            AdcRoute::Broadcast { sid } => {
                out.push('B');
                out.push_str(cmd);
                out.push(' ');
                out.push_str(sid);
                return finish(out, params);
            }
            AdcRoute::Direct { from, to } | AdcRoute::Echo { from, to } => {
                out.push(if matches!(self.route, AdcRoute::Direct { .. }) {
                    'D'
                } else {
                    'E'
                });
                out.push_str(cmd);
                out.push(' ');
                out.push_str(from);
                out.push(' ');
                out.push_str(to);
                return finish(out, params);
            }
            AdcRoute::Feature { sid, features } => {
                out.push('F');
                out.push_str(cmd);
                out.push(' ');
                out.push_str(sid);
                out.push(' ');
                out.push_str(features);
                return finish(out, params);
            }
            AdcRoute::Udp { cid } => {
                out.push('U');
                out.push_str(cmd);
                out.push(' ');
                out.push_str(cid);
                return finish(out, params);
            }
        }
        out.push_str(cmd);
        finish(out, params)
    }
}

fn finish(mut head: String, params: Vec<String>) -> Vec<u8> {
    for p in params {
        head.push(' ');
        head.push_str(&p);
    }
    head.into_bytes()
}

fn named<'a>(params: &[&'a str], key: &str) -> Option<&'a str> {
    params.iter().find_map(|p| p.strip_prefix(key))
}

fn decode_body(cmd: &str, params: &[&str]) -> ProtoResult<AdcBody> {
    let invalid = |what: &str| ProtoError::InvalidMessage(format!("bad ADC {}: {}", cmd, what));

    Ok(match cmd {
        "SUP" => {
            let mut add = Vec::new();
            let mut remove = Vec::new();
            for p in params {
                if let Some(f) = p.strip_prefix("AD") {
                    add.push(f.to_string());
                } else if let Some(f) = p.strip_prefix("RM") {
                    remove.push(f.to_string());
                }
            }
            AdcBody::Sup { add, remove }
        }
        "SID" => AdcBody::Sid {
            sid: params.first().ok_or_else(|| invalid("missing sid"))?.to_string(),
        },
        "INF" => {
            let mut fields = Vec::new();
            for p in params {
                let (key, value) = match (p.get(..2), p.get(2..)) {
                    (Some(k), Some(v)) if k.is_ascii() => (k, v),
                    _ => return Err(invalid("short field")),
                };
                fields.push((key.to_string(), unescape(value)?));
            }
            AdcBody::Inf { fields }
        }
        "GPA" => AdcBody::Gpa {
            data: base32_decode(params.first().ok_or_else(|| invalid("missing data"))?)
                .map_err(|e| invalid(&e.to_string()))?,
        },
        "PAS" => AdcBody::Pas {
            hash: base32_decode(params.first().ok_or_else(|| invalid("missing hash"))?)
                .map_err(|e| invalid(&e.to_string()))?,
        },
        "STA" => {
            let code = params.first().ok_or_else(|| invalid("missing code"))?;
            if code.len() != 3 || !code.is_ascii() {
                return Err(invalid("code must be three digits"));
            }
            let severity: u8 = code[..1].parse().map_err(|_| invalid("severity"))?;
            let code: u8 = code[1..].parse().map_err(|_| invalid("code"))?;
            let message = unescape(params.get(1).unwrap_or(&""))?;
            AdcBody::Sta(AdcStatus {
                severity,
                code,
                message,
            })
        }
        "MSG" => AdcBody::Msg {
            text: unescape(params.first().ok_or_else(|| invalid("missing text"))?)?,
            pm: named(params, "PM").map(String::from),
        },
        "SCH" => {
            let mut search = AdcSearch::default();
            for p in params {
                if let Some(v) = p.strip_prefix("TR") {
                    search.tth = Some(
                        TigerHash::from_base32(v).map_err(|e| invalid(&e.to_string()))?,
                    );
                } else if let Some(v) = p.strip_prefix("AN") {
                    search.name_terms.push(unescape(v)?);
                } else if let Some(v) = p.strip_prefix("TO") {
                    search.token = Some(v.to_string());
                }
            }
            AdcBody::Sch(search)
        }
        "RES" => AdcBody::Res(AdcSearchResult {
            path: unescape(named(params, "FN").ok_or_else(|| invalid("missing FN"))?)?,
            size: named(params, "SI")
                .ok_or_else(|| invalid("missing SI"))?
                .parse()
                .map_err(|_| invalid("SI"))?,
            slot_avail: named(params, "SL")
                .unwrap_or("0")
                .parse()
                .map_err(|_| invalid("SL"))?,
            token: named(params, "TO").map(String::from),
            tth: match named(params, "TR") {
                Some(v) => Some(TigerHash::from_base32(v).map_err(|e| invalid(&e.to_string()))?),
                None => None,
            },
        }),
        "CTM" => AdcBody::Ctm {
            protocol: params.first().ok_or_else(|| invalid("missing protocol"))?.to_string(),
            port: params
                .get(1)
                .ok_or_else(|| invalid("missing port"))?
                .parse()
                .map_err(|_| invalid("port"))?,
            token: params.get(2).ok_or_else(|| invalid("missing token"))?.to_string(),
        },
        "RCM" => AdcBody::Rcm {
            protocol: params.first().ok_or_else(|| invalid("missing protocol"))?.to_string(),
            token: params.get(1).ok_or_else(|| invalid("missing token"))?.to_string(),
        },
        "QUI" => AdcBody::Qui {
            sid: params.first().ok_or_else(|| invalid("missing sid"))?.to_string(),
        },
        "GET" => {
            if params.len() < 4 {
                return Err(invalid("truncated"));
            }
            AdcBody::GetFile {
                query: format!("{} {}", params[0], params[1]),
                start: params[2].parse().map_err(|_| invalid("start"))?,
                length: params[3].parse().map_err(|_| invalid("length"))?,
                compressed: params.get(4) == Some(&"ZL1"),
            }
        }
        "SND" => {
            if params.len() < 4 {
                return Err(invalid("truncated"));
            }
            AdcBody::SendFile {
                query: format!("{} {}", params[0], params[1]),
                start: params[2].parse().map_err(|_| invalid("start"))?,
                length: params[3].parse().map_err(|_| invalid("length"))?,
                compressed: params.get(4) == Some(&"ZL1"),
            }
        }
        _ => AdcBody::Unhandled {
            cmd: cmd.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        },
    })
}

fn encode_body(body: &AdcBody) -> (&'static str, Vec<String>) {
    match body {
        AdcBody::Sup { add, remove } => {
            let mut params = Vec::new();
            params.extend(add.iter().map(|f| format!("AD{}", f)));
            params.extend(remove.iter().map(|f| format!("RM{}", f)));
            ("SUP", params)
        }
        AdcBody::Sid { sid } => ("SID", vec![sid.clone()]),
        AdcBody::Inf { fields } => (
            "INF",
            fields
                .iter()
                .map(|(k, v)| format!("{}{}", k, escape(v)))
                .collect(),
        ),
        AdcBody::Gpa { data } => ("GPA", vec![base32_encode(data)]),
        AdcBody::Pas { hash } => ("PAS", vec![base32_encode(hash)]),
        AdcBody::Sta(sta) => (
            "STA",
            vec![
                format!("{}{:02}", sta.severity, sta.code),
                escape(&sta.message),
            ],
        ),
        AdcBody::Msg { text, pm } => {
            let mut params = vec![escape(text)];
            if let Some(sid) = pm {
                params.push(format!("PM{}", sid));
            }
            ("MSG", params)
        }
        AdcBody::Sch(search) => {
            let mut params = Vec::new();
            if let Some(tth) = &search.tth {
                params.push(format!("TR{}", tth));
            }
            for term in &search.name_terms {
                params.push(format!("AN{}", escape(term)));
            }
            if let Some(token) = &search.token {
                params.push(format!("TO{}", token));
            }
            ("SCH", params)
        }
        AdcBody::Res(res) => {
            let mut params = vec![
                format!("FN{}", escape(&res.path)),
                format!("SI{}", res.size),
                format!("SL{}", res.slot_avail),
            ];
            if let Some(token) = &res.token {
                params.push(format!("TO{}", token));
            }
            if let Some(tth) = &res.tth {
                params.push(format!("TR{}", tth));
            }
            ("RES", params)
        }
        AdcBody::Ctm {
            protocol,
            port,
            token,
        } => ("CTM", vec![protocol.clone(), port.to_string(), token.clone()]),
        AdcBody::Rcm { protocol, token } => ("RCM", vec![protocol.clone(), token.clone()]),
        AdcBody::Qui { sid } => ("QUI", vec![sid.clone()]),
        AdcBody::GetFile {
            query,
            start,
            length,
            compressed,
        } => {
            let mut params: Vec<String> = query.split(' ').map(String::from).collect();
            params.push(start.to_string());
            params.push(length.to_string());
            if *compressed {
                params.push("ZL1".to_string());
            }
            ("GET", params)
        }
        AdcBody::SendFile {
            query,
            start,
            length,
            compressed,
        } => {
            let mut params: Vec<String> = query.split(' ').map(String::from).collect();
            params.push(start.to_string());
            params.push(length.to_string());
            if *compressed {
                params.push("ZL1".to_string());
            }
            ("SND", params)
        }
        AdcBody::Unhandled { .. } => unreachable!("unhandled messages are never emitted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: AdcMessage) {
        let encoded = msg.encode();
        let decoded = AdcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg, "wire: {}", String::from_utf8_lossy(&encoded));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("a b\\c\nd"), "a\\sb\\\\c\\nd");
        assert_eq!(unescape("a\\sb\\\\c\\nd").unwrap(), "a b\\c\nd");
        assert!(unescape("dangling\\").is_err());
    }

    #[test]
    fn test_sup_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::Sup {
                add: vec![
                    FEATURE_BAS0.into(),
                    FEATURE_BASE.into(),
                    FEATURE_TIGR.into(),
                    FEATURE_BZIP.into(),
                    FEATURE_ZLIG.into(),
                ],
                remove: vec![],
            },
        ));
    }

    #[test]
    fn test_inf_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcRoute::Broadcast { sid: "AAAB".into() },
            AdcBody::Inf {
                fields: vec![
                    ("ID".into(), "A".repeat(39)),
                    ("NI".into(), "alice".into()),
                    ("DE".into(), "here to share".into()),
                    ("SS".into(), "1234".into()),
                ],
            },
        ));
    }

    #[test]
    fn test_transfer_roundtrips() {
        roundtrip(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::GetFile {
                query: "file TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into(),
                start: 0,
                length: -1,
                compressed: true,
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::SendFile {
                query: "file files.xml.bz2".into(),
                start: 0,
                length: 8_192,
                compressed: false,
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Client,
            AdcBody::Sta(AdcStatus {
                severity: SEV_WARNING,
                code: CODE_SLOTS_FULL,
                message: "Slots full".into(),
            }),
        ));
    }

    #[test]
    fn test_routing_roundtrips() {
        let tth = TigerHash::from_base32("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY").unwrap();
        roundtrip(AdcMessage::new(
            AdcRoute::Direct {
                from: "AAAB".into(),
                to: "AAAC".into(),
            },
            AdcBody::Ctm {
                protocol: "ADC/1.0".into(),
                port: 3000,
                token: "ABCDEFGHIJKLMNOP".into(),
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Direct {
                from: "AAAB".into(),
                to: "AAAC".into(),
            },
            AdcBody::Rcm {
                protocol: "ADC/1.0".into(),
                token: "ABCDEFGHIJKLMNOP".into(),
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Broadcast { sid: "AAAB".into() },
            AdcBody::Sch(AdcSearch {
                tth: Some(tth),
                name_terms: vec![],
                token: Some("ABCDEFGHIJKLMNOP".into()),
            }),
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Udp {
                cid: "A".repeat(39),
            },
            AdcBody::Res(AdcSearchResult {
                path: "/share/test file.txt".into(),
                size: 10_000,
                slot_avail: 3,
                token: Some("ABCDEFGHIJKLMNOP".into()),
                tth: Some(tth),
            }),
        ));
    }

    #[test]
    fn test_chat_roundtrips() {
        roundtrip(AdcMessage::new(
            AdcRoute::Broadcast { sid: "AAAB".into() },
            AdcBody::Msg {
                text: "hello hub\nsecond line".into(),
                pm: None,
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Echo {
                from: "AAAB".into(),
                to: "AAAC".into(),
            },
            AdcBody::Msg {
                text: "psst".into(),
                pm: Some("AAAB".into()),
            },
        ));
    }

    #[test]
    fn test_unknown_command_is_unhandled() {
        let msg = AdcMessage::decode(b"HCMD AAAB foo").unwrap();
        assert_eq!(
            msg.body,
            AdcBody::Unhandled {
                cmd: "CMD".into(),
                params: vec!["AAAB".into(), "foo".into()],
            }
        );
    }

    #[test]
    fn test_password_exchange_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcRoute::Info,
            AdcBody::Gpa {
                data: vec![1, 2, 3, 4, 5],
            },
        ));
        roundtrip(AdcMessage::new(
            AdcRoute::Hub,
            AdcBody::Pas {
                hash: vec![9u8; 24],
            },
        ));
    }
}
