//! Search: outgoing requests, the responder answering hub searches from
//! the share tree, and the UDP listener for results from active peers.

use crate::client::{Inner, State};
use crate::events::{ClientEvent, SearchResult};
use crate::{ClientError, ClientResult};
use dctk_hash::TigerHash;
use dctk_proto::adc::{AdcBody, AdcMessage, AdcRoute, AdcSearch, AdcSearchResult};
use dctk_proto::conn::DELIMITER;
use dctk_proto::nmdc::{NmdcMessage, NmdcSearchQuery, NmdcSearchResult, SearchOrigin};
use dctk_proto::{Message, ProtoKind};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Most name-search hits we answer with.
const MAX_SEARCH_HITS: usize = 10;

/// Send a search to the hub. Exactly one of `tth`/`name` is set.
pub(crate) fn send_search(
    inner: &Arc<Inner>,
    st: &State,
    tth: Option<TigerHash>,
    name: Option<String>,
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
            AdcBody::Sch(AdcSearch {
                tth,
                name_terms: name
                    .map(|n| n.split_whitespace().map(String::from).collect())
                    .unwrap_or_default(),
                token: Some(inner.random_token()),
            }),
        )));
    } else {
        let origin = if inner.conf.is_passive {
            SearchOrigin::Passive {
                nick: inner.conf.nick.clone(),
            }
        } else {
            SearchOrigin::Active {
                ip: st
                    .local_ip
                    .clone()
                    .ok_or_else(|| ClientError::Transfer("local address unknown".into()))?,
                udp_port: inner.conf.udp_port,
            }
        };
        let query = match (tth, name) {
            (Some(tth), _) => NmdcSearchQuery::Tth(tth),
            (None, Some(name)) => NmdcSearchQuery::Name(name),
            (None, None) => {
                return Err(ClientError::Config("empty search".into()));
            }
        };
        hub.send(Message::Nmdc(NmdcMessage::Search { origin, query }));
    }
    Ok(())
}

/// Answer an incoming NMDC search from the share tree: over UDP to active
/// askers, through the hub to passive ones.
pub(crate) fn respond_nmdc(inner: &Arc<Inner>, origin: &SearchOrigin, query: &NmdcSearchQuery) {
    let (results, destination) = {
        let st = inner.state.lock();
        // Never answer our own searches.
        match origin {
            SearchOrigin::Passive { nick } if *nick == inner.conf.nick => return,
            SearchOrigin::Active { ip, udp_port }
                if st.local_ip.as_deref() == Some(ip.as_str())
                    && *udp_port == inner.conf.udp_port =>
            {
                return
            }
            _ => {}
        }

        let hits = find_hits(&st, query);
        let slot_avail = st.upload_slot_avail.max(0) as u32;
        let results: Vec<NmdcMessage> = hits
            .into_iter()
            .map(|(path, size, tth)| {
                NmdcMessage::SearchResult(NmdcSearchResult {
                    nick: inner.conf.nick.clone(),
                    path: path.replace('/', "\\"),
                    size: Some(size),
                    slot_avail,
                    slot_total: inner.conf.upload_slots,
                    tth: Some(tth),
                    hub_name: None,
                    hub_addr: inner.url.addr(),
                    target_nick: match origin {
                        SearchOrigin::Passive { nick } => Some(nick.clone()),
                        SearchOrigin::Active { .. } => None,
                    },
                })
            })
            .collect();

        let destination = match origin {
            SearchOrigin::Active { ip, udp_port } => Some(format!("{}:{}", ip, udp_port)),
            SearchOrigin::Passive { .. } => None,
        };
        if results.is_empty() {
            return;
        }
        match destination {
            Some(addr) => (results, Some(addr)),
            None => {
                if let Some(hub) = &st.hub {
                    for res in results {
                        hub.send(Message::Nmdc(res));
                    }
                }
                return;
            }
        }
    };

    if let Some(addr) = destination {
        for res in results {
            send_datagram(inner, &addr, &Message::Nmdc(res));
        }
    }
}

/// Answer an incoming ADC search.
pub(crate) fn respond_adc(inner: &Arc<Inner>, from_sid: &str, terms: &AdcSearch) {
    let st = inner.state.lock();
    if st.my_sid.as_deref() == Some(from_sid) {
        return;
    }

    let query = match (&terms.tth, terms.name_terms.is_empty()) {
        (Some(tth), _) => NmdcSearchQuery::Tth(*tth),
        (None, false) => NmdcSearchQuery::Name(terms.name_terms.join(" ")),
        (None, true) => return,
    };
    let hits = find_hits(&st, &query);
    if hits.is_empty() {
        return;
    }

    let slot_avail = st.upload_slot_avail.max(0) as u32;
    let peer = st
        .sid_to_nick
        .get(from_sid)
        .and_then(|nick| st.peers.get(nick));
    let udp_addr = peer.and_then(|p| {
        if p.is_passive {
            None
        } else {
            Some(format!("{}:{}", p.ip.clone()?, p.udp_port?))
        }
    });

    for (path, size, tth) in hits {
        let body = AdcBody::Res(AdcSearchResult {
            path: format!("/{}", path),
            size,
            slot_avail,
            token: terms.token.clone(),
            tth: Some(tth),
        });
        match &udp_addr {
            Some(addr) => {
                let msg = Message::Adc(AdcMessage::new(
                    AdcRoute::Udp {
                        cid: inner.cid.to_string(),
                    },
                    body,
                ));
                send_datagram(inner, addr, &msg);
            }
            None => {
                if let (Some(my_sid), Some(hub)) = (st.my_sid.clone(), &st.hub) {
                    hub.send(Message::Adc(AdcMessage::new(
                        AdcRoute::Direct {
                            from: my_sid,
                            to: from_sid.to_string(),
                        },
                        body,
                    )));
                }
            }
        }
    }
}

fn find_hits(st: &State, query: &NmdcSearchQuery) -> Vec<(String, u64, TigerHash)> {
    match query {
        NmdcSearchQuery::Tth(tth) => st
            .share
            .find_by_tth(*tth)
            .map(|f| vec![(f.share_path.clone(), f.size, f.tth)])
            .unwrap_or_default(),
        NmdcSearchQuery::Name(pattern) => {
            let terms: Vec<String> = pattern.split_whitespace().map(String::from).collect();
            if terms.is_empty() {
                return Vec::new();
            }
            st.share
                .search_name(&terms, MAX_SEARCH_HITS)
                .into_iter()
                .map(|f| (f.share_path.clone(), f.size, f.tth))
                .collect()
        }
    }
}

fn send_datagram(inner: &Arc<Inner>, addr: &str, msg: &Message) {
    let socket = inner.udp.lock().clone();
    let Some(socket) = socket else {
        debug!("no udp socket, dropping search result");
        return;
    };
    let target: std::net::SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            debug!(addr, error = %e, "bad search result address");
            return;
        }
    };
    let mut data = match msg {
        Message::Nmdc(m) => m.encode(),
        Message::Adc(m) => m.encode(),
    };
    data.push(DELIMITER);
    if let Err(e) = socket.try_send_to(&data, target) {
        debug!(addr, error = %e, "search result datagram failed");
    }
}

/// Receive `$SR`/`URES` datagrams and surface them as events.
pub(crate) async fn run_udp_listener(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, from) = match received {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        let mut data = &buf[..n];
        if data.last() == Some(&DELIMITER) {
            data = &data[..n - 1];
        }

        match inner.proto_kind() {
            ProtoKind::Nmdc => match NmdcMessage::decode(data) {
                Ok(NmdcMessage::SearchResult(res)) => handle_nmdc_result(&inner, res),
                Ok(other) => debug!(%from, ?other, "unexpected udp message"),
                Err(e) => debug!(%from, error = %e, "bad udp datagram"),
            },
            ProtoKind::Adc => match AdcMessage::decode(data) {
                Ok(AdcMessage {
                    route: AdcRoute::Udp { cid },
                    body: AdcBody::Res(res),
                }) => {
                    let nick = {
                        let st = inner.state.lock();
                        dctk_hash::base32_decode(&cid).ok().and_then(|raw| {
                            st.peers
                                .values()
                                .find(|p| p.client_id.as_deref() == Some(raw.as_slice()))
                                .map(|p| p.nick.clone())
                        })
                    };
                    match nick {
                        Some(nick) => handle_adc_result(&inner, &nick, res),
                        None => debug!(%from, cid = %cid, "result from unknown client id"),
                    }
                }
                Ok(other) => debug!(%from, ?other, "unexpected udp message"),
                Err(e) => debug!(%from, error = %e, "bad udp datagram"),
            },
        }
    }
}

pub(crate) fn handle_nmdc_result(inner: &Arc<Inner>, res: NmdcSearchResult) {
    inner.emit(ClientEvent::SearchResult(SearchResult {
        peer_nick: res.nick,
        path: res.path.replace('\\', "/"),
        size: res.size,
        tth: res.tth,
        slot_avail: res.slot_avail,
    }));
}

pub(crate) fn handle_adc_result(inner: &Arc<Inner>, nick: &str, res: AdcSearchResult) {
    inner.emit(ClientEvent::SearchResult(SearchResult {
        peer_nick: nick.to_string(),
        path: res.path,
        size: Some(res.size),
        tth: res.tth,
        slot_avail: res.slot_avail,
    }));
}
