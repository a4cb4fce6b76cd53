//! Property-based tests over the hashing and codec layers.

use dctk_hash::{tth_of_bytes, TigerHash, TreeHasher};
use dctk_proto::nmdc::{
    nmdc_key, nmdc_key_raw, NmdcMessage, NmdcSearchQuery, SearchOrigin, KEY_FORBIDDEN,
};
use dctk_proto::adc::{AdcBody, AdcMessage, AdcRoute, AdcSearch};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Nicks: no spaces, separators or entities.
fn arb_nick() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_]{1,12}"
}

/// Free chat text, including the characters the codec must escape.
fn arb_text() -> impl Strategy<Value = String> {
    "[ -~]{0,40}"
}

/// ADC field text: printable ASCII except the line terminator, which has
/// no escape in the token grammar.
fn arb_adc_text() -> impl Strategy<Value = String> {
    "[ -{}~]{0,40}"
}

fn arb_tth() -> impl Strategy<Value = TigerHash> {
    prop::array::uniform24(any::<u8>()).prop_map(TigerHash::new)
}

fn arb_nmdc_message() -> impl Strategy<Value = NmdcMessage> {
    prop_oneof![
        arb_nick().prop_map(|nick| NmdcMessage::MyNick { nick }),
        (any::<bool>(), 1u32..=0x7FFF)
            .prop_map(|(download, bet)| NmdcMessage::Direction { download, bet }),
        (arb_tth(), any::<u64>(), prop_oneof![Just(-1i64), 0i64..1_000_000], any::<bool>())
            .prop_map(|(tth, start, length, compressed)| NmdcMessage::GetFile {
                query: format!("file TTH/{}", tth),
                start,
                length,
                compressed,
            }),
        arb_text().prop_map(|message| NmdcMessage::Error { message }),
        (arb_nick(), arb_text())
            .prop_map(|(from, content)| NmdcMessage::PublicMessage { from, content }),
        (arb_nick(), arb_nick(), arb_text()).prop_map(|(to, from, content)| {
            NmdcMessage::PrivateMessage { to, from, content }
        }),
        (arb_nick(), arb_tth()).prop_map(|(nick, tth)| NmdcMessage::Search {
            origin: SearchOrigin::Passive { nick },
            query: NmdcSearchQuery::Tth(tth),
        }),
        arb_nick().prop_map(|nick| NmdcMessage::Quit { nick }),
    ]
}

fn arb_adc_message() -> impl Strategy<Value = AdcMessage> {
    let sid = "[A-Z2-7]{4}";
    prop_oneof![
        (sid, arb_adc_text()).prop_map(|(sid, text)| AdcMessage::new(
            AdcRoute::Broadcast { sid },
            AdcBody::Msg { text, pm: None },
        )),
        (sid, sid, arb_tth()).prop_map(|(from, to, tth)| AdcMessage::new(
            AdcRoute::Direct { from, to },
            AdcBody::Sch(AdcSearch {
                tth: Some(tth),
                name_terms: vec![],
                token: Some("TOKENTOKENTOKENT".into()),
            }),
        )),
        (arb_tth(), any::<u64>(), any::<bool>()).prop_map(|(tth, start, compressed)| {
            AdcMessage::new(
                AdcRoute::Client,
                AdcBody::GetFile {
                    query: format!("tthl TTH/{}", tth),
                    start,
                    length: -1,
                    compressed,
                },
            )
        }),
        sid.prop_map(|sid| AdcMessage::new(AdcRoute::Hub, AdcBody::Qui { sid })),
    ]
}

// ============================================================================
// Tiger tree properties
// ============================================================================

proptest! {
    /// The root never depends on how the input is partitioned.
    #[test]
    fn tth_partition_independent(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        chunk in 1usize..512,
    ) {
        let whole = tth_of_bytes(&data);
        let mut hasher = TreeHasher::new();
        for piece in data.chunks(chunk) {
            hasher.update(piece);
        }
        prop_assert_eq!(hasher.finalize(), whole);
    }

    /// Hashing is deterministic.
    #[test]
    fn tth_deterministic(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(tth_of_bytes(&data), tth_of_bytes(&data));
    }

    /// Base-32 text form round-trips.
    #[test]
    fn tth_base32_roundtrip(tth in arb_tth()) {
        let text = tth.to_string();
        prop_assert_eq!(text.len(), 39);
        prop_assert_eq!(TigerHash::from_base32(&text).unwrap(), tth);
    }
}

// ============================================================================
// Lock/key properties
// ============================================================================

proptest! {
    /// The raw key preserves length; the wire key never contains a
    /// forbidden byte.
    #[test]
    fn key_length_and_forbidden_bytes(
        lock in prop::collection::vec(any::<u8>(), 2..256)
    ) {
        prop_assert_eq!(nmdc_key_raw(&lock).len(), lock.len());
        for b in nmdc_key(&lock) {
            prop_assert!(!KEY_FORBIDDEN.contains(&b));
        }
    }
}

// ============================================================================
// Codec round-trips
// ============================================================================

proptest! {
    #[test]
    fn nmdc_roundtrip(msg in arb_nmdc_message()) {
        let encoded = msg.encode();
        let decoded = NmdcMessage::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn adc_roundtrip(msg in arb_adc_message()) {
        let encoded = msg.encode();
        let decoded = AdcMessage::decode(&encoded).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}

// ============================================================================
// Known vectors
// ============================================================================

#[test]
fn tth_vectors() {
    assert_eq!(
        tth_of_bytes(&[]).to_string(),
        "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"
    );
    assert_eq!(
        tth_of_bytes(&vec![b'A'; 10_000]).to_string(),
        "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"
    );
}

#[test]
fn key_of_reference_lock() {
    let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
    let key = nmdc_key(lock);
    assert!(!key.is_empty());
    // Deriving twice is stable.
    assert_eq!(key, nmdc_key(lock));
}
