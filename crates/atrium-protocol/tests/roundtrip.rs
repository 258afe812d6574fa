//! Property tests for the wire codec.
//!
//! These tests use `proptest` to generate random payload trees and verify
//! the round-trip law `decode(encode(kind, payload)) == (kind, payload)`
//! for every packet name, plus decoder totality on arbitrary byte noise.

use proptest::prelude::*;

use atrium_protocol::value::MAX_DEPTH;
use atrium_protocol::{Packet, PacketKind, PayloadValue};

/// Strategy that generates finite f64 values (NaN breaks `PartialEq`).
fn finite_f64() -> impl Strategy<Value = f64> {
    (-1_000_000_000i64..1_000_000_000i64).prop_map(|v| v as f64 * 0.001)
}

fn leaf_strategy() -> impl Strategy<Value = PayloadValue> {
    prop_oneof![
        Just(PayloadValue::Null),
        any::<bool>().prop_map(PayloadValue::Bool),
        any::<i64>().prop_map(PayloadValue::Int),
        finite_f64().prop_map(PayloadValue::Float),
        ".{0,32}".prop_map(PayloadValue::Str),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(PayloadValue::Bytes),
    ]
}

fn value_strategy() -> impl Strategy<Value = PayloadValue> {
    leaf_strategy().prop_recursive(
        4,  // levels deep (well inside MAX_DEPTH)
        64, // total nodes
        8,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(PayloadValue::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..8)
                    .prop_map(PayloadValue::Object),
            ]
        },
    )
}

fn kind_strategy() -> impl Strategy<Value = PacketKind> {
    (0..PacketKind::ALL.len()).prop_map(|i| PacketKind::ALL[i])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    #[test]
    fn decode_encode_is_identity(kind in kind_strategy(), payload in value_strategy()) {
        let packet = Packet::new(kind, payload);
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).expect("own encoding must decode");
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn encoding_is_deterministic(kind in kind_strategy(), payload in value_strategy()) {
        let packet = Packet::new(kind, payload);
        prop_assert_eq!(packet.encode(), packet.encode());
    }

    #[test]
    fn decoder_never_panics_on_noise(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        // Totality: arbitrary input either decodes or errors, never panics.
        let _ = Packet::decode(&bytes);
    }
}

#[test]
fn depth_limit_is_generous_enough_for_real_payloads() {
    // A snapshot nests entities -> record -> config -> values; give the
    // worst case plenty of headroom below the decoder limit.
    assert!(MAX_DEPTH >= 32);
}
