use mesh_transport::PeerId;
use proptest::prelude::*;

proptest! {
    /// PeerId ordering is the lexicographic order of its bytes.
    #[test]
    fn order_matches_bytes(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
        let (pa, pb) = (PeerId::from_bytes(a), PeerId::from_bytes(b));
        prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
        prop_assert_eq!(pa == pb, a == b);
    }

    /// Display form parses back to the same id.
    #[test]
    fn text_form_is_lossless(bytes in any::<[u8; 16]>()) {
        let id = PeerId::from_bytes(bytes);
        let parsed: PeerId = id.to_string().parse().expect("parse");
        prop_assert_eq!(parsed, id);
        prop_assert_eq!(parsed.as_bytes(), bytes);
    }
}
