use locality_coll::algs::wire::{
    WIRE_VERSION, WireBytes, WireIdentity, cast_slice, decode_records, decode_u64s,
    encode_u64s, expect_exact_len,
};
use locality_coll::config::{CollectiveTags, CommTag};
use locality_coll::locality_error::LocalityError;

#[test]
fn commtag_offset_wrap() {
    let t = CommTag::new(u16::MAX).offset(1);
    assert_eq!(t.as_u16(), 0);
}

#[test]
fn collective_tags_are_consecutive() {
    let tags = CollectiveTags::from_base(CommTag::new(0x100));
    let all = [
        tags.meta_sizes,
        tags.meta_data,
        tags.identity,
        tags.resolved_sizes,
        tags.resolved_data,
        tags.aggregate,
        tags.exchange,
        tags.scatter,
    ];
    for (i, t) in all.iter().enumerate() {
        assert_eq!(t.as_u16(), 0x100 + i as u16);
    }
    assert_eq!(all.len(), CollectiveTags::SPAN as usize);
}

#[test]
fn identity_is_little_endian_on_the_wire() {
    let id = [WireIdentity::new(3, 0x0102)];
    let bytes = cast_slice(&id);
    assert_eq!(bytes.len(), WireIdentity::SIZE);
    assert_eq!(&bytes[0..2], &WIRE_VERSION.to_le_bytes());
    assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
    assert_eq!(&bytes[8..16], &0x0102u64.to_le_bytes());
}

#[test]
fn counts_decode_from_raw_bytes() {
    let raw = encode_u64s(&[7, 0, u64::MAX]);
    let recs: Vec<WireBytes> = decode_records(1, &raw).unwrap();
    assert_eq!(recs[0].get(), 7);
    assert_eq!(decode_u64s(&raw).collect::<Vec<_>>(), vec![7, 0, u64::MAX]);
}

#[test]
fn expect_exact_len_err() {
    assert!(matches!(
        expect_exact_len(2, 3, 4),
        Err(LocalityError::LengthMismatch { peer: 2, expected: 4, actual: 3 })
    ));
    assert!(expect_exact_len(2, 4, 4).is_ok());
}
