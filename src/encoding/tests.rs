use crate::encoding::{
    self, Decode, Encode, EncodingError, MAX_BYTE_LEN, decode_vec, encode_to_vec, encode_vec,
};

#[test]
fn integers_are_little_endian_and_fixed_width() {
    let bytes = encode_to_vec(&0x0102_0304u32).unwrap();
    assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);

    let bytes = encode_to_vec(&-1i64).unwrap();
    assert_eq!(bytes, vec![0xFF; 8]);

    let (value, n) = u64::decode_from(&encode_to_vec(&u64::MAX).unwrap()).unwrap();
    assert_eq!(value, u64::MAX);
    assert_eq!(n, 8);
}

#[test]
fn byte_vectors_carry_length_prefix() {
    let bytes = encode_to_vec(&b"row".to_vec()).unwrap();
    assert_eq!(&bytes[..4], &3u32.to_le_bytes());
    assert_eq!(&bytes[4..], b"row");

    let (decoded, consumed) = <Vec<u8>>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, b"row");
    assert_eq!(consumed, 7);
}

#[test]
fn decode_rejects_truncated_buffers() {
    let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEof {
            needed: 8,
            available: 3
        }
    ));
}

#[test]
fn decode_rejects_length_bombs() {
    // A length prefix far past the limit must fail before allocating.
    let mut bytes = Vec::new();
    (MAX_BYTE_LEN + 1).encode_to(&mut bytes).unwrap();
    let err = <Vec<u8>>::decode_from(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn bool_rejects_garbage_bytes() {
    assert!(bool::decode_from(&[0]).unwrap().0 == false);
    assert!(bool::decode_from(&[1]).unwrap().0 == true);
    assert!(matches!(
        bool::decode_from(&[7]).unwrap_err(),
        EncodingError::InvalidBool(7)
    ));
}

#[test]
fn option_roundtrip() {
    let bytes = encode_to_vec(&Some(42u64)).unwrap();
    let (decoded, _) = <Option<u64>>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, Some(42));

    let bytes = encode_to_vec(&None::<u64>).unwrap();
    let (decoded, n) = <Option<u64>>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, None);
    assert_eq!(n, 1);
}

#[test]
fn sequences_roundtrip_and_report_consumed_bytes() {
    let items = vec![1u64, 2, 3];
    let mut bytes = Vec::new();
    encode_vec(&items, &mut bytes).unwrap();
    // Trailing garbage must not confuse the decoder.
    bytes.extend_from_slice(&[0xAA, 0xBB]);

    let (decoded, consumed) = decode_vec::<u64>(&bytes).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, 4 + 3 * 8);
}

#[test]
fn string_roundtrip_rejects_invalid_utf8() {
    let bytes = encode_to_vec(&"access_group".to_string()).unwrap();
    let (decoded, _) = String::decode_from(&bytes).unwrap();
    assert_eq!(decoded, "access_group");

    let mut bad = Vec::new();
    encoding::Encode::encode_to(&vec![0xFF, 0xFE], &mut bad).unwrap();
    assert!(matches!(
        String::decode_from(&bad).unwrap_err(),
        EncodingError::InvalidUtf8(_)
    ));
}
