use super::*;

#[test]
fn value_record_layout() -> Result<()> {
    let mut buf = Vec::new();
    encode_record(&LAYOUT, &kh(7), Some(b"abc"), &mut buf)?;

    assert_eq!(buf.len(), LAYOUT.encoded_len(Some(b"abc")));
    assert_eq!(buf.len(), 4 + 4 + 1 + 2 + 3);
    assert_eq!(&buf[4..8], &kh(7));
    assert_eq!(buf[8], KIND_VALUE);
    assert_eq!(&buf[9..11], &[3, 0], "length prefix is little-endian");
    assert_eq!(&buf[11..], b"abc");

    let crc = crc32fast::hash(&buf[4..]);
    assert_eq!(&buf[..4], &crc.to_le_bytes());
    Ok(())
}

#[test]
fn tombstone_has_no_length_or_payload() -> Result<()> {
    let mut buf = Vec::new();
    encode_record(&LAYOUT, &kh(7), None, &mut buf)?;
    assert_eq!(buf.len(), LAYOUT.header_size());
    assert_eq!(buf[8], KIND_TOMBSTONE);
    Ok(())
}

#[test]
fn encode_appends_to_existing_buffer() -> Result<()> {
    let mut buf = vec![0xAA; 3];
    encode_record(&LAYOUT, &kh(1), Some(b"x"), &mut buf)?;
    assert_eq!(&buf[..3], &[0xAA; 3]);
    assert_eq!(&buf[3..7], &crc32fast::hash(&buf[7..]).to_le_bytes());
    Ok(())
}

#[test]
fn value_longer_than_length_prefix_is_rejected() {
    let mut buf = Vec::new();
    let big = vec![0u8; 1 << 16];
    assert!(encode_record(&LAYOUT, &kh(1), Some(&big), &mut buf).is_err());
    assert!(encode_record(&LAYOUT, &kh(1), Some(&big[1..]), &mut buf).is_ok());
}

#[test]
fn wrong_key_width_is_rejected() {
    let mut buf = Vec::new();
    assert!(encode_record(&LAYOUT, &[1, 2], Some(b"v"), &mut buf).is_err());
}

#[test]
fn max_value_len_follows_prefix_width() {
    assert_eq!(ValueLayout::new(4, 1).max_value_len(), 255);
    assert_eq!(ValueLayout::new(4, 4).max_value_len(), u32::MAX as u64);
    assert_eq!(ValueLayout::new(4, 8).max_value_len(), u64::MAX);
}

#[test]
fn layout_from_config() {
    let cfg = config::PartitionConfig::new("/tmp/p")
        .with_key_hash_size(16)
        .with_value_length_size(3);
    assert_eq!(ValueLayout::from_config(&cfg), ValueLayout::new(16, 3));
}
