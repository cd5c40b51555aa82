use super::*;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

#[test]
fn read_at_returns_record_at_pointer() -> Result<()> {
    let dir = tempdir()?;
    let (path, offsets) = write_log(dir.path(), "v", &[(1, Some("one")), (2, None), (3, Some("three"))])?;
    let reader = CurlyReader::open(&path, LAYOUT)?;

    let third = reader.read_at(offsets[2])?;
    assert_eq!(third.key_hash, kh(3));
    assert_eq!(third.value.as_deref(), Some(&b"three"[..]));
    assert!(reader.read_at(offsets[1])?.is_tombstone());
    assert_eq!(reader.read_at(0)?.value.as_deref(), Some(&b"one"[..]));
    Ok(())
}

#[test]
fn read_at_past_end_fails() -> Result<()> {
    let dir = tempdir()?;
    let (path, _) = write_log(dir.path(), "v", &[(1, Some("one"))])?;
    let reader = CurlyReader::open(&path, LAYOUT)?;
    assert!(reader.read_at(reader.file_len()).is_err());
    Ok(())
}

#[test]
fn iteration_yields_offsets_and_records() -> Result<()> {
    let dir = tempdir()?;
    let (path, offsets) = write_log(dir.path(), "v", &[(1, Some("a")), (9, None), (10, Some(""))])?;
    let all = read_all(&path)?;
    assert_eq!(
        all,
        vec![
            (offsets[0], 1, Some("a".to_string())),
            (offsets[1], 9, None),
            (offsets[2], 10, Some(String::new())),
        ]
    );
    Ok(())
}

#[test]
fn corrupted_payload_fails_crc() -> Result<()> {
    let dir = tempdir()?;
    let (path, offsets) = write_log(dir.path(), "v", &[(1, Some("hello")), (2, Some("world"))])?;

    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::Start(offsets[1] + 11))?;
    f.write_all(b"W")?;
    drop(f);

    let reader = CurlyReader::open(&path, LAYOUT)?;
    assert!(reader.read_at(offsets[0]).is_ok());
    let err = reader.read_at(offsets[1]).unwrap_err();
    assert!(format!("{:#}", err).contains("CRC32 mismatch"));

    let results: Vec<_> = CurlyIter::open(&path, LAYOUT)?.collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    Ok(())
}

#[test]
fn truncated_tail_is_an_error_not_eof() -> Result<()> {
    let dir = tempdir()?;
    let (path, _) = write_log(dir.path(), "v", &[(1, Some("hello")), (2, Some("world"))])?;
    let len = fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 2)?;

    let results: Vec<_> = CurlyIter::open(&path, LAYOUT)?.collect();
    assert_eq!(results.len(), 2);
    assert!(results[1].is_err());
    Ok(())
}

#[test]
fn unknown_kind_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("v");
    let mut buf = Vec::new();
    encode_record(&LAYOUT, &kh(1), None, &mut buf)?;
    buf[8] = 7;
    fs::write(&path, &buf)?;

    let reader = CurlyReader::open(&path, LAYOUT)?;
    assert!(reader.read_at(0).is_err());
    Ok(())
}

#[test]
fn out_of_order_file_is_rejected_by_iterator() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("v");
    let mut buf = Vec::new();
    encode_record(&LAYOUT, &kh(2), Some(b"b"), &mut buf)?;
    encode_record(&LAYOUT, &kh(1), Some(b"a"), &mut buf)?;
    fs::write(&path, &buf)?;

    let results: Vec<_> = CurlyIter::open(&path, LAYOUT)?.collect();
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    Ok(())
}

#[test]
fn reader_iter_restarts_from_beginning() -> Result<()> {
    let dir = tempdir()?;
    let (path, _) = write_log(dir.path(), "v", &[(1, Some("a")), (2, Some("b"))])?;
    let reader = CurlyReader::open(&path, LAYOUT)?;
    reader.read_at(12)?;
    assert_eq!(reader.iter()?.count(), 2);
    Ok(())
}
