//! Descriptors built from in-memory content, for tests.

use super::{sha1_digest, TorrentDescriptor};
use crate::bencode::{encode, BencodeValue};

fn piece_table(content: &[u8], piece_length: usize) -> Vec<u8> {
    content
        .chunks(piece_length)
        .flat_map(|piece| sha1_digest(piece))
        .collect()
}

fn wrap(info: BencodeValue) -> TorrentDescriptor {
    let torrent: BencodeValue = vec![
        ("announce", BencodeValue::from("http://tracker.test/announce")),
        ("info", info),
    ]
    .into_iter()
    .collect();
    TorrentDescriptor::from_bytes(&encode(&torrent)).unwrap()
}

/// Single-file torrent named `name` whose hashes match `content`.
pub fn single_file(name: &str, content: &[u8], piece_length: usize) -> TorrentDescriptor {
    wrap(
        vec![
            ("name", BencodeValue::from(name)),
            ("length", BencodeValue::Integer(content.len() as i64)),
            ("piece length", BencodeValue::Integer(piece_length as i64)),
            ("pieces", BencodeValue::Bytes(piece_table(content, piece_length))),
        ]
        .into_iter()
        .collect(),
    )
}

/// Multi-file torrent under directory `name`; files are named `f0`, `f1`, ...
/// and `content` is split across them by `lengths`.
pub fn multi_file(
    name: &str,
    lengths: &[u64],
    content: &[u8],
    piece_length: usize,
) -> TorrentDescriptor {
    assert_eq!(lengths.iter().sum::<u64>(), content.len() as u64);

    let files = lengths
        .iter()
        .enumerate()
        .map(|(i, &length)| -> BencodeValue {
            vec![
                ("length", BencodeValue::Integer(length as i64)),
                (
                    "path",
                    BencodeValue::List(vec![BencodeValue::from(format!("f{}", i).as_str())]),
                ),
            ]
            .into_iter()
            .collect()
        })
        .collect();

    wrap(
        vec![
            ("name", BencodeValue::from(name)),
            ("piece length", BencodeValue::Integer(piece_length as i64)),
            ("pieces", BencodeValue::Bytes(piece_table(content, piece_length))),
            ("files", BencodeValue::List(files)),
        ]
        .into_iter()
        .collect(),
    )
}

/// Deterministic, non-repeating-looking test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
