use super::Pieces;
use crate::bencode::{decode, encode, BencodeValue};
use crate::error::{Result, TorrentError};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub type InfoHash = [u8; 20];

type Dict = BTreeMap<Vec<u8>, BencodeValue>;

/// One file of the torrent's logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub length: u64,
    /// Path segments relative to the torrent's directory, never pre-joined.
    pub path: Vec<String>,
}

/// Typed, validated metadata of a torrent. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Primary tracker URL
    pub announce: String,
    /// Alternate tracker URLs, flattened across tiers, deduplicated
    pub announce_list: Vec<String>,
    /// Suggested file name (single-file) or directory name (multi-file)
    pub name: String,
    /// Bytes per piece; only the last piece may be shorter
    pub piece_length: u64,
    pub pieces: Pieces,
    /// Files in stream order; a single-file torrent has exactly one
    pub files: Vec<TorrentFile>,
    /// Sum of all file lengths
    pub total_length: u64,
    /// SHA-1 of the canonical encoding of the `info` dictionary
    pub info_hash: InfoHash,
    /// Whether the torrent used the `files` layout
    pub multi_file: bool,
}

impl TorrentDescriptor {
    /// Decode and validate a `.torrent` buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value = decode(data)?;
        Ok(Self::from_value(&value)?)
    }

    pub fn from_value(value: &BencodeValue) -> std::result::Result<Self, TorrentError> {
        let root = value
            .as_dict()
            .ok_or_else(|| TorrentError::TypeMismatch("<root>".to_string()))?;

        let announce = required_str(root, "announce", "announce")?.to_string();
        let announce_list = parse_announce_list(root, &announce)?;

        let info_value = root
            .get(b"info".as_ref())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::TypeMismatch("info".to_string()))?;

        let name = required_str(info, "name", "info.name")?.to_string();
        validate_segment(&name)?;

        let piece_length = required_u64(info, "piece length", "info.piece length")?;
        if piece_length == 0 {
            return Err(TorrentError::InvalidValue {
                field: "info.piece length".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let pieces = Pieces::from_bytes(required_bytes(info, "pieces", "info.pieces")?)?;

        let (files, multi_file) = if info.contains_key(b"length".as_ref()) {
            let length = required_u64(info, "length", "info.length")?;
            (
                vec![TorrentFile {
                    length,
                    path: vec![name.clone()],
                }],
                false,
            )
        } else if info.contains_key(b"files".as_ref()) {
            (parse_files(info)?, true)
        } else {
            return Err(TorrentError::MissingField(
                "info.length or info.files".to_string(),
            ));
        };

        let total_length = files.iter().try_fold(0u64, |acc, f| acc.checked_add(f.length)).ok_or_else(|| {
            TorrentError::InvalidValue {
                field: "info.files".to_string(),
                reason: "total length overflows".to_string(),
            }
        })?;
        if total_length == 0 {
            return Err(TorrentError::InvalidValue {
                field: "info.length".to_string(),
                reason: "torrent holds no data".to_string(),
            });
        }

        let expected_pieces = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(TorrentError::InconsistentPieceTable(format!(
                "{} hashes for {} bytes at {} bytes per piece (expected {})",
                pieces.len(),
                total_length,
                piece_length,
                expected_pieces
            )));
        }

        // Hash the decoded `info` value as-is through the canonical encoder,
        // not the typed projection above.
        let info_hash = sha1_digest(&encode(info_value));

        Ok(Self {
            announce,
            announce_list,
            name,
            piece_length,
            pieces,
            files,
            total_length,
            info_hash,
            multi_file,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the final piece may be short.
    pub fn piece_len(&self, index: usize) -> Option<u64> {
        let count = self.piece_count();
        if index >= count {
            return None;
        }
        if index + 1 == count {
            Some(self.last_piece_length())
        } else {
            Some(self.piece_length)
        }
    }

    pub fn last_piece_length(&self) -> u64 {
        self.total_length - self.piece_length * (self.piece_count() as u64 - 1)
    }

    /// Offset of piece `index` within the logical byte stream.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    /// Every tracker URL, primary first, without duplicates.
    pub fn tracker_urls(&self) -> Vec<String> {
        std::iter::once(self.announce.clone())
            .chain(self.announce_list.iter().cloned())
            .collect()
    }

    /// Directory under `root` that holds the torrent's files.
    pub fn content_root(&self, root: &Path) -> PathBuf {
        if self.multi_file {
            root.join(&self.name)
        } else {
            root.to_path_buf()
        }
    }

    /// On-disk location of `file` when downloading into `root`.
    pub fn file_location(&self, root: &Path, file: &TorrentFile) -> PathBuf {
        let mut path = self.content_root(root);
        path.extend(&file.path);
        path
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

pub(crate) fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let hash = Sha1::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash);
    out
}

fn required<'a>(dict: &'a Dict, key: &str, field: &str) -> std::result::Result<&'a BencodeValue, TorrentError> {
    dict.get(key.as_bytes())
        .ok_or_else(|| TorrentError::MissingField(field.to_string()))
}

fn required_bytes<'a>(dict: &'a Dict, key: &str, field: &str) -> std::result::Result<&'a [u8], TorrentError> {
    required(dict, key, field)?
        .as_bytes()
        .ok_or_else(|| TorrentError::TypeMismatch(field.to_string()))
}

fn required_str<'a>(dict: &'a Dict, key: &str, field: &str) -> std::result::Result<&'a str, TorrentError> {
    std::str::from_utf8(required_bytes(dict, key, field)?)
        .map_err(|_| TorrentError::TypeMismatch(field.to_string()))
}

fn required_u64(dict: &Dict, key: &str, field: &str) -> std::result::Result<u64, TorrentError> {
    let value = required(dict, key, field)?
        .as_integer()
        .ok_or_else(|| TorrentError::TypeMismatch(field.to_string()))?;
    u64::try_from(value).map_err(|_| TorrentError::InvalidValue {
        field: field.to_string(),
        reason: format!("{} is negative", value),
    })
}

fn parse_announce_list(root: &Dict, announce: &str) -> std::result::Result<Vec<String>, TorrentError> {
    const FIELD: &str = "announce-list";

    let tiers = match root.get(FIELD.as_bytes()) {
        None => return Ok(Vec::new()),
        Some(value) => value
            .as_list()
            .ok_or_else(|| TorrentError::TypeMismatch(FIELD.to_string()))?,
    };

    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(announce);

    let mut urls = Vec::new();
    for tier in tiers {
        let tier = tier
            .as_list()
            .ok_or_else(|| TorrentError::TypeMismatch(FIELD.to_string()))?;
        for url in tier {
            let url = url
                .as_str()
                .ok_or_else(|| TorrentError::TypeMismatch(FIELD.to_string()))?;
            if seen.insert(url) {
                urls.push(url.to_string());
            }
        }
    }

    Ok(urls)
}

fn parse_files(info: &Dict) -> std::result::Result<Vec<TorrentFile>, TorrentError> {
    let entries = required(info, "files", "info.files")?
        .as_list()
        .ok_or_else(|| TorrentError::TypeMismatch("info.files".to_string()))?;

    if entries.is_empty() {
        return Err(TorrentError::InvalidValue {
            field: "info.files".to_string(),
            reason: "list is empty".to_string(),
        });
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let entry = entry
                .as_dict()
                .ok_or_else(|| TorrentError::TypeMismatch(format!("info.files[{}]", i)))?;

            let length = required_u64(entry, "length", &format!("info.files[{}].length", i))?;

            let path_field = format!("info.files[{}].path", i);
            let segments = required(entry, "path", &path_field)?
                .as_list()
                .ok_or_else(|| TorrentError::TypeMismatch(path_field.clone()))?;
            if segments.is_empty() {
                return Err(TorrentError::InvalidValue {
                    field: path_field,
                    reason: "path has no segments".to_string(),
                });
            }

            let path = segments
                .iter()
                .map(|segment| {
                    let segment = segment
                        .as_str()
                        .ok_or_else(|| TorrentError::TypeMismatch(path_field.clone()))?;
                    validate_segment(segment)?;
                    Ok(segment.to_string())
                })
                .collect::<std::result::Result<Vec<_>, TorrentError>>()?;

            Ok(TorrentFile { length, path })
        })
        .collect()
}

/// Reject segments that would escape the download directory.
fn validate_segment(segment: &str) -> std::result::Result<(), TorrentError> {
    let unsafe_segment = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if unsafe_segment {
        return Err(TorrentError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BittorrentError;

    fn info_dict(entries: Vec<(&str, BencodeValue)>) -> BencodeValue {
        entries.into_iter().collect()
    }

    fn torrent(info: BencodeValue) -> BencodeValue {
        vec![
            ("announce", BencodeValue::from("http://tracker.example/announce")),
            ("info", info),
        ]
        .into_iter()
        .collect()
    }

    fn single_file_info(length: i64, piece_length: i64, piece_count: usize) -> BencodeValue {
        info_dict(vec![
            ("name", "a.bin".into()),
            ("length", length.into()),
            ("piece length", piece_length.into()),
            ("pieces", vec![7u8; 20 * piece_count].into()),
        ])
    }

    #[test]
    fn test_single_file_descriptor() {
        let value = torrent(single_file_info(25, 10, 3));
        let descriptor = TorrentDescriptor::from_bytes(&encode(&value)).unwrap();

        assert_eq!(descriptor.name, "a.bin");
        assert_eq!(descriptor.total_length, 25);
        assert_eq!(descriptor.piece_count(), 3);
        assert_eq!(descriptor.piece_len(0), Some(10));
        assert_eq!(descriptor.piece_len(2), Some(5));
        assert_eq!(descriptor.piece_len(3), None);
        assert_eq!(descriptor.last_piece_length(), 5);
        assert!(!descriptor.multi_file);
        assert_eq!(
            descriptor.files,
            vec![TorrentFile {
                length: 25,
                path: vec!["a.bin".to_string()]
            }]
        );
    }

    #[test]
    fn test_exact_multiple_has_full_last_piece() {
        let value = torrent(single_file_info(20, 10, 2));
        let descriptor = TorrentDescriptor::from_value(&value).unwrap();
        assert_eq!(descriptor.last_piece_length(), 10);
    }

    #[test]
    fn test_multi_file_descriptor() {
        let file = |length: i64, path: &[&str]| -> BencodeValue {
            info_dict(vec![
                ("length", length.into()),
                (
                    "path",
                    BencodeValue::List(path.iter().map(|s| BencodeValue::from(*s)).collect()),
                ),
            ])
        };
        let info = info_dict(vec![
            ("name", "album".into()),
            ("piece length", BencodeValue::Integer(8)),
            ("pieces", vec![0u8; 20].into()),
            (
                "files",
                BencodeValue::List(vec![file(5, &["cd1", "a.flac"]), file(3, &["b.txt"])]),
            ),
        ]);
        let descriptor = TorrentDescriptor::from_value(&torrent(info)).unwrap();

        assert!(descriptor.multi_file);
        assert_eq!(descriptor.total_length, 8);
        assert_eq!(descriptor.files[0].path, vec!["cd1", "a.flac"]);
        assert_eq!(
            descriptor.file_location(Path::new("/dl"), &descriptor.files[0]),
            PathBuf::from("/dl/album/cd1/a.flac")
        );
    }

    #[test]
    fn test_info_hash_is_sha1_of_canonical_info() {
        let info = single_file_info(25, 10, 3);
        let descriptor = TorrentDescriptor::from_value(&torrent(info.clone())).unwrap();
        assert_eq!(descriptor.info_hash, sha1_digest(&encode(&info)));
    }

    #[test]
    fn test_info_hash_keeps_unknown_info_keys() {
        let plain = single_file_info(25, 10, 3);
        let mut extended = plain.clone();
        if let BencodeValue::Dict(entries) = &mut extended {
            entries.insert(b"private".to_vec(), BencodeValue::Integer(1));
        }

        let a = TorrentDescriptor::from_value(&torrent(plain)).unwrap();
        let b = TorrentDescriptor::from_value(&torrent(extended)).unwrap();
        assert_ne!(a.info_hash, b.info_hash);
    }

    #[test]
    fn test_announce_list_flattened_and_deduplicated() {
        let mut value = torrent(single_file_info(25, 10, 3));
        let tiers = BencodeValue::List(vec![
            BencodeValue::List(vec!["http://b".into(), "http://tracker.example/announce".into()]),
            BencodeValue::List(vec!["http://c".into(), "http://b".into()]),
        ]);
        if let BencodeValue::Dict(entries) = &mut value {
            entries.insert(b"announce-list".to_vec(), tiers);
        }

        let descriptor = TorrentDescriptor::from_value(&value).unwrap();
        assert_eq!(descriptor.announce_list, vec!["http://b", "http://c"]);
        assert_eq!(
            descriptor.tracker_urls(),
            vec!["http://tracker.example/announce", "http://b", "http://c"]
        );
    }

    #[test]
    fn test_missing_fields() {
        let no_announce: BencodeValue =
            vec![("info", single_file_info(25, 10, 3))].into_iter().collect();
        assert_eq!(
            TorrentDescriptor::from_value(&no_announce).unwrap_err(),
            TorrentError::MissingField("announce".to_string())
        );

        let no_name = info_dict(vec![
            ("length", BencodeValue::Integer(25)),
            ("piece length", BencodeValue::Integer(10)),
            ("pieces", vec![0u8; 60].into()),
        ]);
        assert_eq!(
            TorrentDescriptor::from_value(&torrent(no_name)).unwrap_err(),
            TorrentError::MissingField("info.name".to_string())
        );

        let no_layout = info_dict(vec![
            ("name", "x".into()),
            ("piece length", BencodeValue::Integer(10)),
            ("pieces", vec![0u8; 60].into()),
        ]);
        assert!(matches!(
            TorrentDescriptor::from_value(&torrent(no_layout)),
            Err(TorrentError::MissingField(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let info = info_dict(vec![
            ("name", "x".into()),
            ("length", BencodeValue::Integer(25)),
            ("piece length", "ten".into()),
            ("pieces", vec![0u8; 60].into()),
        ]);
        assert_eq!(
            TorrentDescriptor::from_value(&torrent(info)).unwrap_err(),
            TorrentError::TypeMismatch("info.piece length".to_string())
        );
    }

    #[test]
    fn test_inconsistent_piece_table() {
        let ragged = info_dict(vec![
            ("name", "x".into()),
            ("length", BencodeValue::Integer(25)),
            ("piece length", BencodeValue::Integer(10)),
            ("pieces", vec![0u8; 59].into()),
        ]);
        assert!(matches!(
            TorrentDescriptor::from_value(&torrent(ragged)),
            Err(TorrentError::InconsistentPieceTable(_))
        ));

        let wrong_count = single_file_info(25, 10, 2);
        assert!(matches!(
            TorrentDescriptor::from_value(&torrent(wrong_count)),
            Err(TorrentError::InconsistentPieceTable(_))
        ));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let info = info_dict(vec![
            ("name", "album".into()),
            ("piece length", BencodeValue::Integer(8)),
            ("pieces", vec![0u8; 20].into()),
            (
                "files",
                BencodeValue::List(vec![info_dict(vec![
                    ("length", BencodeValue::Integer(8)),
                    ("path", BencodeValue::List(vec!["..".into(), "etc".into()])),
                ])]),
            ),
        ]);
        assert_eq!(
            TorrentDescriptor::from_value(&torrent(info)).unwrap_err(),
            TorrentError::InvalidPath("..".to_string())
        );
    }

    #[test]
    fn test_malformed_bencode_surfaces_as_bencode_error() {
        assert!(matches!(
            TorrentDescriptor::from_bytes(b"d8:announce"),
            Err(BittorrentError::Bencode(_))
        ));
    }
}
