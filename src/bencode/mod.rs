//! Bencode: the self-describing format of torrent files and tracker replies.

mod decoder;
mod encoder;
mod value;

pub use decoder::{decode, decode_prefix, MAX_DEPTH};
pub use encoder::{encode, encode_into};
pub use value::BencodeValue;
