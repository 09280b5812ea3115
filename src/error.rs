use thiserror::Error;

/// Failures while decoding bencoded input.
///
/// Positions are byte offsets into the input being decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("empty input")]
    EmptyInput,

    #[error("invalid token {byte:#04x} at byte {position}")]
    InvalidToken { byte: u8, position: usize },

    #[error("malformed string length prefix at byte {position}")]
    MalformedLength { position: usize },

    #[error("malformed integer at byte {position}")]
    MalformedInteger { position: usize },

    #[error("unterminated integer starting at byte {position}")]
    UnterminatedInteger { position: usize },

    #[error("unterminated list or dictionary starting at byte {position}")]
    UnterminatedContainer { position: usize },

    #[error("string at byte {position} declares {declared} bytes but only {available} remain")]
    TruncatedInput {
        position: usize,
        declared: usize,
        available: usize,
    },

    #[error("dictionary key at byte {position} is not a byte string")]
    NonStringKey { position: usize },

    #[error("duplicate dictionary key at byte {position}")]
    DuplicateKey { position: usize },

    #[error("nesting deeper than {limit} levels at byte {position}")]
    NestingTooDeep { limit: usize, position: usize },

    #[error("{remaining} trailing bytes after value ending at byte {position}")]
    TrailingData { position: usize, remaining: usize },
}

/// Failures while projecting a decoded value into a torrent descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TorrentError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("field '{0}' has the wrong type")]
    TypeMismatch(String),

    #[error("field '{field}' has an invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("piece table is inconsistent: {0}")]
    InconsistentPieceTable(String),

    #[error("unsafe file path segment {0:?}")]
    InvalidPath(String),
}

/// Failures of the piece store and its backing files.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("range [{offset}, +{length}) exceeds total length {total}")]
    RangeOutOfBounds { offset: u64, length: u64, total: u64 },

    #[error("piece index {index} out of range (piece count {piece_count})")]
    PieceIndexOutOfRange { index: usize, piece_count: usize },

    #[error("disk operation timed out: {0}")]
    Timeout(&'static str),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures local to one peer connection.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("remote does not speak the BitTorrent protocol")]
    ProtocolMismatch,

    #[error("remote info hash {0} does not match ours")]
    InfoHashMismatch(String),

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("piece index {index} out of range (piece count {piece_count})")]
    IndexOutOfRange { index: u32, piece_count: usize },

    #[error("bitfield is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("malformed message of type {id} with {length} payload bytes")]
    MalformedMessage { id: u8, length: usize },

    #[error("frame of {0} bytes exceeds the maximum message size")]
    FrameTooLarge(usize),

    #[error("block (index {index}, begin {begin}, length {length}) lies outside its piece")]
    InvalidBlock { index: u32, begin: u32, length: u32 },

    #[error("request (index {index}, begin {begin}, length {length}) overlaps one already queued")]
    OverlappingRequest { index: u32, begin: u32, length: u32 },

    #[error("remote already has {0} responses queued")]
    TooManyRequests(usize),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("Invalid torrent: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl BittorrentError {
    /// Disk failures on the shared piece store threaten the whole download
    /// and are escalated to the session instead of staying connection-local.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, BittorrentError::Storage(_))
    }
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
