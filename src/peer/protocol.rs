use super::message::read_exact_or_closed;
use super::PeerId;
use crate::error::PeerError;
use crate::torrent::InfoHash;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING);
        // Reserved extension bits; we advertise none
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Parse the 67 bytes following a `pstrlen` byte of 19.
    fn from_body(body: &[u8; HANDSHAKE_LEN - 1]) -> Result<Self, PeerError> {
        if &body[..PROTOCOL_STRING.len()] != PROTOCOL_STRING {
            return Err(PeerError::ProtocolMismatch);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&body[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&body[47..67]);

        Ok(Self { info_hash, peer_id })
    }

    /// Read a handshake from the remote.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut pstrlen = [0u8; 1];
        read_exact_or_closed(reader, &mut pstrlen).await?;
        if pstrlen[0] as usize != PROTOCOL_STRING.len() {
            return Err(PeerError::ProtocolMismatch);
        }

        let mut body = [0u8; HANDSHAKE_LEN - 1];
        read_exact_or_closed(reader, &mut body).await?;
        Self::from_body(&body)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Check a remote handshake against ours.
    fn accept(&self, theirs: &Handshake) -> Result<(), PeerError> {
        if theirs.info_hash != self.info_hash {
            return Err(PeerError::InfoHashMismatch(hex::encode(theirs.info_hash)));
        }
        if theirs.peer_id == self.peer_id {
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }
}

/// Outbound side: speak first, then validate the reply.
pub async fn initiate<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ours.write_to(stream).await?;
    let theirs = Handshake::read_from(stream).await?;
    ours.accept(&theirs)?;
    Ok(theirs)
}

/// Inbound side: validate the remote's handshake before answering.
pub async fn respond<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = Handshake::read_from(stream).await?;
    ours.accept(&theirs)?;
    ours.write_to(stream).await?;
    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_handshake_serialization() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[tokio::test]
    async fn test_initiate_accepts_matching_peer() {
        let ours = Handshake::new([1u8; 20], [2u8; 20]);
        let mut reply = Handshake::new([1u8; 20], [3u8; 20]).to_bytes();
        // Reserved bits from the remote are ignored
        reply[25] = 0x10;

        let mut mock = Builder::new().write(&ours.to_bytes()).read(&reply).build();
        let theirs = initiate(&mut mock, &ours).await.unwrap();
        assert_eq!(theirs.peer_id, [3u8; 20]);
    }

    #[tokio::test]
    async fn test_respond_rejects_wrong_torrent_without_answering() {
        let ours = Handshake::new([1u8; 20], [2u8; 20]);
        let mut other = [1u8; 20];
        other[19] = 0;
        let theirs = Handshake::new(other, [3u8; 20]);

        let mut mock = Builder::new().read(&theirs.to_bytes()).build();
        assert!(matches!(
            respond(&mut mock, &ours).await,
            Err(PeerError::InfoHashMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_protocol_mismatch() {
        let ours = Handshake::new([1u8; 20], [2u8; 20]);

        let mut mock = Builder::new().read(b"\x04").build();
        assert!(matches!(
            respond(&mut mock, &ours).await,
            Err(PeerError::ProtocolMismatch)
        ));
    }

    #[tokio::test]
    async fn test_wrong_protocol_string() {
        let ours = Handshake::new([1u8; 20], [2u8; 20]);
        let mut bytes = ours.to_bytes();
        bytes[5] = b'X';

        let mut mock = Builder::new().write(&ours.to_bytes()).read(&bytes).build();
        assert!(matches!(
            initiate(&mut mock, &ours).await,
            Err(PeerError::ProtocolMismatch)
        ));
    }

    #[tokio::test]
    async fn test_self_connection() {
        let ours = Handshake::new([1u8; 20], [2u8; 20]);
        let mut mock = Builder::new().read(&ours.to_bytes()).build();
        assert!(matches!(
            respond(&mut mock, &ours).await,
            Err(PeerError::SelfConnection)
        ));
    }
}
