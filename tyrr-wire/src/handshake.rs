use bytes::{BufMut, Bytes, BytesMut};

use tyrr_common::{InfoHash, PeerId};

/// 68-byte fixed frame exchanged before any length-prefixed message:
/// `<pstrlen><pstr><reserved><info_hash><peer_id>`.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    reserved: [u8; 8],
}

impl Handshake {
    const PSTRLEN: u8 = 19;
    const PSTR: &'static [u8; 19] = b"BitTorrent protocol";

    pub const LEN: usize = 68;

    /// All reserved bits zero; extension negotiation is not spoken.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(Self::LEN);
        bytes.put_u8(Self::PSTRLEN);
        bytes.put_slice(Self::PSTR);
        bytes.put_slice(&self.reserved);
        bytes.put_slice(self.info_hash.as_bytes());
        bytes.put_slice(self.peer_id.as_bytes());
        bytes.freeze()
    }

    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() != Self::LEN || src[0] != Self::PSTRLEN || &src[1..20] != Self::PSTR {
            return None;
        }
        let reserved: [u8; 8] = src.get(20..28)?.try_into().ok()?;
        let info_hash = InfoHash::from_slice(src.get(28..48)?)?;
        let peer_id = PeerId::from_slice(src.get(48..68)?)?;

        Some(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let h = Handshake::new(InfoHash::new([1; 20]), PeerId::new([2; 20]));
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), Handshake::LEN);

        let parsed = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.info_hash, h.info_hash);
        assert_eq!(parsed.peer_id, h.peer_id);
    }

    #[test]
    fn rejects_malformed() {
        let h = Handshake::new(InfoHash::new([1; 20]), PeerId::new([2; 20]));
        let mut bytes = h.to_bytes().to_vec();

        // wrong pstrlen
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_none());
        bytes[0] = 19;

        // wrong protocol string
        bytes[1] = b'b';
        assert!(Handshake::from_bytes(&bytes).is_none());

        // truncated
        assert!(Handshake::from_bytes(&h.to_bytes()[..67]).is_none());
    }
}
