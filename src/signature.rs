use anyhow::anyhow;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Authentication of security relevant packets (SYN, CLOSE, RESET, pings) is the lower layer's
///  business. This is the seam where it plugs in: The signature is appended to the serialized
///  packet and covers all bytes before it.
pub trait PacketSigner: Send + Sync {
    fn signature_len(&self) -> usize;

    fn sign(&self, data: &[u8]) -> Bytes;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

/// For sessions that authenticate every message themselves, or for testing
pub struct NoSignature;
impl PacketSigner for NoSignature {
    fn signature_len(&self) -> usize {
        0
    }

    fn sign(&self, _data: &[u8]) -> Bytes {
        Bytes::new()
    }

    fn verify(&self, _data: &[u8], signature: &[u8]) -> bool {
        signature.is_empty()
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 with a shared secret. This authenticates peers that share the secret, it does
///  not identify individual senders.
pub struct HmacSha256Signature {
    mac: HmacSha256,
}

impl HmacSha256Signature {
    pub const SIGNATURE_LEN: usize = 32;

    pub fn new(key: &[u8]) -> anyhow::Result<HmacSha256Signature> {
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| anyhow!("invalid signing key: {}", e))?;
        Ok(HmacSha256Signature { mac })
    }

    fn mac_over(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac
    }
}

impl PacketSigner for HmacSha256Signature {
    fn signature_len(&self) -> usize {
        Self::SIGNATURE_LEN
    }

    fn sign(&self, data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&self.mac_over(data).finalize().into_bytes())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        signature.len() == Self::SIGNATURE_LEN
            && self.mac_over(data).verify_slice(signature).is_ok()
    }
}
