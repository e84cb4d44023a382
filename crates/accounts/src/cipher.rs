//! Refresh-token cipher seam
//!
//! Envelope encryption of refresh tokens belongs to the deployment (a
//! KMS-backed implementation is injected in production). The coordinator
//! only ever sees this trait; ciphertext goes into the store, plaintext
//! exists transiently inside `get_access_token`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub trait TokenCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn open(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;
}

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Keyed stream cipher with an HMAC integrity tag, for development and
/// tests only. Production deployments inject an envelope cipher backed by
/// their KMS.
pub struct DevelopmentCipher {
    key: Vec<u8>,
}

impl DevelopmentCipher {
    pub fn new(key: &[u8]) -> Self {
        DevelopmentCipher { key: key.to_vec() }
    }

    fn keystream_block(&self, nonce: &[u8], counter: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(nonce);
        hasher.update(counter.to_be_bytes());
        hasher.finalize().into()
    }

    fn apply_keystream(&self, nonce: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for (counter, chunk) in data.chunks(32).enumerate() {
            let block = self.keystream_block(nonce, counter as u64);
            out.extend(chunk.iter().zip(block.iter()).map(|(a, b)| a ^ b));
        }
        out
    }

    fn tag(&self, nonce: &[u8], body: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("failed to create HMAC: {e}"))?;
        mac.update(nonce);
        mac.update(body);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl TokenCipher for DevelopmentCipher {
    fn seal(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        use rand::RngCore;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let body = self.apply_keystream(&nonce, plaintext);
        let tag = self.tag(&nonce, &body)?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn open(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce, rest) = ciphertext.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

        let expected = self.tag(nonce, body)?;
        if expected != tag {
            anyhow::bail!("ciphertext integrity check failed");
        }
        Ok(self.apply_keystream(nonce, body))
    }
}
