//! RFC 2104 HMAC, generic over any of the four block-based hashes (spec §4.9).

use super::md5::Md5;
use super::sha1::Sha1;
use super::sha2::{Sha256, Sha512};

/// A hash that buffers one block at a time and produces a fixed digest,
/// enough surface for HMAC's key/ipad/opad construction.
pub trait BlockHash: Clone {
    const BLOCK_LEN: usize;
    const OUTPUT_LEN: usize;

    fn new() -> Self;
    fn update(&mut self, data: &[u8]);
    fn finalize_into(self, out: &mut [u8]);
}

macro_rules! impl_block_hash {
    ($ty:ty, $block:expr, $out:expr) => {
        impl BlockHash for $ty {
            const BLOCK_LEN: usize = $block;
            const OUTPUT_LEN: usize = $out;

            fn new() -> Self {
                <$ty>::new()
            }
            fn update(&mut self, data: &[u8]) {
                <$ty>::update(self, data)
            }
            fn finalize_into(self, out: &mut [u8]) {
                out.copy_from_slice(&self.finalize());
            }
        }
    };
}

impl_block_hash!(Md5, 64, 16);
impl_block_hash!(Sha1, 64, 20);
impl_block_hash!(Sha256, 64, 32);
impl_block_hash!(Sha512, 128, 64);

/// `H((key ⊕ opad) ‖ H((key ⊕ ipad) ‖ msg))`: keys longer than one block are
/// hashed down first, shorter ones right-padded with zeros.
pub fn hmac<H: BlockHash>(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut key_block = vec![0u8; H::BLOCK_LEN];
    if key.len() > H::BLOCK_LEN {
        let mut h = H::new();
        h.update(key);
        let mut digest = vec![0u8; H::OUTPUT_LEN];
        h.finalize_into(&mut digest);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = vec![0u8; H::BLOCK_LEN];
    let mut opad = vec![0u8; H::BLOCK_LEN];
    for i in 0..H::BLOCK_LEN {
        ipad[i] = key_block[i] ^ 0x36;
        opad[i] = key_block[i] ^ 0x5c;
    }

    let mut inner = H::new();
    inner.update(&ipad);
    inner.update(msg);
    let mut inner_digest = vec![0u8; H::OUTPUT_LEN];
    inner.finalize_into(&mut inner_digest);

    let mut outer = H::new();
    outer.update(&opad);
    outer.update(&inner_digest);
    let mut out = vec![0u8; H::OUTPUT_LEN];
    outer.finalize_into(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(b: &[u8]) -> String {
        b.iter().map(|x| format!("{x:02x}")).collect()
    }

    // RFC 2202 test case 1.
    #[test]
    fn hmac_sha1_rfc2202_case1() {
        let key = [0x0bu8; 20];
        let msg = b"Hi There";
        let mac = hmac::<Sha1>(&key, msg);
        assert_eq!(hex(&mac), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    #[test]
    fn hmac_md5_rfc2202_case1() {
        let key = [0x0bu8; 16];
        let msg = b"Hi There";
        let mac = hmac::<Md5>(&key, msg);
        assert_eq!(hex(&mac), "9294727a3638bb1c13f48ef8158bfc9d");
    }

    #[test]
    fn hmac_with_long_key_is_hashed_first() {
        let key = vec![0xAAu8; 200];
        let mac = hmac::<Sha256>(&key, b"msg");
        assert_eq!(mac.len(), 32);
    }
}
