//! SHA-256 and SHA-512 (FIPS 180-4): block-at-a-time `init`/`update`/
//! `finalize` (spec §4.9). SHA-512 leaves 16 trailing length bytes instead of
//! SHA-256's 8, and its length field is a 128-bit big-endian bit count (the
//! high 64 bits are always zero for any input this crate will ever see).

const SHA256_K: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4, 0xab1c5ed5,
    0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe, 0x9bdc06a7, 0xc19bf174,
    0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f, 0x4a7484aa, 0x5cb0a9dc, 0x76f988da,
    0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7, 0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967,
    0x27b70a85, 0x2e1b2138, 0x4d2c6dfc, 0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85,
    0xa2bfe8a1, 0xa81a664b, 0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070,
    0x19a4c116, 0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7, 0xc67178f2,
];

const SHA512_K: [u64; 80] = [
    0x428a2f98d728ae22, 0x7137449123ef65cd, 0xb5c0fbcfec4d3b2f, 0xe9b5dba58189dbbc,
    0x3956c25bf348b538, 0x59f111f1b605d019, 0x923f82a4af194f9b, 0xab1c5ed5da6d8118,
    0xd807aa98a3030242, 0x12835b0145706fbe, 0x243185be4ee4b28c, 0x550c7dc3d5ffb4e2,
    0x72be5d74f27b896f, 0x80deb1fe3b1696b1, 0x9bdc06a725c71235, 0xc19bf174cf692694,
    0xe49b69c19ef14ad2, 0xefbe4786384f25e3, 0x0fc19dc68b8cd5b5, 0x240ca1cc77ac9c65,
    0x2de92c6f592b0275, 0x4a7484aa6ea6e483, 0x5cb0a9dcbd41fbd4, 0x76f988da831153b5,
    0x983e5152ee66dfab, 0xa831c66d2db43210, 0xb00327c898fb213f, 0xbf597fc7beef0ee4,
    0xc6e00bf33da88fc2, 0xd5a79147930aa725, 0x06ca6351e003826f, 0x142929670a0e6e70,
    0x27b70a8546d22ffc, 0x2e1b21385c26c926, 0x4d2c6dfc5ac42aed, 0x53380d139d95b3df,
    0x650a73548baf63de, 0x766a0abb3c77b2a8, 0x81c2c92e47edaee6, 0x92722c851482353b,
    0xa2bfe8a14cf10364, 0xa81a664bbc423001, 0xc24b8b70d0f89791, 0xc76c51a30654be30,
    0xd192e819d6ef5218, 0xd69906245565a910, 0xf40e35855771202a, 0x106aa07032bbd1b8,
    0x19a4c116b8d2d0c8, 0x1e376c085141ab53, 0x2748774cdf8eeb99, 0x34b0bcb5e19b48a8,
    0x391c0cb3c5c95a63, 0x4ed8aa4ae3418acb, 0x5b9cca4f7763e373, 0x682e6ff3d6b2b8a3,
    0x748f82ee5defb2fc, 0x78a5636f43172f60, 0x84c87814a1f0ab72, 0x8cc702081a6439ec,
    0x90befffa23631e28, 0xa4506cebde82bde9, 0xbef9a3f7b2c67915, 0xc67178f2e372532b,
    0xca273eceea26619c, 0xd186b8c721c0c207, 0xeada7dd6cde0eb1e, 0xf57d4f7fee6ed178,
    0x06f067aa72176fba, 0x0a637dc5a2c898a6, 0x113f9804bef90dae, 0x1b710b35131c471b,
    0x28db77f523047d84, 0x32caab7b40c72493, 0x3c9ebe0a15c9bebc, 0x431d67c49c100d4c,
    0x4cc5d4becb3e42b6, 0x597f299cfc657e2a, 0x5fcb6fab3ad6faec, 0x6c44198c4a475817,
];

macro_rules! sha2_impl {
    ($name:ident, $word:ty, $block_len:expr, $out_len:expr, $len_field_bytes:expr, $k:expr, $k_len:expr,
     $h0:expr, $rounds:expr, $s0:expr, $s1:expr, $bs0:expr, $bs1:expr) => {
        #[derive(Clone)]
        pub struct $name {
            state: [$word; 8],
            buffer: [u8; $block_len],
            buffer_len: usize,
            total_len: u128,
        }

        impl $name {
            pub fn new() -> Self {
                $name {
                    state: $h0,
                    buffer: [0u8; $block_len],
                    buffer_len: 0,
                    total_len: 0,
                }
            }

            pub fn update(&mut self, mut data: &[u8]) {
                self.total_len += data.len() as u128;
                if self.buffer_len > 0 {
                    let need = $block_len - self.buffer_len;
                    let take = need.min(data.len());
                    self.buffer[self.buffer_len..self.buffer_len + take].copy_from_slice(&data[..take]);
                    self.buffer_len += take;
                    data = &data[take..];
                    if self.buffer_len == $block_len {
                        let block = self.buffer;
                        self.process_block(&block);
                        self.buffer_len = 0;
                    }
                }
                while data.len() >= $block_len {
                    let mut block = [0u8; $block_len];
                    block.copy_from_slice(&data[..$block_len]);
                    self.process_block(&block);
                    data = &data[$block_len..];
                }
                if !data.is_empty() {
                    self.buffer[..data.len()].copy_from_slice(data);
                    self.buffer_len = data.len();
                }
            }

            pub fn finalize(mut self) -> [u8; $out_len] {
                let bit_len = self.total_len * 8;
                let mut pad = [0x80u8];
                self.update(&pad);
                pad[0] = 0;
                while self.buffer_len != $block_len - $len_field_bytes {
                    self.update(&pad);
                }
                let len_bytes = bit_len.to_be_bytes();
                self.buffer[$block_len - $len_field_bytes..]
                    .copy_from_slice(&len_bytes[len_bytes.len() - $len_field_bytes..]);
                let block = self.buffer;
                self.process_block(&block);

                let mut out = [0u8; $out_len];
                let word_bytes = std::mem::size_of::<$word>();
                for (i, word) in self.state.iter().enumerate() {
                    let bytes = word.to_be_bytes();
                    let end = ((i + 1) * word_bytes).min($out_len);
                    let start = i * word_bytes;
                    if start >= $out_len {
                        break;
                    }
                    out[start..end].copy_from_slice(&bytes[..end - start]);
                }
                out
            }

            fn process_block(&mut self, block: &[u8; $block_len]) {
                let mut w = [0 as $word; $k_len];
                let word_bytes = std::mem::size_of::<$word>();
                for i in 0..16 {
                    let mut b = [0u8; 8];
                    b[8 - word_bytes..].copy_from_slice(&block[i * word_bytes..(i + 1) * word_bytes]);
                    w[i] = <$word>::from_be_bytes(b[8 - word_bytes..].try_into().unwrap());
                }
                for i in 16..$k_len {
                    let s0 = $s0(w[i - 15]);
                    let s1 = $s1(w[i - 2]);
                    w[i] = w[i - 16]
                        .wrapping_add(s0)
                        .wrapping_add(w[i - 7])
                        .wrapping_add(s1);
                }

                let mut h: [$word; 8] = self.state;
                for i in 0..$rounds {
                    let big_s1 = $bs1(h[4]);
                    let ch = (h[4] & h[5]) ^ (!h[4] & h[6]);
                    let temp1 = h[7]
                        .wrapping_add(big_s1)
                        .wrapping_add(ch)
                        .wrapping_add($k[i])
                        .wrapping_add(w[i]);
                    let big_s0 = $bs0(h[0]);
                    let maj = (h[0] & h[1]) ^ (h[0] & h[2]) ^ (h[1] & h[2]);
                    let temp2 = big_s0.wrapping_add(maj);
                    h[7] = h[6];
                    h[6] = h[5];
                    h[5] = h[4];
                    h[4] = h[3].wrapping_add(temp1);
                    h[3] = h[2];
                    h[2] = h[1];
                    h[1] = h[0];
                    h[0] = temp1.wrapping_add(temp2);
                }

                for i in 0..8 {
                    self.state[i] = self.state[i].wrapping_add(h[i]);
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

sha2_impl!(
    Sha256,
    u32,
    64,
    32,
    8,
    SHA256_K,
    64,
    [
        0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
    ],
    64,
    |x: u32| x.rotate_right(7) ^ x.rotate_right(18) ^ (x >> 3),
    |x: u32| x.rotate_right(17) ^ x.rotate_right(19) ^ (x >> 10),
    |x: u32| x.rotate_right(2) ^ x.rotate_right(13) ^ x.rotate_right(22),
    |x: u32| x.rotate_right(6) ^ x.rotate_right(11) ^ x.rotate_right(25)
);

sha2_impl!(
    Sha512,
    u64,
    128,
    64,
    16,
    SHA512_K,
    80,
    [
        0x6a09e667f3bcc908,
        0xbb67ae8584caa73b,
        0x3c6ef372fe94f82b,
        0xa54ff53a5f1d36f1,
        0x510e527fade682d1,
        0x9b05688c2b3e6c1f,
        0x1f83d9abfb41bd6b,
        0x5be0cd19137e2179,
    ],
    80,
    |x: u64| x.rotate_right(1) ^ x.rotate_right(8) ^ (x >> 7),
    |x: u64| x.rotate_right(19) ^ x.rotate_right(61) ^ (x >> 6),
    |x: u64| x.rotate_right(28) ^ x.rotate_right(34) ^ x.rotate_right(39),
    |x: u64| x.rotate_right(14) ^ x.rotate_right(18) ^ x.rotate_right(41)
);

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut h = Sha512::new();
    h.update(data);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(b: &[u8]) -> String {
        b.iter().map(|x| format!("{x:02x}")).collect()
    }

    #[test]
    fn sha256_empty_string() {
        assert_eq!(
            hex(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn sha256_abc() {
        assert_eq!(
            hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha512_empty_string() {
        assert_eq!(
            hex(&sha512(b"")),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }
}
