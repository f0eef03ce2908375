//! Pure-Rust AES: key schedule from runtime-derived GF(2^8) tables, and the
//! ECB/CBC/CCM/CFB/XTS mode wrappers over it (spec §4.8).

use std::sync::OnceLock;

use crate::error::{Result, VdiskError};

const BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMode {
    Encrypt,
    Decrypt,
}

struct Tables {
    sbox: [u8; 256],
    inv_sbox: [u8; 256],
    rcon: [u8; 15],
}

static TABLES: OnceLock<Tables> = OnceLock::new();

/// Builds the AES S-box from GF(2^8) exponent/log tables (FIPS 197 §5.1.1).
/// Called lazily on first use; idempotent since every caller derives the
/// same bytes from the same constants, so a benign race just repeats work.
fn tables() -> &'static Tables {
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 256];
        let mut log = [0u8; 256];
        let mut x: u8 = 1;
        for i in 0..255usize {
            exp[i] = x;
            log[x as usize] = i as u8;
            // multiply by generator 0x03 in GF(2^8), reducing by 0x11b
            let hi = x & 0x80;
            x <<= 1;
            if hi != 0 {
                x ^= 0x1b;
            }
            x ^= exp[i];
        }
        exp[255] = exp[0];

        let gf_mul_inv = |a: u8| -> u8 {
            if a == 0 {
                0
            } else {
                exp[(255 - log[a as usize] as u16) as usize % 255]
            }
        };

        let mut sbox = [0u8; 256];
        for i in 0..256usize {
            let inv = gf_mul_inv(i as u8);
            let mut s = inv;
            let mut rot = inv;
            for _ in 0..4 {
                rot = rot.rotate_left(1);
                s ^= rot;
            }
            sbox[i] = s ^ 0x63;
        }

        let mut inv_sbox = [0u8; 256];
        for (i, &b) in sbox.iter().enumerate() {
            inv_sbox[b as usize] = i as u8;
        }

        let mut rcon = [0u8; 15];
        let mut r: u8 = 1;
        rcon[1] = r;
        for i in 2..15 {
            let hi = r & 0x80;
            r <<= 1;
            if hi != 0 {
                r ^= 0x1b;
            }
            rcon[i] = r;
        }

        Tables { sbox, inv_sbox, rcon }
    })
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    for _ in 0..8 {
        if b & 1 != 0 {
            p ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    p
}

#[derive(Clone)]
struct KeySchedule {
    round_keys: Vec<[u8; 4]>,
    rounds: usize,
}

fn expand_key(key: &[u8]) -> KeySchedule {
    let t = tables();
    let nk = key.len() / 4;
    let rounds = nk + 6;
    let total_words = 4 * (rounds + 1);

    let mut w: Vec<[u8; 4]> = Vec::with_capacity(total_words);
    for chunk in key.chunks_exact(4) {
        w.push([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    for i in nk..total_words {
        let mut temp = w[i - 1];
        if i % nk == 0 {
            temp = [temp[1], temp[2], temp[3], temp[0]];
            for b in temp.iter_mut() {
                *b = t.sbox[*b as usize];
            }
            temp[0] ^= t.rcon[i / nk];
        } else if nk > 6 && i % nk == 4 {
            for b in temp.iter_mut() {
                *b = t.sbox[*b as usize];
            }
        }
        let prev = w[i - nk];
        w.push([
            prev[0] ^ temp[0],
            prev[1] ^ temp[1],
            prev[2] ^ temp[2],
            prev[3] ^ temp[3],
        ]);
    }

    KeySchedule { round_keys: w, rounds }
}

fn add_round_key(state: &mut [u8; 16], ks: &KeySchedule, round: usize) {
    for c in 0..4 {
        let w = ks.round_keys[round * 4 + c];
        for r in 0..4 {
            state[c * 4 + r] ^= w[r];
        }
    }
}

fn sub_bytes(state: &mut [u8; 16], sbox: &[u8; 256]) {
    for b in state.iter_mut() {
        *b = sbox[*b as usize];
    }
}

fn shift_rows(state: &mut [u8; 16]) {
    let s = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[c * 4 + r] = s[((c + r) % 4) * 4 + r];
        }
    }
}

fn inv_shift_rows(state: &mut [u8; 16]) {
    let s = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[c * 4 + r] = s[((c + 4 - r) % 4) * 4 + r];
        }
    }
}

fn mix_columns(state: &mut [u8; 16]) {
    for c in 0..4 {
        let col = [state[c * 4], state[c * 4 + 1], state[c * 4 + 2], state[c * 4 + 3]];
        state[c * 4] = gf_mul(col[0], 2) ^ gf_mul(col[1], 3) ^ col[2] ^ col[3];
        state[c * 4 + 1] = col[0] ^ gf_mul(col[1], 2) ^ gf_mul(col[2], 3) ^ col[3];
        state[c * 4 + 2] = col[0] ^ col[1] ^ gf_mul(col[2], 2) ^ gf_mul(col[3], 3);
        state[c * 4 + 3] = gf_mul(col[0], 3) ^ col[1] ^ col[2] ^ gf_mul(col[3], 2);
    }
}

fn inv_mix_columns(state: &mut [u8; 16]) {
    for c in 0..4 {
        let col = [state[c * 4], state[c * 4 + 1], state[c * 4 + 2], state[c * 4 + 3]];
        state[c * 4] = gf_mul(col[0], 14) ^ gf_mul(col[1], 11) ^ gf_mul(col[2], 13) ^ gf_mul(col[3], 9);
        state[c * 4 + 1] = gf_mul(col[0], 9) ^ gf_mul(col[1], 14) ^ gf_mul(col[2], 11) ^ gf_mul(col[3], 13);
        state[c * 4 + 2] = gf_mul(col[0], 13) ^ gf_mul(col[1], 9) ^ gf_mul(col[2], 14) ^ gf_mul(col[3], 11);
        state[c * 4 + 3] = gf_mul(col[0], 11) ^ gf_mul(col[1], 13) ^ gf_mul(col[2], 9) ^ gf_mul(col[3], 14);
    }
}

fn encrypt_block(ks: &KeySchedule, block: &mut [u8; 16]) {
    let t = tables();
    add_round_key(block, ks, 0);
    for round in 1..ks.rounds {
        sub_bytes(block, &t.sbox);
        shift_rows(block);
        mix_columns(block);
        add_round_key(block, ks, round);
    }
    sub_bytes(block, &t.sbox);
    shift_rows(block);
    add_round_key(block, ks, ks.rounds);
}

fn decrypt_block(ks: &KeySchedule, block: &mut [u8; 16]) {
    let t = tables();
    add_round_key(block, ks, ks.rounds);
    for round in (1..ks.rounds).rev() {
        inv_shift_rows(block);
        sub_bytes(block, &t.inv_sbox);
        add_round_key(block, ks, round);
        inv_mix_columns(block);
    }
    inv_shift_rows(block);
    sub_bytes(block, &t.inv_sbox);
    add_round_key(block, ks, 0);
}

fn xor16(a: &mut [u8; 16], b: &[u8]) {
    for i in 0..16 {
        a[i] ^= b[i];
    }
}

/// The non-tweaked block-cipher context: ECB/CBC/CCM/CFB.
pub struct Context {
    ks: KeySchedule,
    mode: CryptMode,
}

impl Context {
    pub fn new() -> Self {
        Context {
            ks: KeySchedule { round_keys: Vec::new(), rounds: 0 },
            mode: CryptMode::Encrypt,
        }
    }

    pub fn set_key(&mut self, mode: CryptMode, key: &[u8], key_bits: u32) -> Result<()> {
        match key_bits {
            128 | 192 | 256 => {}
            _ => return Err(VdiskError::bad_argument("AES key_bits must be 128/192/256")),
        }
        if key.len() * 8 != key_bits as usize {
            return Err(VdiskError::bad_argument("AES key length does not match key_bits"));
        }
        self.ks = expand_key(key);
        self.mode = mode;
        Ok(())
    }

    pub fn crypt_ecb(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        if input.len() != BLOCK || output.len() != BLOCK {
            return Err(VdiskError::bad_argument("AES ECB operates on exactly one 16-byte block"));
        }
        let mut block = [0u8; 16];
        block.copy_from_slice(input);
        match self.mode {
            CryptMode::Encrypt => encrypt_block(&self.ks, &mut block),
            CryptMode::Decrypt => decrypt_block(&self.ks, &mut block),
        }
        output.copy_from_slice(&block);
        Ok(())
    }

    /// `iv` is read, never written: the caller's buffer is left untouched
    /// even though some AES backends mutate it in place to chain calls.
    pub fn crypt_cbc(&self, iv: &[u8; 16], input: &[u8], output: &mut [u8]) -> Result<()> {
        if input.len() % BLOCK != 0 || output.len() != input.len() {
            return Err(VdiskError::bad_argument("AES CBC length must be a multiple of 16"));
        }
        let mut chain = *iv;
        match self.mode {
            CryptMode::Encrypt => {
                for (inb, outb) in input.chunks_exact(BLOCK).zip(output.chunks_exact_mut(BLOCK)) {
                    let mut block = [0u8; 16];
                    block.copy_from_slice(inb);
                    xor16(&mut block, &chain);
                    encrypt_block(&self.ks, &mut block);
                    outb.copy_from_slice(&block);
                    chain = block;
                }
            }
            CryptMode::Decrypt => {
                for (inb, outb) in input.chunks_exact(BLOCK).zip(output.chunks_exact_mut(BLOCK)) {
                    let mut block = [0u8; 16];
                    block.copy_from_slice(inb);
                    let next_chain = block;
                    decrypt_block(&self.ks, &mut block);
                    xor16(&mut block, &chain);
                    outb.copy_from_slice(&block);
                    chain = next_chain;
                }
            }
        }
        Ok(())
    }

    /// Simplified CTR-style keystream XOR, per spec: IV is built from the
    /// nonce and a one-byte counter that increments per 16-byte block. This
    /// is not authenticated CCM — no MAC is computed or checked.
    pub fn crypt_ccm(&self, nonce: &[u8], input: &[u8], output: &mut [u8]) -> Result<()> {
        if nonce.len() > 14 {
            return Err(VdiskError::bad_argument("AES CCM nonce must be at most 14 bytes"));
        }
        if output.len() != input.len() {
            return Err(VdiskError::bad_argument("AES CCM output length must match input"));
        }
        let l = 15 - nonce.len() - 1;
        let mut iv = [0u8; 16];
        iv[0] = l as u8;
        iv[1..1 + nonce.len()].copy_from_slice(nonce);
        // counter occupies the trailing byte(s); spec increments the low byte.
        let mut counter: u8 = 0;

        for (inb, outb) in input.chunks(BLOCK).zip(output.chunks_mut(BLOCK)) {
            let mut block = iv;
            block[15] = counter;
            let mut keystream = block;
            encrypt_block(&self.ks, &mut keystream);
            for i in 0..inb.len() {
                outb[i] = inb[i] ^ keystream[i];
            }
            counter = counter.wrapping_add(1);
        }
        Ok(())
    }

    /// CFB128: feeds the previous ciphertext block on encrypt, the previous
    /// input block on decrypt, back through the cipher as a keystream.
    pub fn crypt_cfb(&self, iv: &[u8; 16], input: &[u8], output: &mut [u8]) -> Result<()> {
        if output.len() != input.len() {
            return Err(VdiskError::bad_argument("AES CFB output length must match input"));
        }
        let mut feedback = *iv;
        match self.mode {
            CryptMode::Encrypt => {
                for (inb, outb) in input.chunks(BLOCK).zip(output.chunks_mut(BLOCK)) {
                    let mut keystream = feedback;
                    encrypt_block(&self.ks, &mut keystream);
                    for i in 0..inb.len() {
                        outb[i] = inb[i] ^ keystream[i];
                    }
                    feedback = [0u8; 16];
                    feedback[..inb.len()].copy_from_slice(outb);
                }
            }
            CryptMode::Decrypt => {
                for (inb, outb) in input.chunks(BLOCK).zip(output.chunks_mut(BLOCK)) {
                    let mut keystream = feedback;
                    encrypt_block(&self.ks, &mut keystream);
                    for i in 0..inb.len() {
                        outb[i] = inb[i] ^ keystream[i];
                    }
                    feedback = [0u8; 16];
                    feedback[..inb.len()].copy_from_slice(inb);
                }
            }
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// XTS tweaked-codebook context: two independent AES keys, one for the data
/// and one for the tweak (spec: NIST SP 800-38E, with ciphertext stealing).
pub struct TweakedContext {
    data: Context,
    tweak: Context,
    mode: CryptMode,
}

impl TweakedContext {
    pub fn new() -> Self {
        TweakedContext {
            data: Context::new(),
            tweak: Context::new(),
            mode: CryptMode::Encrypt,
        }
    }

    pub fn set_key(&mut self, mode: CryptMode, key1: &[u8], key2: &[u8], key_bits: u32) -> Result<()> {
        if key_bits != 128 && key_bits != 256 {
            return Err(VdiskError::bad_argument("XTS accepts only 128 or 256-bit keys"));
        }
        if key1.len() != key2.len() {
            return Err(VdiskError::bad_argument("XTS requires two equal-sized keys"));
        }
        self.data.set_key(mode, key1, key_bits)?;
        self.tweak.set_key(CryptMode::Encrypt, key2, key_bits)?;
        self.mode = mode;
        Ok(())
    }

    fn gf_double(t: &mut [u8; 16]) {
        let mut carry = 0u8;
        for b in t.iter_mut() {
            let new_carry = (*b & 0x80) >> 7;
            *b = (*b << 1) | carry;
            carry = new_carry;
        }
        if carry != 0 {
            t[0] ^= 0x87;
        }
    }

    pub fn crypt_xts(&self, tweak_seed: &[u8; 16], input: &[u8], output: &mut [u8]) -> Result<()> {
        if output.len() != input.len() {
            return Err(VdiskError::bad_argument("XTS output length must match input"));
        }
        if input.len() < BLOCK {
            return Err(VdiskError::bad_argument("XTS input must be at least one block"));
        }

        let mut tweak = *tweak_seed;
        self.tweak.crypt_ecb(&tweak, &mut tweak)?;

        let full_blocks = input.len() / BLOCK;
        let remainder = input.len() % BLOCK;
        let stealing = remainder != 0;
        let full_blocks_for_main_pass = if stealing { full_blocks - 1 } else { full_blocks };

        let mut saved_tweak = tweak;
        for i in 0..full_blocks_for_main_pass {
            let inb = &input[i * BLOCK..(i + 1) * BLOCK];
            let outb = &mut output[i * BLOCK..(i + 1) * BLOCK];
            let mut block = [0u8; 16];
            block.copy_from_slice(inb);
            xor16(&mut block, &tweak);
            match self.mode {
                CryptMode::Encrypt => self.data.crypt_ecb_block_inplace_encrypt(&mut block),
                CryptMode::Decrypt => self.data.crypt_ecb_block_inplace_decrypt(&mut block),
            }
            xor16(&mut block, &tweak);
            outb.copy_from_slice(&block);
            saved_tweak = tweak;
            Self::gf_double(&mut tweak);
        }

        if !stealing {
            return Ok(());
        }

        // Ciphertext stealing: for decryption, the penultimate block must use
        // the *next* tweak, so save/restore it around this step.
        let penultimate_tweak = if self.mode == CryptMode::Decrypt {
            let t = tweak;
            tweak = saved_tweak;
            Some(t)
        } else {
            None
        };

        let last_full_idx = full_blocks_for_main_pass;
        let tail_start = last_full_idx * BLOCK;
        let mut cc = [0u8; 16];
        cc.copy_from_slice(&input[tail_start..tail_start + BLOCK]);
        xor16(&mut cc, &tweak);
        match self.mode {
            CryptMode::Encrypt => self.data.crypt_ecb_block_inplace_encrypt(&mut cc),
            CryptMode::Decrypt => self.data.crypt_ecb_block_inplace_decrypt(&mut cc),
        }
        xor16(&mut cc, &tweak);

        let tail_tweak = penultimate_tweak.unwrap_or(saved_tweak);
        let tail_len = remainder;
        let tail_bytes = &input[tail_start + BLOCK..];
        let mut pp = cc;
        for i in 0..tail_len {
            output[tail_start + BLOCK + i] = pp[i];
            pp[i] = tail_bytes[i];
        }
        let mut dd = pp;
        xor16(&mut dd, &tail_tweak);
        match self.mode {
            CryptMode::Encrypt => self.data.crypt_ecb_block_inplace_encrypt(&mut dd),
            CryptMode::Decrypt => self.data.crypt_ecb_block_inplace_decrypt(&mut dd),
        }
        xor16(&mut dd, &tail_tweak);
        output[tail_start..tail_start + BLOCK].copy_from_slice(&dd);

        Ok(())
    }
}

impl Default for TweakedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    fn crypt_ecb_block_inplace_encrypt(&self, block: &mut [u8; 16]) {
        encrypt_block(&self.ks, block);
    }
    fn crypt_ecb_block_inplace_decrypt(&self, block: &mut [u8; 16]) {
        decrypt_block(&self.ks, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS 197 Appendix B: AES-128 test vector.
    #[test]
    fn aes128_ecb_matches_fips197_appendix_b() {
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let plaintext = [
            0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0, 0x37,
            0x07, 0x34,
        ];
        let expected = [
            0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a,
            0x0b, 0x32,
        ];
        let mut ctx = Context::new();
        ctx.set_key(CryptMode::Encrypt, &key, 128).unwrap();
        let mut out = [0u8; 16];
        ctx.crypt_ecb(&plaintext, &mut out).unwrap();
        assert_eq!(out, expected);

        let mut dec = Context::new();
        dec.set_key(CryptMode::Decrypt, &key, 128).unwrap();
        let mut back = [0u8; 16];
        dec.crypt_ecb(&out, &mut back).unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn cbc_roundtrip_does_not_mutate_caller_iv() {
        let key = [0u8; 16];
        let iv = [0x11u8; 16];
        let plaintext = [0x42u8; 32];

        let mut enc = Context::new();
        enc.set_key(CryptMode::Encrypt, &key, 128).unwrap();
        let mut ct = [0u8; 32];
        enc.crypt_cbc(&iv, &plaintext, &mut ct).unwrap();
        assert_eq!(iv, [0x11u8; 16]);

        let mut dec = Context::new();
        dec.set_key(CryptMode::Decrypt, &key, 128).unwrap();
        let mut pt = [0u8; 32];
        dec.crypt_cbc(&iv, &ct, &mut pt).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn cfb_roundtrip() {
        let key = [0x5Au8; 16];
        let iv = [0u8; 16];
        let plaintext = b"some CFB test message, 40 bytes!!!!!!!!";

        let mut enc = Context::new();
        enc.set_key(CryptMode::Encrypt, &key, 128).unwrap();
        let mut ct = vec![0u8; plaintext.len()];
        enc.crypt_cfb(&iv, plaintext, &mut ct).unwrap();

        let mut dec = Context::new();
        dec.set_key(CryptMode::Decrypt, &key, 128).unwrap();
        let mut pt = vec![0u8; plaintext.len()];
        dec.crypt_cfb(&iv, &ct, &mut pt).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn ccm_keystream_roundtrips_via_xor() {
        let key = [0x01u8; 16];
        let nonce = [0x02u8; 12];
        let plaintext = b"keystream roundtrip";

        let mut ctx = Context::new();
        ctx.set_key(CryptMode::Encrypt, &key, 128).unwrap();
        let mut ct = vec![0u8; plaintext.len()];
        ctx.crypt_ccm(&nonce, plaintext, &mut ct).unwrap();
        let mut pt = vec![0u8; plaintext.len()];
        ctx.crypt_ccm(&nonce, &ct, &mut pt).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn xts_roundtrip_with_ciphertext_stealing() {
        let key1 = [0x11u8; 16];
        let key2 = [0x22u8; 16];
        let tweak = [0u8; 16];
        // 17 bytes: one full block plus a one-byte tail forces stealing.
        let plaintext = [0x7Au8; 17];

        let mut enc = TweakedContext::new();
        enc.set_key(CryptMode::Encrypt, &key1, &key2, 128).unwrap();
        let mut ct = [0u8; 17];
        enc.crypt_xts(&tweak, &plaintext, &mut ct).unwrap();

        let mut dec = TweakedContext::new();
        dec.set_key(CryptMode::Decrypt, &key1, &key2, 128).unwrap();
        let mut pt = [0u8; 17];
        dec.crypt_xts(&tweak, &ct, &mut pt).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn xts_aligned_roundtrip_no_stealing() {
        let key1 = [0x33u8; 32];
        let key2 = [0x44u8; 32];
        let tweak = [0x01u8; 16];
        let plaintext = [0x5Cu8; 32];

        let mut enc = TweakedContext::new();
        enc.set_key(CryptMode::Encrypt, &key1, &key2, 256).unwrap();
        let mut ct = [0u8; 32];
        enc.crypt_xts(&tweak, &plaintext, &mut ct).unwrap();

        let mut dec = TweakedContext::new();
        dec.set_key(CryptMode::Decrypt, &key1, &key2, 256).unwrap();
        let mut pt = [0u8; 32];
        dec.crypt_xts(&tweak, &ct, &mut pt).unwrap();
        assert_eq!(pt, plaintext);
    }
}
