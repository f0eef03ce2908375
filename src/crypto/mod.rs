//! AES and hash primitives used by encrypted container variants (spec §4.8,
//! §4.9). A single pure-Rust backend ships; [`Backend`] names the seam the
//! original's OpenSSL-AES-interface and OpenSSL-EVP backends would plug into
//! (see DESIGN.md).

pub mod aes;
pub mod hmac;
pub mod md5;
pub mod sha1;
pub mod sha2;

pub use aes::{Context, CryptMode, TweakedContext};
pub use hmac::hmac;

/// Marks which AES/hash implementation a `Context` was built from. Only
/// `PureRust` is inhabited; `OpenSslAesNi` and `OpenSslEvp` are the original's
/// other two build-time choices, named so a future backend has somewhere to
/// slot in without reshaping this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    PureRust,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::PureRust
    }
}
