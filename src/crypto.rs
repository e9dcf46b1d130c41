//! Encryption-at-rest primitive.
//!
//! Every block travels through an AES-256-CBC transform on its way to and
//! from the device. The scheme follows the on-disk format exactly: a zero
//! IV, no padding (block payloads are always a multiple of the AES block
//! size), and a key built by filling a 32-byte buffer with the password
//! bytes, padded with ASCII `'0'` when shorter and truncated when longer.
//!
//! Without a password the cipher is the identity transform.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES operates on 16-byte blocks; payloads must be a multiple of this.
const AES_BLOCK: usize = 16;

/// Length of the derived key in bytes (AES-256).
const KEY_LEN: usize = 32;

/// The symmetric transform applied to blocks on their way to and from the
/// device. Treats the payload as opaque bytes.
#[derive(Clone)]
pub struct Cipher {
    key: Option<[u8; KEY_LEN]>,
}

impl Cipher {
    /// Builds the cipher from the mount password. `None` or an empty
    /// password yields the identity transform.
    pub fn new(password: Option<&str>) -> Self {
        let key = password.filter(|p| !p.is_empty()).map(|p| {
            let mut key = [b'0'; KEY_LEN];
            let bytes = p.as_bytes();
            let n = usize::min(bytes.len(), KEY_LEN);
            key[..n].copy_from_slice(&bytes[..n]);
            key
        });
        Self { key }
    }

    /// Whether a password was supplied at mount time.
    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    /// Decrypts `buf` in place. Lengths that are not a multiple of the AES
    /// block size are left untouched.
    pub fn decrypt(&self, buf: &mut [u8]) {
        let Some(key) = &self.key else { return };
        if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
            return;
        }
        let iv = [0u8; AES_BLOCK];
        let _ = Aes256CbcDec::new(key.into(), (&iv).into()).decrypt_padded_mut::<NoPadding>(buf);
    }

    /// Encrypts `buf` in place. Lengths that are not a multiple of the AES
    /// block size are left untouched.
    pub fn encrypt(&self, buf: &mut [u8]) {
        let Some(key) = &self.key else { return };
        if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
            return;
        }
        let iv = [0u8; AES_BLOCK];
        let len = buf.len();
        let _ = Aes256CbcEnc::new(key.into(), (&iv).into())
            .encrypt_padded_mut::<NoPadding>(buf, len);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_without_password() {
        let cipher = Cipher::new(None);
        assert!(!cipher.is_active());
        let mut buf = [0x42u8; 64];
        cipher.encrypt(&mut buf);
        assert_eq!(buf, [0x42u8; 64]);

        let cipher = Cipher::new(Some(""));
        assert!(!cipher.is_active());
    }

    #[test]
    fn round_trip() {
        let cipher = Cipher::new(Some("hunter2"));
        let plain = [0xA5u8; 4096];
        let mut buf = plain;
        cipher.encrypt(&mut buf);
        assert_ne!(buf, plain);
        cipher.decrypt(&mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn long_passwords_truncate() {
        let short = Cipher::new(Some(&"x".repeat(32)));
        let long = Cipher::new(Some(&"x".repeat(64)));
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        short.encrypt(&mut a);
        long.encrypt(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn unaligned_lengths_untouched() {
        let cipher = Cipher::new(Some("pw"));
        let mut buf = [7u8; 15];
        cipher.encrypt(&mut buf);
        assert_eq!(buf, [7u8; 15]);
    }
}
