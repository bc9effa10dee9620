//! Payload ciphers
//!
//! A frame's `crypt` byte carries one of the ids below. Only `none` and
//! `xor` are provided; the other ids are recognised so that a frame sealed
//! with one of them is dropped instead of misread.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Length of the xor key-stream pad; longer payloads wrap around it
const PAD_LEN: usize = 2048;
const PAD_SALT: &[u8] = b"vnet-xor-pad";

/// A symmetric cipher over equal-length buffers
pub trait BlockCrypt: Send + Sync {
    fn encrypt(&self, dst: &mut [u8], src: &[u8]);

    fn decrypt(&self, dst: &mut [u8], src: &[u8]);

    fn encrypt_in_place(&self, data: &mut [u8]) {
        let src = data.to_vec();
        self.encrypt(data, &src);
    }

    fn decrypt_in_place(&self, data: &mut [u8]) {
        let src = data.to_vec();
        self.decrypt(data, &src);
    }
}

/// Wire ids of every cipher the protocol knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CipherId {
    Xor = 0x01,
    None = 0x02,
    Aes128 = 0x03,
    Aes192 = 0x04,
    Aes = 0x05,
    Blowfish = 0x06,
    Twofish = 0x07,
    Cast5 = 0x08,
    TripleDes = 0x09,
    Xtea = 0x0A,
    Salsa20 = 0x0B,
}

impl CipherId {
    pub const ALL: [CipherId; 11] = [
        CipherId::Xor,
        CipherId::None,
        CipherId::Aes128,
        CipherId::Aes192,
        CipherId::Aes,
        CipherId::Blowfish,
        CipherId::Twofish,
        CipherId::Cast5,
        CipherId::TripleDes,
        CipherId::Xtea,
        CipherId::Salsa20,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|id| *id as u8 == value)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherId::Xor => "xor",
            CipherId::None => "none",
            CipherId::Aes128 => "aes-128",
            CipherId::Aes192 => "aes-192",
            CipherId::Aes => "aes",
            CipherId::Blowfish => "blowfish",
            CipherId::Twofish => "twofish",
            CipherId::Cast5 => "cast5",
            CipherId::TripleDes => "3des",
            CipherId::Xtea => "xtea",
            CipherId::Salsa20 => "salsa20",
        }
    }
}

impl fmt::Display for CipherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Copies through unchanged
#[derive(Debug, Default)]
pub struct NoneCrypt;

impl BlockCrypt for NoneCrypt {
    fn encrypt(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    fn decrypt(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    fn encrypt_in_place(&self, _data: &mut [u8]) {}

    fn decrypt_in_place(&self, _data: &mut [u8]) {}
}

/// XOR against a pad expanded from the passphrase with SHA-256.
///
/// Obfuscation only; it offers no confidentiality against an observer who
/// sees two payloads.
pub struct XorCrypt {
    pad: Vec<u8>,
}

impl XorCrypt {
    pub fn new(key: &[u8]) -> Self {
        let mut pad = Vec::with_capacity(PAD_LEN);
        let mut counter: u32 = 0;
        while pad.len() < PAD_LEN {
            let mut hasher = Sha256::new();
            hasher.update(PAD_SALT);
            hasher.update(key);
            hasher.update(counter.to_be_bytes());
            pad.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        pad.truncate(PAD_LEN);
        Self { pad }
    }

    fn apply(&self, dst: &mut [u8], src: &[u8]) {
        for (i, (d, s)) in dst.iter_mut().zip(src).enumerate() {
            *d = s ^ self.pad[i % PAD_LEN];
        }
    }
}

impl fmt::Debug for XorCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XorCrypt").finish_non_exhaustive()
    }
}

impl BlockCrypt for XorCrypt {
    fn encrypt(&self, dst: &mut [u8], src: &[u8]) {
        self.apply(dst, src);
    }

    fn decrypt(&self, dst: &mut [u8], src: &[u8]) {
        self.apply(dst, src);
    }

    fn encrypt_in_place(&self, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.pad[i % PAD_LEN];
        }
    }

    fn decrypt_in_place(&self, data: &mut [u8]) {
        self.encrypt_in_place(data);
    }
}

/// The ciphers this node can apply, keyed from one shared passphrase
#[derive(Clone)]
pub struct CryptoRegistry {
    ciphers: Arc<BTreeMap<CipherId, Arc<dyn BlockCrypt>>>,
}

impl CryptoRegistry {
    pub fn new(key: &str) -> Self {
        let mut ciphers: BTreeMap<CipherId, Arc<dyn BlockCrypt>> = BTreeMap::new();
        ciphers.insert(CipherId::None, Arc::new(NoneCrypt));
        ciphers.insert(CipherId::Xor, Arc::new(XorCrypt::new(key.as_bytes())));
        Self {
            ciphers: Arc::new(ciphers),
        }
    }

    pub fn get(&self, id: CipherId) -> Result<Arc<dyn BlockCrypt>> {
        self.ciphers
            .get(&id)
            .cloned()
            .ok_or(Error::UnsupportedCipher(id as u8))
    }

    /// Look up the cipher named by a frame's `crypt` byte
    pub fn by_wire_id(&self, id: u8) -> Result<Arc<dyn BlockCrypt>> {
        let cipher = CipherId::from_u8(id).ok_or(Error::UnsupportedCipher(id))?;
        self.get(cipher)
    }

    pub fn provides(&self, id: CipherId) -> bool {
        self.ciphers.contains_key(&id)
    }

    /// Per-link crypt state sealing outbound payloads with `outbound`
    pub fn link_crypt(&self, outbound: CipherId) -> Result<LinkCrypt> {
        let cipher = self.get(outbound)?;
        Ok(LinkCrypt::new(outbound, cipher, self.clone()))
    }
}

impl fmt::Debug for CryptoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ciphers.keys()).finish()
    }
}

/// Cipher state owned by one link. Sealing and opening on a link are
/// serialised by its own lock; links never contend with each other.
pub struct LinkCrypt {
    outbound: CipherId,
    cipher: Arc<dyn BlockCrypt>,
    registry: CryptoRegistry,
    lock: Mutex<()>,
}

impl LinkCrypt {
    /// `cipher` must be the registry's implementation of `outbound`.
    pub fn new(outbound: CipherId, cipher: Arc<dyn BlockCrypt>, registry: CryptoRegistry) -> Self {
        Self {
            outbound,
            cipher,
            registry,
            lock: Mutex::new(()),
        }
    }

    pub fn outbound(&self) -> CipherId {
        self.outbound
    }

    /// Encrypt an outbound payload in place; returns the header crypt byte.
    pub fn seal(&self, payload: &mut [u8]) -> u8 {
        if self.outbound == CipherId::None {
            return 0;
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cipher.encrypt_in_place(payload);
        self.outbound as u8
    }

    /// Decrypt an inbound payload in place according to its crypt byte.
    pub fn open(&self, crypt: u8, payload: &mut [u8]) -> Result<()> {
        if crypt == 0 {
            return Ok(());
        }
        let cipher = self.registry.by_wire_id(crypt)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        cipher.decrypt_in_place(payload);
        Ok(())
    }
}

impl fmt::Debug for LinkCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCrypt")
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}
