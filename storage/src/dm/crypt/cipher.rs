// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Cipher primitives consumed by the crypt target.

extern crate alloc;
use alloc::boxed::Box;

use crate::crypto::{
    CryptoError,
    symcipher::{
        SymBlockCipherAlg, SymBlockCipherKey, SymBlockCipherMode, SymBlockCipherModeDecryptionInstance,
        SymBlockCipherModeEncryptionInstance,
    },
};
use crate::dm::{DmError, DmInvalidArgument};
use core::marker;

/// Chaining mode requested in the table line's cipher specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptChainMode {
    /// CBC chaining with the sector number as IV.
    Plain,
    /// No chaining, no IV.
    Ecb,
}

impl CryptChainMode {
    /// Parse a chaining mode name.
    ///
    /// A missing mode defaults to [`CryptChainMode::Plain`].
    pub fn parse(name: Option<&str>) -> Result<Self, DmError> {
        match name {
            None | Some("plain") => Ok(Self::Plain),
            Some("ecb") => Ok(Self::Ecb),
            Some(_) => Err(DmError::InvalidArgument(DmInvalidArgument::ChainingMode)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Ecb => "ecb",
        }
    }
}

/// Cipher instance used by a crypt target.
///
/// Transforms operate on whole sectors, in place or from a source into a
/// destination buffer of equal length.
pub trait CryptCipher: marker::Send + marker::Sync {
    /// The cipher's name as found in the table line.
    fn name(&self) -> &str;

    /// Whether the cipher is a block cipher, as opposed to e.g. a digest.
    fn is_block_cipher(&self) -> bool;

    /// Whether the cipher instance takes an IV.
    fn supports_iv(&self) -> bool;

    /// The instance's native IV size in bytes.
    fn iv_size(&self) -> usize;

    /// The block size in bytes.
    fn block_size(&self) -> usize;

    /// Install the key.
    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError>;

    /// Encrypt `data` in place.
    fn encrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError>;

    /// Decrypt `data` in place.
    fn decrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError>;

    /// Encrypt `src` into `dst`.
    fn encrypt(&self, dst: &mut [u8], src: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
        if dst.len() != src.len() {
            return Err(CryptoError::InvalidParams);
        }
        dst.copy_from_slice(src);
        self.encrypt_in_place(dst, iv)
    }

    /// Decrypt `src` into `dst`.
    fn decrypt(&self, dst: &mut [u8], src: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
        if dst.len() != src.len() {
            return Err(CryptoError::InvalidParams);
        }
        dst.copy_from_slice(src);
        self.decrypt_in_place(dst, iv)
    }
}

/// Factory for [`CryptCipher`] instances.
pub trait CryptCipherProvider: marker::Send + marker::Sync {
    /// Instantiate an unkeyed cipher.
    ///
    /// # Arguments:
    ///
    /// * `name` - The cipher name from the table line, e.g. `"aes"`.
    /// * `mode` - The requested chaining mode.
    fn alloc_cipher(&self, name: &str, mode: CryptChainMode) -> Result<Box<dyn CryptCipher>, DmError>;
}

/// [`CryptCipherProvider`] for the [symmetric block
/// ciphers](crate::crypto::symcipher) and `cipher_null`.
#[derive(Default)]
pub struct SymCryptCipherProvider;

impl SymCryptCipherProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptCipherProvider for SymCryptCipherProvider {
    fn alloc_cipher(&self, name: &str, mode: CryptChainMode) -> Result<Box<dyn CryptCipher>, DmError> {
        if name == CryptNullCipher::NAME {
            return Ok(Box::new(CryptNullCipher));
        }
        if !SymBlockCipherAlg::is_supported_name(name) {
            return Err(DmError::InvalidArgument(DmInvalidArgument::CipherUnavailable));
        }
        // All supported families take 128 bit keys. The final choice gets
        // made by set_key() based on the key's length.
        let alg = SymBlockCipherAlg::lookup(name, 16)
            .map_err(|_| DmError::InvalidArgument(DmInvalidArgument::CipherUnavailable))?;
        let mode = match mode {
            CryptChainMode::Plain => SymBlockCipherMode::Cbc,
            CryptChainMode::Ecb => SymBlockCipherMode::Ecb,
        };
        Ok(Box::new(SymCryptCipher {
            alg,
            mode,
            instances: None,
        }))
    }
}

/// [`CryptCipher`] wrapping a [`SymBlockCipherAlg`] in a
/// [`SymBlockCipherMode`].
pub struct SymCryptCipher {
    alg: SymBlockCipherAlg,
    mode: SymBlockCipherMode,
    instances: Option<(SymBlockCipherModeEncryptionInstance, SymBlockCipherModeDecryptionInstance)>,
}

impl CryptCipher for SymCryptCipher {
    fn name(&self) -> &str {
        self.alg.name()
    }

    fn is_block_cipher(&self) -> bool {
        true
    }

    fn supports_iv(&self) -> bool {
        self.mode.iv_len(&self.alg) != 0
    }

    fn iv_size(&self) -> usize {
        self.mode.iv_len(&self.alg)
    }

    fn block_size(&self) -> usize {
        self.alg.block_len()
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        let alg = SymBlockCipherAlg::lookup(self.alg.name(), key.len())?;
        let key = SymBlockCipherKey::try_from((alg, key))?;
        let encrypt = SymBlockCipherModeEncryptionInstance::new(self.mode, &alg, &key)?;
        let decrypt = SymBlockCipherModeDecryptionInstance::new(self.mode, &alg, &key)?;
        self.alg = alg;
        self.instances = Some((encrypt, decrypt));
        Ok(())
    }

    fn encrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError> {
        match &self.instances {
            Some((encrypt, _)) => encrypt.encrypt_in_place(iv, data),
            None => Err(CryptoError::Internal),
        }
    }

    fn decrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError> {
        match &self.instances {
            Some((_, decrypt)) => decrypt.decrypt_in_place(iv, data),
            None => Err(CryptoError::Internal),
        }
    }
}

/// The identity transform.
///
/// Takes no IV and accepts keys of any length, including none.
pub struct CryptNullCipher;

impl CryptNullCipher {
    pub const NAME: &'static str = "cipher_null";
}

impl CryptCipher for CryptNullCipher {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_block_cipher(&self) -> bool {
        true
    }

    fn supports_iv(&self) -> bool {
        false
    }

    fn iv_size(&self) -> usize {
        0
    }

    fn block_size(&self) -> usize {
        1
    }

    fn set_key(&mut self, _key: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn encrypt_in_place(&self, _data: &mut [u8], _iv: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn decrypt_in_place(&self, _data: &mut [u8], _iv: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }
}
