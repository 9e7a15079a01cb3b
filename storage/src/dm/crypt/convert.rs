// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Sector-wise streaming of [`BioSegment`] data through a [`CryptCipher`].

use super::cipher::CryptCipher;
use crate::blkdev::{BioSegment, SECTOR_SIZE};
use crate::crypto::CryptoError;

/// Upper bound on the IV size of any usable cipher.
pub const CRYPT_MAX_IV_SIZE: usize = 32;

/// Derive the "plain" IV for a sector.
///
/// The sector number's lower 32 bits in little endian, zero-padded to the
/// IV size.
pub fn crypt_iv_plain(iv: &mut [u8], sector: u64) {
    iv.fill(0);
    let sector = (sector as u32).to_le_bytes();
    let n = iv.len().min(sector.len());
    iv[..n].copy_from_slice(&sector[..n]);
}

/// Parameters of the transform applied to each sector.
#[derive(Clone, Copy)]
pub struct CryptConvertParams<'a> {
    pub cipher: &'a dyn CryptCipher,
    pub iv_size: usize,
}

impl<'a> CryptConvertParams<'a> {
    fn iv_for_sector<'b>(&self, buf: &'b mut [u8; CRYPT_MAX_IV_SIZE], sector: u64) -> &'b [u8] {
        let iv = &mut buf[..self.iv_size];
        if !iv.is_empty() {
            crypt_iv_plain(iv, sector);
        }
        iv
    }
}

/// Cursor state for streaming sectors from source to destination segments.
///
/// The source cursor advances monotonically over a request's segments while
/// the destination cursor may get [reset](Self::reset_out) for each new
/// fragment.
pub struct CryptConvertContext {
    idx_in: usize,
    offset_in: usize,
    idx_out: usize,
    offset_out: usize,
    /// IV sector of the next sector to transform.
    sector: u64,
    write: bool,
}

impl CryptConvertContext {
    /// Create a new `CryptConvertContext`.
    ///
    /// # Arguments:
    ///
    /// * `sector` - The IV sector of the first sector, i.e. the target
    ///   relative sector plus the configured IV offset.
    /// * `write` - Encrypt if `true`, decrypt otherwise.
    pub fn new(sector: u64, write: bool) -> Self {
        Self {
            idx_in: 0,
            offset_in: 0,
            idx_out: 0,
            offset_out: 0,
            sector,
            write,
        }
    }

    pub fn reset_out(&mut self) {
        self.idx_out = 0;
        self.offset_out = 0;
    }

    /// IV sector of the next sector to transform.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Transform sectors from `src` into `dst` until either runs out.
    pub fn convert(
        &mut self,
        params: &CryptConvertParams<'_>,
        src: &[BioSegment],
        dst: &mut [BioSegment],
    ) -> Result<(), CryptoError> {
        let mut iv_buf = [0u8; CRYPT_MAX_IV_SIZE];
        while self.idx_in < src.len() && self.idx_out < dst.len() {
            let seg_in = &src[self.idx_in];
            let seg_out = &mut dst[self.idx_out];
            if seg_in.len() < self.offset_in + SECTOR_SIZE || seg_out.len() < self.offset_out + SECTOR_SIZE {
                return Err(CryptoError::InvalidParams);
            }

            let input = &seg_in.data()[self.offset_in..self.offset_in + SECTOR_SIZE];
            let output = &mut seg_out.data_mut()[self.offset_out..self.offset_out + SECTOR_SIZE];
            let iv = params.iv_for_sector(&mut iv_buf, self.sector);
            if self.write {
                params.cipher.encrypt(output, input, iv)?;
            } else {
                params.cipher.decrypt(output, input, iv)?;
            }

            self.offset_in += SECTOR_SIZE;
            if self.offset_in == seg_in.len() {
                self.idx_in += 1;
                self.offset_in = 0;
            }
            self.offset_out += SECTOR_SIZE;
            if self.offset_out == seg_out.len() {
                self.idx_out += 1;
                self.offset_out = 0;
            }
            self.sector += 1;
        }
        Ok(())
    }

    /// Transform all sectors of `segments` in place.
    pub fn convert_in_place(
        &mut self,
        params: &CryptConvertParams<'_>,
        segments: &mut [BioSegment],
    ) -> Result<(), CryptoError> {
        let mut iv_buf = [0u8; CRYPT_MAX_IV_SIZE];
        while self.idx_in < segments.len() {
            let seg = &mut segments[self.idx_in];
            if seg.len() < self.offset_in + SECTOR_SIZE {
                return Err(CryptoError::InvalidParams);
            }

            let data = &mut seg.data_mut()[self.offset_in..self.offset_in + SECTOR_SIZE];
            let iv = params.iv_for_sector(&mut iv_buf, self.sector);
            if self.write {
                params.cipher.encrypt_in_place(data, iv)?;
            } else {
                params.cipher.decrypt_in_place(data, iv)?;
            }

            self.offset_in += SECTOR_SIZE;
            if self.offset_in == seg.len() {
                self.idx_in += 1;
                self.offset_in = 0;
            }
            self.sector += 1;
        }
        Ok(())
    }
}

#[test]
fn test_crypt_iv_plain() {
    let mut iv = [0xffu8; 16];
    crypt_iv_plain(&mut iv, 0x1_0403_0201);
    assert_eq!(iv[..4], [1, 2, 3, 4]);
    assert!(iv[4..].iter().all(|b| *b == 0));

    let mut iv = [0u8; 4];
    crypt_iv_plain(&mut iv, 10);
    assert_eq!(iv, 10u32.to_le_bytes());
}
