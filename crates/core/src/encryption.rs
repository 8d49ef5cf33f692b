//! Encryption parameters and encrypted user metadata.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Cipher suite used to encrypt object content and metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CipherSuite {
    #[default]
    Unspecified = 0,
    Null = 1,
    AesGcm = 2,
    SecretBox = 3,
}

impl CipherSuite {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CipherSuite::Unspecified),
            1 => Ok(CipherSuite::Null),
            2 => Ok(CipherSuite::AesGcm),
            3 => Ok(CipherSuite::SecretBox),
            other => Err(Error::Encoding(format!("invalid cipher suite {other}"))),
        }
    }
}

/// Client-chosen encryption parameters of an object.
///
/// Packs into a 64-bit column: cipher suite in the low 32 bits, block size in
/// the high 32 bits. The zero value means "unspecified".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    pub cipher_suite: CipherSuite,
    pub block_size: i32,
}

impl EncryptionParameters {
    /// Whether the parameters are entirely unset.
    pub fn is_zero(&self) -> bool {
        self.cipher_suite == CipherSuite::Unspecified && self.block_size == 0
    }

    /// Pack into the 64-bit database form.
    pub fn pack(&self) -> i64 {
        (self.cipher_suite as u8 as i64) | ((self.block_size as i64) << 32)
    }

    /// Unpack from the 64-bit database form.
    pub fn unpack(value: i64) -> Result<Self> {
        Ok(Self {
            cipher_suite: CipherSuite::from_u8((value & 0xFF) as u8)?,
            block_size: (value >> 32) as i32,
        })
    }
}

/// Encrypted user-supplied object metadata, stored opaquely.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptedUserData {
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub encrypted_etag: Option<Vec<u8>>,
}

impl EncryptedUserData {
    /// Whether any field is populated.
    pub fn is_empty(&self) -> bool {
        self.encrypted_metadata.is_none()
            && self.encrypted_metadata_nonce.is_none()
            && self.encrypted_metadata_encrypted_key.is_none()
            && self.encrypted_etag.is_none()
    }

    /// Validate field consistency: the nonce and encrypted key travel with
    /// the metadata ciphertext, never alone.
    pub fn verify(&self) -> Result<()> {
        let has = |field: &Option<Vec<u8>>| field.as_deref().is_some_and(|b| !b.is_empty());

        if has(&self.encrypted_metadata) {
            if !has(&self.encrypted_metadata_nonce) || !has(&self.encrypted_metadata_encrypted_key)
            {
                return Err(Error::InvalidArgument(
                    "EncryptedMetadataNonce and EncryptedMetadataEncryptedKey must be set if EncryptedMetadata is set".into(),
                ));
            }
        } else if has(&self.encrypted_metadata_nonce)
            || has(&self.encrypted_metadata_encrypted_key)
        {
            return Err(Error::InvalidArgument(
                "EncryptedMetadataNonce and EncryptedMetadataEncryptedKey must not be set if EncryptedMetadata is not set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_pack_roundtrip() {
        let params = EncryptionParameters {
            cipher_suite: CipherSuite::AesGcm,
            block_size: 7424,
        };
        assert_eq!(
            EncryptionParameters::unpack(params.pack()).unwrap(),
            params
        );
        assert!(EncryptionParameters::default().is_zero());
        assert_eq!(EncryptionParameters::default().pack(), 0);
    }

    #[test]
    fn user_data_verify() {
        let mut data = EncryptedUserData {
            encrypted_metadata: Some(b"meta".to_vec()),
            ..Default::default()
        };
        assert!(data.verify().is_err());

        data.encrypted_metadata_nonce = Some(b"nonce".to_vec());
        data.encrypted_metadata_encrypted_key = Some(b"key".to_vec());
        assert!(data.verify().is_ok());

        let orphan_nonce = EncryptedUserData {
            encrypted_metadata_nonce: Some(b"nonce".to_vec()),
            ..Default::default()
        };
        assert!(orphan_nonce.verify().is_err());

        assert!(EncryptedUserData::default().verify().is_ok());
    }
}
