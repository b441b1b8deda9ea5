// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs1::DecodeRsaPublicKey, traits::PublicKeyParts,
};
use sha2::Sha256;
use thiserror::Error;

use crate::hash::DIGEST_SIZE;

/// Payload signing keys are 2048-bit RSA.
pub const KEY_SIZE: usize = 2048 / 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes)")]
    InvalidDigestLength(usize),
    #[error("Invalid signature length ({actual} bytes), expected {expected} bytes")]
    InvalidSignatureLength { expected: usize, actual: usize },
    #[error("Failed to load RSA public key: {0:?}")]
    LoadPubKey(PathBuf),
    #[error("Failed to decode base64 RSA public key")]
    DecodeBase64PubKey(#[source] base64::DecodeError),
    #[error("Failed to parse RSA public key")]
    ParsePubKey,
    #[error("Failed to load unencrypted RSA private key")]
    LoadKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn check_key_size(size: usize) -> Result<()> {
    if size != KEY_SIZE {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

fn check_digest(digest: &[u8]) -> Result<()> {
    if digest.len() != DIGEST_SIZE {
        return Err(Error::InvalidDigestLength(digest.len()));
    }

    Ok(())
}

/// Sign a SHA-256 digest with PKCS#1 v1.5 padding.
pub fn sign_sha256_digest(key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
    check_digest(digest)?;
    check_key_size(key.size())?;

    key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
        .map_err(|e| Error::RsaSign(Box::new(e)))
}

/// Verify a PKCS#1 v1.5 signature over a SHA-256 digest.
pub fn verify_sha256_digest(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
    check_digest(digest)?;
    check_key_size(key.size())?;

    if signature.len() != key.size() {
        return Err(Error::InvalidSignatureLength {
            expected: key.size(),
            actual: signature.len(),
        });
    }

    key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .map_err(|e| Error::RsaVerify(Box::new(e)))
}

fn parse_public_key(data: &[u8]) -> Option<RsaPublicKey> {
    match std::str::from_utf8(data) {
        Ok(pem) if pem.trim_start().starts_with("-----BEGIN") => RsaPublicKey::from_public_key_pem(pem)
            .ok()
            .or_else(|| RsaPublicKey::from_pkcs1_pem(pem).ok()),
        _ => RsaPublicKey::from_public_key_der(data).ok(),
    }
}

/// Load an RSA public key. PEM-encoded SPKI, PEM-encoded PKCS#1, and
/// DER-encoded SPKI are accepted.
pub fn read_public_key(path: &Path, mut reader: impl Read) -> Result<RsaPublicKey> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let key = parse_public_key(&data).ok_or_else(|| Error::LoadPubKey(path.to_owned()))?;
    check_key_size(key.size())?;

    Ok(key)
}

/// Load an RSA public key from the base64 encoding of an entire key file, as
/// sent by update servers. The key file may be in any format accepted by
/// [`read_public_key()`].
pub fn decode_base64_public_key(encoded: &str) -> Result<RsaPublicKey> {
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(Error::DecodeBase64PubKey)?;

    let key = parse_public_key(&data).ok_or(Error::ParsePubKey)?;
    check_key_size(key.size())?;

    Ok(key)
}

pub fn read_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_public_key(path, reader)
}

/// Load an unencrypted PEM-encoded PKCS#8 private key.
pub fn read_pem_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let mut data = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut data))
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let key = RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKeyUnencrypted)?;
    check_key_size(key.size())?;

    Ok(key)
}
