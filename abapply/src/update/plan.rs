// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Public key used to verify payloads when the plan does not specify one.
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "/usr/share/update_engine/update-payload-key.pub.pem";

/// Parameters for applying a single payload. These come from the update
/// server's response and the state of the running system, not from the
/// payload itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallPlan {
    /// Whether verification failures are fatal. If false, failures are only
    /// logged and reported.
    pub hash_checks_mandatory: bool,
    /// Whether the payload writes complete partition images instead of
    /// differences against the current images.
    pub is_full_update: bool,
    /// Expected size of the payload header plus manifest. 0 if unknown.
    pub metadata_size: u64,
    /// RSA signature of the SHA-256 digest of the metadata. Empty if the
    /// update server did not provide one.
    #[serde(with = "base64_bytes")]
    pub metadata_signature: Vec<u8>,
    /// Override for [`DEFAULT_PUBLIC_KEY_PATH`].
    pub public_key_path: Option<PathBuf>,
    /// Base64-encoded public key file sent by the update server. Only used
    /// if there is no key file at [`Self::public_key_path()`].
    pub public_key_rsa: String,
    /// SHA-256 of the current kernel partition.
    #[serde(with = "hex")]
    pub kernel_hash: Vec<u8>,
    /// SHA-256 of the current rootfs partition.
    #[serde(with = "hex")]
    pub rootfs_hash: Vec<u8>,
    /// Expected size of the entire payload. 0 if unknown.
    pub payload_size: u64,
    /// Expected SHA-256 of the entire payload.
    #[serde(with = "hex")]
    pub payload_hash: Vec<u8>,
    /// Opaque identifier of the update being offered. Used to decide whether
    /// an interrupted update can be resumed.
    pub response_hash: String,
}

impl InstallPlan {
    pub fn public_key_path(&self) -> &Path {
        self.public_key_path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_PUBLIC_KEY_PATH))
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let data = String::deserialize(deserializer)?;

        STANDARD.decode(data.trim()).map_err(D::Error::custom)
    }
}
