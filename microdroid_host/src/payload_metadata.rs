// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The payload metadata partition image.
//!
//! The image is a big-endian `u32` length followed by a protobuf-encoded
//! [`Metadata`] message.

use crate::config::APK_IDSIG_PARTITION;
use crate::config::APK_PARTITION;
use crate::error::HarnessError;
use prost::Message;
use std::path::Path;

/// Metadata format version.
pub const METADATA_VERSION: u32 = 1;
/// Config path of the default payload, as mounted in the guest.
pub const DEFAULT_CONFIG_PATH: &str = "/mnt/apk/assets/vm_config.json";

/// Root message of the payload metadata image.
#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    /// Format version.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// APEXes on the payload disk.
    #[prost(message, repeated, tag = "3")]
    pub apexes: Vec<ApexPayload>,
    /// The payload APK.
    #[prost(message, optional, tag = "4")]
    pub apk: Option<ApkPayload>,
    /// Guest path of the VM payload config.
    #[prost(string, optional, tag = "5")]
    pub config_path: Option<String>,
}

/// An APEX on the payload disk.
#[derive(Clone, PartialEq, Message)]
pub struct ApexPayload {
    /// Module name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Label of the partition holding the APEX.
    #[prost(string, tag = "2")]
    pub partition_name: String,
    /// Whether this is the factory version of the APEX.
    #[prost(bool, tag = "6")]
    pub is_factory: bool,
}

/// The payload APK and its signature.
#[derive(Clone, PartialEq, Message)]
pub struct ApkPayload {
    /// Payload name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Label of the APK partition.
    #[prost(string, tag = "2")]
    pub payload_partition_name: String,
    /// Label of the signature partition.
    #[prost(string, tag = "3")]
    pub idsig_partition_name: String,
}

/// Builds the metadata for a payload made of `apexes` and the test APK.
pub fn payload_metadata<'a>(
    config_path: &str,
    apexes: impl IntoIterator<Item = &'a str>,
) -> Metadata {
    Metadata {
        version: METADATA_VERSION,
        apexes: apexes
            .into_iter()
            .map(|name| ApexPayload {
                name: name.to_owned(),
                partition_name: name.to_owned(),
                is_factory: true,
            })
            .collect(),
        apk: Some(ApkPayload {
            name: "apk".to_owned(),
            payload_partition_name: APK_PARTITION.to_owned(),
            idsig_partition_name: APK_IDSIG_PARTITION.to_owned(),
        }),
        config_path: Some(config_path.to_owned()),
    }
}

/// Encodes `metadata` with its length prefix.
pub fn encode_framed(metadata: &Metadata) -> Vec<u8> {
    let body = metadata.encode_to_vec();
    let mut image = Vec::with_capacity(4 + body.len());
    // Messages are far below 4 GiB.
    image.extend_from_slice(&(body.len() as u32).to_be_bytes());
    image.extend_from_slice(&body);
    image
}

/// Decodes a length-prefixed metadata image.
pub fn decode_framed(image: &[u8]) -> Result<Metadata, HarnessError> {
    let (len, body) = image
        .split_first_chunk::<4>()
        .ok_or_else(|| HarnessError::parse("payload metadata", "image is shorter than its header"))?;
    let len = u32::from_be_bytes(*len) as usize;
    let body = body.get(..len).ok_or_else(|| {
        HarnessError::parse(
            "payload metadata",
            format_args!("header claims {len} bytes, image has {}", body.len()),
        )
    })?;
    Metadata::decode(body).map_err(|err| HarnessError::parse("payload metadata", err))
}

/// Writes the metadata image to `path`.
pub fn write(metadata: &Metadata, path: &Path) -> Result<(), HarnessError> {
    fs_err::write(path, encode_framed(metadata))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_length_prefixed() {
        let metadata = payload_metadata(
            DEFAULT_CONFIG_PATH,
            ["com.android.os.statsd", "com.android.adbd"],
        );
        let image = encode_framed(&metadata);
        let len = u32::from_be_bytes(image[..4].try_into().unwrap()) as usize;
        assert_eq!(len, image.len() - 4);
        // Field 1, varint, value 1.
        assert_eq!(&image[4..6], &[0x08, 0x01]);

        let decoded = decode_framed(&image).unwrap();
        assert_eq!(decoded.apexes.len(), 2);
        assert_eq!(decoded.apexes[1].partition_name, "com.android.adbd");
        assert!(decoded.apexes.iter().all(|a| a.is_factory));
        let apk = decoded.apk.unwrap();
        assert_eq!(apk.payload_partition_name, "microdroid-apk");
        assert_eq!(apk.idsig_partition_name, "microdroid-apk-idsig");
        assert_eq!(decoded.config_path.as_deref(), Some(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = encode_framed(&payload_metadata(DEFAULT_CONFIG_PATH, []));
        assert!(decode_framed(&image[..2]).is_err());
        assert!(decode_framed(&image[..image.len() - 1]).is_err());
    }

    #[test]
    fn writes_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload-metadata.img");
        let metadata = payload_metadata(DEFAULT_CONFIG_PATH, ["com.android.adbd"]);
        write(&metadata, &path).unwrap();
        assert_eq!(fs_err::read(&path).unwrap(), encode_framed(&metadata));
    }
}
