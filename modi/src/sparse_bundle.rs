//! Sparse-bundle (`.sparsebundle`) `Info.plist` parsing (C4.4.2).
//!
//! A sparse-bundle is a directory carrying an XML `Info.plist` and a
//! `bands/` subdirectory of individually-named band files, each up to
//! `band_data_size` bytes. Detection for the manifest itself is a plain
//! `"<?xml"` prefix check; the directory-vs-file decision lives in the
//! Handle's open routine (C6).

use crate::error::{ModiError, Result};

pub const XML_PREFIX: &[u8; 5] = b"<?xml";

#[derive(Debug)]
pub struct SparseBundleManifest {
    pub band_data_size: u64,
    pub media_size: u64,
    pub number_of_bands: u64,
    /// Set when `diskimage-bundle-type` is present but not the expected
    /// value; the Handle logs this through its own debug sink rather
    /// than this parser reaching for a global logger.
    pub unrecognized_bundle_type: Option<String>,
}

impl SparseBundleManifest {
    pub fn band_file_name(index: u64) -> String {
        format!("{index:x}")
    }
}

/// Parses an `Info.plist` XML document into a `SparseBundleManifest`.
pub fn parse_manifest(plist_data: &[u8]) -> Result<SparseBundleManifest> {
    let value: plist::Value = plist::from_bytes(plist_data)
        .map_err(|e| ModiError::InvalidPlist(format!("Info.plist parse error: {e}")))?;

    let dict = value
        .as_dictionary()
        .ok_or_else(|| ModiError::InvalidPlist("Info.plist root is not a dictionary".into()))?;

    let band_data_size = dict
        .get("band-size")
        .and_then(|v| v.as_unsigned_integer())
        .ok_or_else(|| ModiError::InvalidPlist("Info.plist missing band-size".into()))?;
    if band_data_size == 0 {
        return Err(ModiError::OutOfBounds(
            "Info.plist band-size is zero".into(),
        ));
    }

    let media_size = dict
        .get("size")
        .and_then(|v| v.as_unsigned_integer())
        .ok_or_else(|| ModiError::InvalidPlist("Info.plist missing size".into()))?;

    // Advisory, matching the reference reducer: surfaced to the caller
    // if present and unrecognized, never fatal. Neither key changes any
    // read behavior; `bundle-backingstore-version` is ignored outright.
    let unrecognized_bundle_type = dict
        .get("diskimage-bundle-type")
        .and_then(|v| v.as_string())
        .filter(|s| *s != "com.apple.diskimage.sparsebundle")
        .map(str::to_owned);

    let number_of_bands = media_size.div_ceil(band_data_size);

    Ok(SparseBundleManifest {
        band_data_size,
        media_size,
        number_of_bands,
        unrecognized_bundle_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plist(band_size: u64, size: u64) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>band-size</key>
    <integer>{band_size}</integer>
    <key>size</key>
    <integer>{size}</integer>
    <key>diskimage-bundle-type</key>
    <string>com.apple.diskimage.sparsebundle</string>
</dict>
</plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_band_size_and_media_size() {
        let data = sample_plist(8_388_608, 25_165_824);
        let manifest = parse_manifest(&data).unwrap();
        assert_eq!(manifest.band_data_size, 8_388_608);
        assert_eq!(manifest.media_size, 25_165_824);
        assert_eq!(manifest.number_of_bands, 3);
    }

    #[test]
    fn band_file_name_is_unpadded_lowercase_hex() {
        assert_eq!(SparseBundleManifest::band_file_name(0), "0");
        assert_eq!(SparseBundleManifest::band_file_name(255), "ff");
    }

    #[test]
    fn rejects_missing_required_keys() {
        let data = br#"<?xml version="1.0"?><plist version="1.0"><dict></dict></plist>"#;
        assert!(parse_manifest(data).is_err());
    }
}
