use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of every fingerprint produced by [`Fingerprinter`].
pub const FINGERPRINT_BITS: usize = 64;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Fingerprint width mismatch: {left} vs {right} bits")]
    WidthMismatch { left: usize, right: usize },

    #[error("Invalid fingerprint {input:?}: {reason}")]
    InvalidFingerprint { input: String, reason: &'static str },
}

impl HashError {
    fn invalid(input: &str, reason: &'static str) -> Self {
        HashError::InvalidFingerprint {
            input: input.to_string(),
            reason,
        }
    }
}

/// Compute the MD5 content hash of `bytes` as lowercase hex.
/// This is used for exact duplicate detection, not for security.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Encode a bitstring (`'0'`/`'1'` characters, width a multiple of 8) as hex.
/// Each 8-bit group becomes two lowercase hex characters.
pub fn bits_to_hex(bits: &str) -> Result<String, HashError> {
    Ok(hex::encode(bits_to_bytes(bits)?))
}

/// Decode a hex fingerprint into its bitstring form.
pub fn hex_to_bits(hex: &str) -> Result<String, HashError> {
    Ok(bytes_to_bits(&hex_to_bytes(hex)?))
}

fn bits_to_bytes(bits: &str) -> Result<Vec<u8>, HashError> {
    if bits.len() % 8 != 0 {
        return Err(HashError::invalid(bits, "bit width is not a multiple of 8"));
    }
    if !bits.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(HashError::invalid(bits, "bitstring contains characters other than 0 and 1"));
    }

    Ok(bits
        .as_bytes()
        .chunks(8)
        .map(|group| group.iter().fold(0u8, |acc, b| (acc << 1) | (b - b'0')))
        .collect())
}

fn bytes_to_bits(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:08b}", b)).collect()
}

fn hex_to_bytes(input: &str) -> Result<Vec<u8>, HashError> {
    hex::decode(input).map_err(|e| match e {
        hex::FromHexError::OddLength => HashError::invalid(input, "odd number of hex digits"),
        _ => HashError::invalid(input, "not a hex string"),
    })
}

/// Perceptual fingerprint of an image.
///
/// Held as packed bytes; the bitstring and hex forms are views over them.
/// Two fingerprints can only be compared when their widths match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Box<[u8]>);

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.is_empty() {
            return Err(HashError::invalid("", "empty fingerprint"));
        }
        Ok(Fingerprint(bytes.into()))
    }

    pub fn from_bits(bits: &str) -> Result<Self, HashError> {
        let bytes = bits_to_bytes(bits)?;
        if bytes.is_empty() {
            return Err(HashError::invalid(bits, "empty fingerprint"));
        }
        Ok(Fingerprint(bytes.into_boxed_slice()))
    }

    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let bytes = hex_to_bytes(hex)?;
        if bytes.is_empty() {
            return Err(HashError::invalid(hex, "empty fingerprint"));
        }
        Ok(Fingerprint(bytes.into_boxed_slice()))
    }

    /// Width in bits.
    pub fn width(&self) -> usize {
        self.0.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bits(&self) -> String {
        bytes_to_bits(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Hamming distance: the number of differing bits.
    pub fn distance(&self, other: &Fingerprint) -> Result<u32, HashError> {
        if self.0.len() != other.0.len() {
            return Err(HashError::WidthMismatch {
                left: self.width(),
                right: other.width(),
            });
        }

        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Computes 64-bit DCT mean hashes (pHash) from encoded image bytes.
pub struct Fingerprinter {
    hasher: Hasher,
}

impl Fingerprinter {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();
        Self { hasher }
    }

    /// Decode `bytes` and fingerprint the image.
    /// Fails with [`HashError::Decode`] for corrupt or unsupported data.
    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
        let img = image::load_from_memory(bytes)?;
        let hash = self.hasher.hash_image(&img);
        Fingerprint::from_bytes(hash.as_bytes())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    /// Encode a small gradient PNG; `seed` shifts the pattern.
    pub(crate) fn png_bytes(seed: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(64, 64, |x, y| {
            let v = ((x * (seed + 1) + y * 3) % 256) as u8;
            Rgb([v, v.wrapping_mul(2), 255 - v])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_content_hash_is_md5_hex() {
        let hash = content_hash(b"Hello, World!");
        assert_eq!(hash, "65a8e27d8879283831b664bd8b7f0ad4");
        assert_eq!(hash, content_hash(b"Hello, World!"));
        assert_ne!(hash, content_hash(b"Hello, World?"));
    }

    #[test]
    fn test_hex_bits_round_trip() {
        let hex = "00ff10a5c3e7817e";
        let bits = hex_to_bits(hex).unwrap();
        assert_eq!(bits.len(), 64);
        assert!(bits.starts_with("0000000011111111"));
        assert_eq!(bits_to_hex(&bits).unwrap(), hex);

        let bits = "1010101000000001111111110101010111001100001100111000000100000001";
        assert_eq!(hex_to_bits(&bits_to_hex(bits).unwrap()).unwrap(), bits);

        // Widths other than 64 are fine as long as they are byte aligned
        assert_eq!(bits_to_hex("00000001").unwrap(), "01");
        assert_eq!(hex_to_bits("8001").unwrap(), "1000000000000001");
    }

    #[test]
    fn test_bits_rejects_bad_input() {
        assert!(matches!(
            bits_to_hex("0101"),
            Err(HashError::InvalidFingerprint { .. })
        ));
        assert!(bits_to_hex("0101010x").is_err());
        assert!(hex_to_bits("abc").is_err());
        assert!(hex_to_bits("zz").is_err());
        assert!(Fingerprint::from_hex("").is_err());
    }

    #[test]
    fn test_distance_properties() {
        let a = Fingerprint::from_hex("00000000000000ff").unwrap();
        let b = Fingerprint::from_hex("0f000000000000f0").unwrap();

        assert_eq!(a.distance(&a).unwrap(), 0);
        assert_eq!(a.distance(&b).unwrap(), 8);
        assert_eq!(a.distance(&b).unwrap(), b.distance(&a).unwrap());

        let zeros = Fingerprint::from_hex("0000000000000000").unwrap();
        let ones = Fingerprint::from_hex("ffffffffffffffff").unwrap();
        assert_eq!(zeros.distance(&ones).unwrap(), FINGERPRINT_BITS as u32);
    }

    #[test]
    fn test_distance_width_mismatch() {
        let a = Fingerprint::from_hex("00ff").unwrap();
        let b = Fingerprint::from_hex("00ff00ff").unwrap();

        match a.distance(&b) {
            Err(HashError::WidthMismatch { left, right }) => {
                assert_eq!(left, 16);
                assert_eq!(right, 32);
            }
            other => panic!("expected width mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_serde_uses_hex() {
        let fp = Fingerprint::from_bits(&"10".repeat(32)).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"aaaaaaaaaaaaaaaa\"");

        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
        assert_eq!(back.to_bits(), "10".repeat(32));
    }

    #[test]
    fn test_fingerprinter_produces_64_bits() {
        let fingerprinter = Fingerprinter::new();
        let bytes = png_bytes(1);

        let fp = fingerprinter.fingerprint(&bytes).unwrap();
        assert_eq!(fp.width(), FINGERPRINT_BITS);

        // Same pixels give the same fingerprint
        let again = fingerprinter.fingerprint(&bytes).unwrap();
        assert_eq!(fp.distance(&again).unwrap(), 0);
    }

    #[test]
    fn test_fingerprinter_rejects_garbage() {
        let fingerprinter = Fingerprinter::new();
        let result = fingerprinter.fingerprint(b"definitely not an image");
        assert!(matches!(result, Err(HashError::Decode(_))));
    }
}
