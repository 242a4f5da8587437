//! Versioned model blobs: bincode (serde mode) inside zstd.

use bincode::config::standard;
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zstd::{decode_all, encode_all};

use crate::{AnomalyError, DetectorMethod};

pub const SCHEMA_VERSION: u32 = 1;
const MAGIC: &str = "medguard-detector";
const ZSTD_LEVEL: i32 = 3;

/// Metadata stored ahead of every model payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobHeader {
    pub method: DetectorMethod,
    pub schema_version: u32,
    pub extractor_version: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: String,
    header: BlobHeader,
    payload: Vec<u8>,
}

pub(crate) fn encode<T: Serialize>(
    method: DetectorMethod,
    extractor_version: Option<&str>,
    model: &T,
) -> Result<Vec<u8>, AnomalyError> {
    let envelope = Envelope {
        magic: MAGIC.to_string(),
        header: BlobHeader {
            method,
            schema_version: SCHEMA_VERSION,
            extractor_version: extractor_version.map(str::to_string),
        },
        payload: encode_to_vec(model, standard())?,
    };
    let raw = encode_to_vec(&envelope, standard())?;
    Ok(encode_all(raw.as_slice(), ZSTD_LEVEL)?)
}

fn open(bytes: &[u8]) -> Result<Envelope, AnomalyError> {
    let raw = decode_all(bytes)?;
    let (envelope, _): (Envelope, usize) = decode_from_slice(&raw, standard())?;
    if envelope.magic != MAGIC {
        return Err(AnomalyError::Persistence("not a detector blob".into()));
    }
    if envelope.header.schema_version != SCHEMA_VERSION {
        return Err(AnomalyError::Persistence(format!(
            "unsupported schema version {} (expected {SCHEMA_VERSION})",
            envelope.header.schema_version
        )));
    }
    Ok(envelope)
}

/// Read only the header of a blob.
pub fn read_header(bytes: &[u8]) -> Result<BlobHeader, AnomalyError> {
    open(bytes).map(|e| e.header)
}

pub(crate) fn decode<T: DeserializeOwned>(
    expected: DetectorMethod,
    bytes: &[u8],
) -> Result<T, AnomalyError> {
    let envelope = open(bytes)?;
    if envelope.header.method != expected {
        return Err(AnomalyError::Persistence(format!(
            "blob holds a {} model, expected {expected}",
            envelope.header.method
        )));
    }
    let (model, _) = decode_from_slice(&envelope.payload, standard())?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Toy {
        values: Vec<f32>,
    }

    #[test]
    fn envelope_roundtrip_preserves_bits() {
        let toy = Toy {
            values: vec![0.1, f32::MIN_POSITIVE, -3.5],
        };
        let bytes = encode(DetectorMethod::Kmeans, Some("resnet18/224"), &toy).unwrap();
        let header = read_header(&bytes).unwrap();
        assert_eq!(header.method, DetectorMethod::Kmeans);
        assert_eq!(header.extractor_version.as_deref(), Some("resnet18/224"));
        let back: Toy = decode(DetectorMethod::Kmeans, &bytes).unwrap();
        assert_eq!(back, toy);
    }

    #[test]
    fn wrong_method_is_rejected() {
        let bytes = encode(DetectorMethod::Kmeans, None, &Toy { values: vec![] }).unwrap();
        let err = decode::<Toy>(DetectorMethod::Autoencoder, &bytes).unwrap_err();
        assert!(matches!(err, AnomalyError::Persistence(_)));
    }

    #[test]
    fn corrupt_bytes_are_rejected() {
        assert!(matches!(
            read_header(b"definitely not zstd"),
            Err(AnomalyError::Persistence(_))
        ));
        let bytes = encode_all(&b"garbage payload"[..], 3).unwrap();
        assert!(matches!(read_header(&bytes), Err(AnomalyError::Persistence(_))));
    }
}
