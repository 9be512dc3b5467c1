use thiserror::Error;

pub const DEFAULT_EMBEDDING_DIM: usize = 1536;
pub const ZERO_NORM_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    #[error("vector is empty")]
    Empty,

    #[error("expected {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("unparseable value {token:?} at index {index}")]
    Unparseable { index: usize, token: String },

    #[error("blob length {len} is not {expected_dim} little-endian f32 values")]
    BlobLength { len: usize, expected_dim: usize },

    #[error("unsupported vector encoding: {0}")]
    UnsupportedEncoding(String),
}

/// A component vector as it came off the store, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedVector {
    Blob(Vec<u8>),
    Text(String),
    Values(Vec<f64>),
    Unsupported(String),
}

impl EncodedVector {
    pub fn decode(&self, expected_dim: usize) -> Result<Vec<f32>, VectorError> {
        let values = match self {
            Self::Blob(blob) => decode_embedding_blob(blob, expected_dim)?,
            Self::Text(text) => parse_vector_text(text)?,
            Self::Values(values) => values.iter().map(|value| *value as f32).collect(),
            Self::Unsupported(kind) => return Err(VectorError::UnsupportedEncoding(kind.clone())),
        };
        validate_vector(&values, expected_dim)?;
        Ok(values)
    }
}

pub fn validate_vector(values: &[f32], expected_dim: usize) -> Result<(), VectorError> {
    if values.is_empty() {
        return Err(VectorError::Empty);
    }
    if values.len() != expected_dim {
        return Err(VectorError::DimensionMismatch {
            expected: expected_dim,
            actual: values.len(),
        });
    }
    if let Some(index) = values.iter().position(|value| !value.is_finite()) {
        return Err(VectorError::NonFinite { index });
    }
    Ok(())
}

/// Parses the pgvector text form `[0.1,-0.2,...]`. Brackets are optional.
pub fn parse_vector_text(raw: &str) -> Result<Vec<f32>, VectorError> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|value| value.strip_suffix(']'))
        .unwrap_or(trimmed)
        .trim();

    if inner.is_empty() {
        return Err(VectorError::Empty);
    }

    inner
        .split(',')
        .enumerate()
        .map(|(index, token)| {
            let token = token.trim();
            token
                .parse::<f32>()
                .map_err(|_| VectorError::Unparseable {
                    index,
                    token: token.to_string(),
                })
        })
        .collect()
}

pub fn format_vector_text(values: &[f32]) -> String {
    let body = values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<String>>()
        .join(",");
    format!("[{body}]")
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Result<Vec<f32>, VectorError> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return Err(VectorError::BlobLength {
            len: blob.len(),
            expected_dim,
        });
    }

    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|value| value * value).sum::<f64>().sqrt()
}

/// Scales to unit length in place. Returns false and leaves the values alone
/// when the norm is numerically zero.
pub fn l2_normalize(values: &mut [f64]) -> bool {
    let norm = l2_norm(values);
    if norm <= ZERO_NORM_EPSILON {
        return false;
    }

    for value in values.iter_mut() {
        *value /= norm;
    }
    true
}
