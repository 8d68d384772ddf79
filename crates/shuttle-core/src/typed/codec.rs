//! Payload codec - JobKind と bytes の相互変換（JSON）

use super::kind::JobKind;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode {job_type}: {source}")]
    Encode {
        job_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode {job_type}: {source}")]
    Decode {
        job_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode_payload<T: JobKind>(job: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(job).map_err(|source| CodecError::Encode {
        job_type: T::TYPE,
        source,
    })
}

pub fn decode_payload<T: JobKind>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
        job_type: T::TYPE,
        source,
    })
}
