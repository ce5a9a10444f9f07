//! Remote Cache Protocol
//!
//! Request and response messages exchanged between cache clients and the
//! cache server. Every message travels as a JSON [`Envelope`]; the
//! correlation id pairs a response with its request.
//!
//! Value requests address the shared partition of their cache key. Private
//! values never leave the process that wrote them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{CacheKey, Identifier};
use crate::error::Result;

/// Correlation id of a request that could not be decoded
pub const UNKNOWN_CORRELATION: u64 = 0;

/// Request from a cache client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRequest<K> {
    ResolveIdentifier {
        key: K,
    },
    ResolveIdentifiers {
        keys: Vec<K>,
    },
    FetchValue {
        cache_key: CacheKey,
        id: Identifier,
    },
    FetchValues {
        cache_key: CacheKey,
        ids: Vec<Identifier>,
    },
    StoreValue {
        cache_key: CacheKey,
        id: Identifier,
        data: Bytes,
    },
    StoreValues {
        cache_key: CacheKey,
        values: Vec<(Identifier, Bytes)>,
    },
    /// Delete both partitions of a cache key
    Purge {
        cache_key: CacheKey,
    },
}

impl<K> CacheRequest<K> {
    /// Request type, used as a metrics label and in logs
    pub fn kind(&self) -> &'static str {
        match self {
            CacheRequest::ResolveIdentifier { .. } => "resolve_identifier",
            CacheRequest::ResolveIdentifiers { .. } => "resolve_identifiers",
            CacheRequest::FetchValue { .. } => "fetch_value",
            CacheRequest::FetchValues { .. } => "fetch_values",
            CacheRequest::StoreValue { .. } => "store_value",
            CacheRequest::StoreValues { .. } => "store_values",
            CacheRequest::Purge { .. } => "purge",
        }
    }
}

/// Response from the cache server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheResponse<K> {
    Identifier {
        id: Identifier,
    },
    /// One entry per distinct requested key
    Identifiers {
        ids: Vec<(K, Identifier)>,
    },
    Value {
        data: Option<Bytes>,
    },
    /// Absent identifiers are omitted
    Values {
        values: Vec<(Identifier, Bytes)>,
    },
    Stored,
    Purged,
    Failure {
        message: String,
    },
}

impl<K> CacheResponse<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheResponse::Identifier { .. } => "identifier",
            CacheResponse::Identifiers { .. } => "identifiers",
            CacheResponse::Value { .. } => "value",
            CacheResponse::Values { .. } => "values",
            CacheResponse::Stored => "stored",
            CacheResponse::Purged => "purged",
            CacheResponse::Failure { .. } => "failure",
        }
    }
}

/// Message wrapper carrying the correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub correlation_id: u64,
    pub body: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(correlation_id: u64, body: T) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ValueSpecification;
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[test]
    fn test_store_values_survives_encoding() {
        let request: CacheRequest<ValueSpecification> = CacheRequest::StoreValues {
            cache_key: CacheKey::new("cycle-1", "ConfigA"),
            values: vec![(7, Bytes::from_static(&[1, 2])), (8, Bytes::new())],
        };
        let frame = Envelope::new(42, request.clone()).encode().unwrap();
        let decoded = Envelope::<CacheRequest<ValueSpecification>>::decode(&frame).unwrap();

        assert_eq!(decoded.correlation_id, 42);
        assert_eq!(decoded.body, request);
    }

    #[test]
    fn test_wire_shape_is_tagged_by_type() {
        let frame = Envelope::new(
            1,
            CacheRequest::ResolveIdentifier {
                key: ValueSpecification::new("PV", "T"),
            },
        )
        .encode()
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();

        assert_eq!(json["correlation_id"], 1);
        assert_eq!(json["body"]["resolve_identifier"]["key"]["value_name"], "PV");
    }

    #[test]
    fn test_absent_value_response() {
        let frame = Envelope::new(3, CacheResponse::<ValueSpecification>::Value { data: None })
            .encode()
            .unwrap();
        let decoded = Envelope::<CacheResponse<ValueSpecification>>::decode(&frame).unwrap();
        assert_eq!(decoded.body, CacheResponse::Value { data: None });
        assert_eq!(decoded.body.kind(), "value");
    }

    #[test]
    fn test_garbage_frame_is_error() {
        assert_matches!(
            Envelope::<CacheRequest<ValueSpecification>>::decode(b"\x00\x01"),
            Err(Error::Serialization(_))
        );
    }
}
