//! Write forwarding
//!
//! Followers never append. They hand writes (and, while catching up, ID
//! lookups) to the primary through a [`PrimaryForwarder`]. Failures of the
//! transport surface as `PrimaryUnreachable`, which callers retry; errors
//! raised by the primary itself come back as their original kind.

use crate::compatibility::ModificationRecord;
use crate::error::{SchemaError, SchemaResult};
use crate::types::{
    nullable_references, CompatibilityLevel, Mode, Schema, SchemaId, SchemaReference, SchemaType,
    SchemaVersion, Subject,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use crate::registry::SchemaRegistry;

/// A request executed on the primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForwardRequest {
    Register {
        subject: Subject,
        #[serde(default)]
        schema_type: SchemaType,
        schema: String,
        #[serde(default, deserialize_with = "nullable_references")]
        references: Vec<SchemaReference>,
    },
    DeleteVersion {
        subject: Subject,
        version: SchemaVersion,
        #[serde(default)]
        permanent: bool,
    },
    DeleteSubject {
        subject: Subject,
        #[serde(default)]
        permanent: bool,
    },
    SetConfig {
        subject: Option<Subject>,
        compatibility: CompatibilityLevel,
    },
    DeleteConfig {
        subject: Subject,
    },
    SetMode {
        subject: Option<Subject>,
        mode: Mode,
    },
    GetSchemaById {
        id: SchemaId,
    },
}

impl ForwardRequest {
    /// Operation name for logs and metrics
    pub fn operation(&self) -> &'static str {
        match self {
            ForwardRequest::Register { .. } => "register",
            ForwardRequest::DeleteVersion { .. } => "delete_version",
            ForwardRequest::DeleteSubject { .. } => "delete_subject",
            ForwardRequest::SetConfig { .. } => "set_config",
            ForwardRequest::DeleteConfig { .. } => "delete_config",
            ForwardRequest::SetMode { .. } => "set_mode",
            ForwardRequest::GetSchemaById { .. } => "get_schema_by_id",
        }
    }
}

/// Result of a forwarded request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ForwardResponse {
    Registered {
        id: SchemaId,
        version: u32,
        created: bool,
    },
    Version {
        version: u32,
    },
    Versions {
        versions: Vec<u32>,
    },
    Config {
        compatibility: Option<CompatibilityLevel>,
    },
    Mode {
        mode: Mode,
    },
    Schema {
        schema: Schema,
    },
    Error {
        error_code: u32,
        message: String,
        /// Structured records of an incompatibility error
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        incompatibilities: Vec<ModificationRecord>,
    },
}

impl ForwardResponse {
    /// Wire form of a failure on the primary
    pub fn error(err: &SchemaError) -> Self {
        let incompatibilities = match err {
            SchemaError::Incompatible(records) => records.clone(),
            _ => Vec::new(),
        };
        ForwardResponse::Error {
            error_code: err.error_code(),
            message: err.to_string(),
            incompatibilities,
        }
    }

    /// Turn an error response back into an error
    pub fn into_result(self) -> SchemaResult<Self> {
        match self {
            ForwardResponse::Error {
                incompatibilities, ..
            } if !incompatibilities.is_empty() => Err(SchemaError::Incompatible(incompatibilities)),
            ForwardResponse::Error {
                error_code,
                message,
                ..
            } => Err(SchemaError::from_code(error_code, message)),
            other => Ok(other),
        }
    }
}

/// Unexpected response shape for a request
pub(crate) fn unexpected(request: &str, response: &ForwardResponse) -> SchemaError {
    SchemaError::Internal(format!(
        "unexpected response to forwarded {}: {:?}",
        request, response
    ))
}

/// Transport to the primary
#[async_trait]
pub trait PrimaryForwarder: Send + Sync {
    /// Execute `request` on the node at `primary`
    async fn forward(&self, primary: &str, request: ForwardRequest) -> SchemaResult<ForwardResponse>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Posts requests as JSON to `{primary}/internal/forward`
#[cfg(feature = "http-forward")]
pub struct HttpForwarder {
    client: reqwest::Client,
}

#[cfg(feature = "http-forward")]
impl HttpForwarder {
    pub fn new(timeout: std::time::Duration) -> SchemaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchemaError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http-forward")]
#[async_trait]
impl PrimaryForwarder for HttpForwarder {
    async fn forward(&self, primary: &str, request: ForwardRequest) -> SchemaResult<ForwardResponse> {
        let url = format!("{}/internal/forward", primary.trim_end_matches('/'));
        let unreachable = |e: reqwest::Error| SchemaError::PrimaryUnreachable {
            primary: primary.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(unreachable)?;
        let status = response.status();
        let body = response.bytes().await.map_err(unreachable)?;
        decode_reply(primary, status, &body)
    }
}

/// Decode a reply from `primary`.
///
/// Error statuses without a forward response body come from whatever sits
/// between the nodes and count as the primary being unreachable.
#[cfg(feature = "http-forward")]
fn decode_reply(
    primary: &str,
    status: reqwest::StatusCode,
    body: &[u8],
) -> SchemaResult<ForwardResponse> {
    let unreachable = |reason: String| SchemaError::PrimaryUnreachable {
        primary: primary.to_string(),
        reason,
    };
    let reply = serde_json::from_slice::<ForwardResponse>(body);
    if !status.is_success() {
        return match reply {
            Ok(reply @ ForwardResponse::Error { .. }) => reply.into_result(),
            _ => Err(unreachable(format!("HTTP {}", status))),
        };
    }
    reply
        .map_err(|e| unreachable(format!("HTTP {}: malformed reply: {}", status, e)))?
        .into_result()
}

// ============================================================================
// In-process
// ============================================================================

/// Routes requests between registries hosted in the same process
#[derive(Default)]
pub struct LocalForwarder {
    nodes: DashMap<String, Weak<SchemaRegistry>>,
}

impl LocalForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `registry` reachable at `url`
    pub fn add(&self, url: impl Into<String>, registry: &Arc<SchemaRegistry>) {
        self.nodes.insert(url.into(), Arc::downgrade(registry));
    }

    /// Make `url` unreachable
    pub fn remove(&self, url: &str) {
        self.nodes.remove(url);
    }
}

#[async_trait]
impl PrimaryForwarder for LocalForwarder {
    async fn forward(&self, primary: &str, request: ForwardRequest) -> SchemaResult<ForwardResponse> {
        let registry = self
            .nodes
            .get(primary)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| SchemaError::PrimaryUnreachable {
                primary: primary.to_string(),
                reason: "no such node".to_string(),
            })?;
        // Round-trip through the wire form so both transports behave alike
        registry
            .execute_forwarded(request)
            .await
            .unwrap_or_else(|e| ForwardResponse::error(&e))
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = ForwardRequest::Register {
            subject: Subject::new("orders-value"),
            schema_type: SchemaType::Protobuf,
            schema: "syntax = \"proto3\";".to_string(),
            references: vec![SchemaReference::latest("common.proto", "common")],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], "register");
        assert_eq!(json["references"][0]["version"], -1);

        let parsed: ForwardRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_null_references_accepted() {
        let parsed: ForwardRequest = serde_json::from_str(
            r#"{"op":"register","subject":"s","schema":"{}","schema_type":"JSON","references":null}"#,
        )
        .unwrap();
        match parsed {
            ForwardRequest::Register { references, .. } => assert!(references.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_rebuilds_error() {
        let response = ForwardResponse::error(&SchemaError::SubjectNotFound("s".into()));
        let json = serde_json::to_string(&response).unwrap();
        let parsed: ForwardResponse = serde_json::from_str(&json).unwrap();
        let err = parsed.into_result().unwrap_err();
        assert!(matches!(err, SchemaError::SubjectNotFound(_)));
    }

    #[cfg(feature = "http-forward")]
    #[test]
    fn test_error_status_without_reply_is_unreachable() {
        let err = decode_reply(
            "http://a:8081",
            reqwest::StatusCode::BAD_GATEWAY,
            b"<html>bad gateway</html>",
        )
        .unwrap_err();
        match &err {
            SchemaError::PrimaryUnreachable { primary, reason } => {
                assert_eq!(primary, "http://a:8081");
                assert!(reason.contains("502"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_retriable());

        // an error reply from the primary keeps its kind whatever the status
        let body = serde_json::to_vec(&ForwardResponse::error(&SchemaError::SubjectNotFound("s".into())))
            .unwrap();
        let err = decode_reply("http://a:8081", reqwest::StatusCode::NOT_FOUND, &body).unwrap_err();
        assert!(matches!(err, SchemaError::SubjectNotFound(_)));
    }

    #[cfg(feature = "http-forward")]
    #[tokio::test]
    async fn test_http_forwarder_reports_proxy_status() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: 11\r\nconnection: close\r\n\r\nbad gateway",
                )
                .await
                .unwrap();
        });

        let forwarder = HttpForwarder::new(std::time::Duration::from_secs(5)).unwrap();
        let err = forwarder
            .forward(
                &format!("http://{}", addr),
                ForwardRequest::GetSchemaById { id: SchemaId(1) },
            )
            .await
            .unwrap_err();
        match err {
            SchemaError::PrimaryUnreachable { reason, .. } => {
                assert!(reason.contains("502"), "{}", reason)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_node_is_unreachable() {
        let forwarder = LocalForwarder::new();
        let err = forwarder
            .forward("http://gone:8081", ForwardRequest::GetSchemaById { id: SchemaId(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::PrimaryUnreachable { .. }));
        assert!(err.is_retriable());
    }
}
