#![forbid(unsafe_code)]

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tonic::Request;

use crate::error::{ContractError, ContractResult};

pub const MIN_REQUEST_ID_BYTES: usize = 10;
pub const MAX_REQUEST_ID_BYTES: usize = 64;

/// Opaque per-inbound-call token scoping call history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// URL-safe base64 of `len` bytes from the OS CSPRNG, clamped to
    /// `MIN_REQUEST_ID_BYTES..=MAX_REQUEST_ID_BYTES`.
    pub(crate) fn random(len: usize) -> ContractResult<Self> {
        let mut bytes = vec![0u8; len.clamp(MIN_REQUEST_ID_BYTES, MAX_REQUEST_ID_BYTES)];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| ContractError::IdentityUnavailable(err.to_string()))?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution context of one RPC. The identity slot is private to this crate:
/// user code can forward a context but never forge or overwrite its identity.
///
/// Every outbound call made while serving a request, including calls issued
/// from spawned tasks, must be built from a clone of the inbound context for
/// the call to be attributed to that request.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    request_id: Option<RequestId>,
}

impl CallContext {
    /// Context with no request identity; calls made under it are not recorded.
    pub fn background() -> Self {
        Self::default()
    }

    pub(crate) fn tracked(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
        }
    }

    pub(crate) fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn is_tracked(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn attach<T>(&self, request: &mut Request<T>) {
        request.extensions_mut().insert(self.clone());
    }

    pub fn from_request<T>(request: &Request<T>) -> Self {
        request
            .extensions()
            .get::<CallContext>()
            .cloned()
            .unwrap_or_default()
    }

    /// Wraps an outbound message in a request carrying this context.
    pub fn outbound<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        self.attach(&mut request);
        request
    }
}
