#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tonic::Status;

use crate::catalog::full_method_name;
use crate::error::{ContractError, ContractResult};
use crate::request_id::{CallContext, RequestId, MIN_REQUEST_ID_BYTES};

type Payload = Arc<dyn Any + Send + Sync>;

/// One observed outbound unary call.
pub struct CallRecord {
    full_method: String,
    request: Payload,
    response: Option<Payload>,
    error: Option<Status>,
    sequence: u64,
}

impl CallRecord {
    pub fn new<Req, Resp>(
        full_method: impl Into<String>,
        request: Req,
        response: Option<Resp>,
        error: Option<Status>,
        sequence: u64,
    ) -> Self
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
    {
        Self {
            full_method: full_method.into(),
            request: Arc::new(request),
            response: response.map(|r| Arc::new(r) as Payload),
            error,
            sequence,
        }
    }

    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request<T: Any>(&self) -> Option<&T> {
        self.request.downcast_ref::<T>()
    }

    /// `None` when the call failed before producing a response or when `T`
    /// is not the recorded response type.
    pub fn response<T: Any>(&self) -> Option<&T> {
        self.response.as_ref()?.downcast_ref::<T>()
    }

    pub fn error(&self) -> Option<&Status> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("full_method", &self.full_method)
            .field("sequence", &self.sequence)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A snapshot set of call records. Owns its own vector, so nothing done to it
/// reaches the store.
#[derive(Debug, Clone, Default)]
pub struct Calls(Vec<Arc<CallRecord>>);

impl Calls {
    pub fn successful(&self) -> Calls {
        self.retain(CallRecord::is_success)
    }

    pub fn failed(&self) -> Calls {
        self.retain(|call| !call.is_success())
    }

    /// Ascending by each record's own sequence number.
    pub fn ordered(&self) -> Calls {
        let mut calls = self.0.clone();
        calls.sort_by_key(|call| call.sequence);
        Calls(calls)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> ContractResult<&CallRecord> {
        self.0.first().map(Arc::as_ref).ok_or(ContractError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> {
        self.0.iter().map(Arc::as_ref)
    }

    fn retain(&self, keep: impl Fn(&CallRecord) -> bool) -> Calls {
        Calls(self.0.iter().filter(|call| keep(call)).cloned().collect())
    }
}

impl FromIterator<CallRecord> for Calls {
    fn from_iter<I: IntoIterator<Item = CallRecord>>(iter: I) -> Self {
        Calls(iter.into_iter().map(Arc::new).collect())
    }
}

#[derive(Debug, Default)]
struct Segment {
    calls: HashMap<String, Vec<Arc<CallRecord>>>,
    next_sequence: u64,
}

/// Request-scoped ledger of outbound calls, keyed by request identity then by
/// fully-qualified method. One lock covers the whole store and is only held
/// for the map operation itself.
#[derive(Debug)]
pub struct CallHistoryStore {
    segments: RwLock<HashMap<RequestId, Segment>>,
    request_id_bytes: usize,
}

impl Default for CallHistoryStore {
    fn default() -> Self {
        Self::new(MIN_REQUEST_ID_BYTES)
    }
}

impl CallHistoryStore {
    pub fn new(request_id_bytes: usize) -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            request_id_bytes,
        }
    }

    /// Generates an identity that no in-flight request holds and reserves an
    /// empty segment for it. The check and the reservation happen under one
    /// write lock, so concurrent mints can never hand out the same identity.
    pub fn mint(&self) -> ContractResult<RequestId> {
        let mut segments = self
            .segments
            .write()
            .map_err(|_| ContractError::HistoryPoisoned)?;
        loop {
            let request_id = RequestId::random(self.request_id_bytes)?;
            match segments.entry(request_id) {
                Entry::Vacant(slot) => {
                    let request_id = slot.key().clone();
                    slot.insert(Segment::default());
                    return Ok(request_id);
                }
                Entry::Occupied(_) => {
                    tracing::debug!("request id collision; regenerating");
                }
            }
        }
    }

    /// Appends a call under the identity carried by `ctx`. Calls made outside
    /// any tracked request are ignored.
    pub fn record<Req, Resp>(
        &self,
        ctx: &CallContext,
        full_method: &str,
        request: Req,
        response: Option<Resp>,
        error: Option<Status>,
    ) where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
    {
        let Some(request_id) = ctx.request_id() else {
            return;
        };
        let request: Payload = Arc::new(request);
        let response = response.map(|r| Arc::new(r) as Payload);

        let Ok(mut segments) = self.segments.write() else {
            tracing::error!(
                request_id = %request_id,
                full_method = %full_method,
                "call history lock poisoned; dropping call record"
            );
            return;
        };
        let segment = segments.entry(request_id.clone()).or_default();
        let record = CallRecord {
            full_method: full_method.to_string(),
            request,
            response,
            error,
            sequence: segment.next_sequence,
        };
        segment.next_sequence += 1;
        segment
            .calls
            .entry(record.full_method.clone())
            .or_default()
            .push(Arc::new(record));
    }

    /// Drops the identity's segment and sequence counter. Returns whether a
    /// segment existed; purging twice is a no-op.
    pub fn purge(&self, request_id: &RequestId) -> bool {
        match self.segments.write() {
            Ok(mut segments) => segments.remove(request_id).is_some(),
            Err(_) => {
                tracing::error!(
                    request_id = %request_id,
                    "call history lock poisoned; segment not purged"
                );
                false
            }
        }
    }

    /// Drops the identity's segment only if no call was recorded under it.
    pub fn purge_if_empty(&self, request_id: &RequestId) -> bool {
        let Ok(mut segments) = self.segments.write() else {
            tracing::error!(
                request_id = %request_id,
                "call history lock poisoned; segment not purged"
            );
            return false;
        };
        match segments.entry(request_id.clone()) {
            Entry::Occupied(slot) if slot.get().calls.is_empty() => {
                slot.remove();
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.segments
            .read()
            .map(|segments| segments.contains_key(request_id))
            .unwrap_or(false)
    }

    /// Number of identities currently holding a segment.
    pub fn active_requests(&self) -> usize {
        self.segments
            .read()
            .map(|segments| segments.len())
            .unwrap_or(0)
    }

    pub fn recorded_calls(&self, request_id: &RequestId) -> usize {
        self.read_segment(request_id, |segment| {
            segment.calls.values().map(Vec::len).sum::<usize>()
        })
        .unwrap_or(0)
    }

    pub fn view(self: &Arc<Self>, request_id: RequestId) -> CallHistory {
        CallHistory {
            store: Arc::clone(self),
            request_id: Some(request_id),
        }
    }

    fn read_segment<R>(&self, request_id: &RequestId, read: impl FnOnce(&Segment) -> R) -> Option<R> {
        let Ok(segments) = self.segments.read() else {
            tracing::error!(
                request_id = %request_id,
                "call history lock poisoned; reading empty history"
            );
            return None;
        };
        segments.get(request_id).map(read)
    }
}

/// Read-only view of one request's call history, handed to postconditions.
#[derive(Debug, Clone)]
pub struct CallHistory {
    store: Arc<CallHistoryStore>,
    request_id: Option<RequestId>,
}

impl CallHistory {
    /// View bound to no identity; every query is empty.
    pub(crate) fn detached(store: Arc<CallHistoryStore>) -> Self {
        Self {
            store,
            request_id: None,
        }
    }

    /// Every recorded call for this request, in no particular order.
    pub fn all(&self) -> Calls {
        self.query(|segment| segment.calls.values().flatten().cloned().collect())
    }

    /// Calls to `/service_name/method_name`.
    pub fn filter(&self, service_name: &str, method_name: &str) -> Calls {
        let full_method = full_method_name(service_name, method_name);
        self.query(|segment| {
            segment
                .calls
                .get(&full_method)
                .cloned()
                .unwrap_or_default()
        })
    }

    fn query(&self, select: impl FnOnce(&Segment) -> Vec<Arc<CallRecord>>) -> Calls {
        let Some(request_id) = &self.request_id else {
            return Calls::default();
        };
        Calls(self.store.read_segment(request_id, select).unwrap_or_default())
    }
}
