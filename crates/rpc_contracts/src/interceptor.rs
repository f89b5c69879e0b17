#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tonic::{Request, Response, Status};

use crate::catalog::{ContractBuilder, ContractCatalog, ServiceContract, UnaryContract};
use crate::condition::{ConditionArgs, ConditionKind};
use crate::config::ContractConfig;
use crate::error::{ContractError, ContractResult, ContractViolation};
use crate::history::{CallHistory, CallHistoryStore};
use crate::request_id::{CallContext, RequestId};

/// Bounds on request/response messages the server interceptor can check.
/// Every prost-generated message satisfies them.
pub trait RpcMessage: Any + Debug + Default + Clone + Send + Sync {}

impl<T> RpcMessage for T where T: Any + Debug + Default + Clone + Send + Sync {}

/// One detected pre- or postcondition violation.
#[derive(Debug, Clone, Copy)]
pub struct ViolationReport<'a> {
    pub kind: ConditionKind,
    pub full_method: &'a str,
    pub violation: &'a ContractViolation,
    pub request: &'a dyn Debug,
    /// Postconditions only.
    pub response: Option<&'a dyn Debug>,
    /// Postconditions only; the handler's own error, if any.
    pub handler_error: Option<&'a Status>,
}

pub type ViolationSink = Arc<dyn Fn(&ViolationReport<'_>) + Send + Sync>;

/// Sink emitting one `warn` event per violation.
pub fn tracing_sink() -> ViolationSink {
    Arc::new(|report: &ViolationReport<'_>| match report.kind {
        ConditionKind::Pre => tracing::warn!(
            full_method = %report.full_method,
            violation = %report.violation,
            request = ?report.request,
            "precondition violated"
        ),
        ConditionKind::Post => match report.response {
            Some(response) => tracing::warn!(
                full_method = %report.full_method,
                violation = %report.violation,
                request = ?report.request,
                response = ?response,
                handler_error = ?report.handler_error,
                "postcondition violated"
            ),
            None => tracing::warn!(
                full_method = %report.full_method,
                violation = %report.violation,
                request = ?report.request,
                handler_error = ?report.handler_error,
                "postcondition violated"
            ),
        },
    })
}

enum CatalogState {
    Building(ContractBuilder),
    Serving(Arc<ContractCatalog>),
}

/// Contracts declared for a gRPC server plus the call history they inspect.
///
/// Register every service contract first, then build the server interceptor;
/// building it freezes the catalog for good.
pub struct ServerContract {
    config: ContractConfig,
    sink: ViolationSink,
    history: Arc<CallHistoryStore>,
    state: Mutex<CatalogState>,
}

impl ServerContract {
    pub fn new(sink: ViolationSink) -> Self {
        Self::with_config(ContractConfig::mvp_v1(), sink)
    }

    pub fn with_config(config: ContractConfig, sink: ViolationSink) -> Self {
        Self {
            config,
            sink,
            history: Arc::new(CallHistoryStore::new(config.request_id_bytes)),
            state: Mutex::new(CatalogState::Building(ContractBuilder::new())),
        }
    }

    pub fn config(&self) -> &ContractConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<CallHistoryStore> {
        &self.history
    }

    pub fn register_service_contract(&self, service: ServiceContract) -> ContractResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            CatalogState::Building(builder) => builder.register(service),
            CatalogState::Serving(_) => Err(ContractError::AlreadyServing),
        }
    }

    pub fn is_serving(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(&*state, CatalogState::Serving(_))
    }

    /// Freezes the catalog on first use. Later calls hand out interceptors
    /// over the same frozen catalog.
    pub fn server_interceptor(&self) -> ServerInterceptor {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let catalog = match mem::replace(&mut *state, CatalogState::Serving(Arc::default())) {
            CatalogState::Serving(catalog) => catalog,
            CatalogState::Building(builder) => {
                let catalog = Arc::new(builder.build());
                tracing::info!(contracts = catalog.len(), "rpc contract catalog frozen");
                catalog
            }
        };
        *state = CatalogState::Serving(Arc::clone(&catalog));
        ServerInterceptor {
            config: self.config,
            catalog,
            history: Arc::clone(&self.history),
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn client_interceptor(&self) -> ClientInterceptor {
        ClientInterceptor {
            history: Arc::clone(&self.history),
        }
    }
}

/// Purges the request's history when dropped, including when the interceptor
/// future is cancelled mid-handler.
struct PurgeGuard {
    history: Arc<CallHistoryStore>,
    request_id: Option<RequestId>,
}

impl PurgeGuard {
    fn disarm(&mut self) {
        self.request_id = None;
    }
}

impl Drop for PurgeGuard {
    fn drop(&mut self) {
        if let Some(request_id) = self.request_id.take() {
            self.history.purge(&request_id);
        }
    }
}

#[derive(Clone)]
pub struct ServerInterceptor {
    config: ContractConfig,
    catalog: Arc<ContractCatalog>,
    history: Arc<CallHistoryStore>,
    sink: ViolationSink,
}

impl ServerInterceptor {
    pub fn catalog(&self) -> &ContractCatalog {
        &self.catalog
    }

    /// Runs one inbound unary call through the contract checks.
    ///
    /// The handler receives the request with a fresh [`CallContext`] in its
    /// extensions. Its response or error is returned unchanged; violations
    /// only reach the sink.
    pub async fn intercept<Req, Resp, H, Fut>(
        &self,
        mut request: Request<Req>,
        full_method: &str,
        handler: H,
    ) -> Result<Response<Resp>, Status>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        H: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        if !self.config.enabled {
            return handler(request).await;
        }

        let request_id = match self.history.mint() {
            Ok(request_id) => Some(request_id),
            Err(err) => {
                tracing::error!(
                    full_method = %full_method,
                    error = %err,
                    "request identity unavailable; call history not tracked"
                );
                None
            }
        };
        let mut guard = PurgeGuard {
            history: Arc::clone(&self.history),
            request_id: request_id.clone(),
        };
        if let Some(request_id) = &request_id {
            CallContext::tracked(request_id.clone()).attach(&mut request);
        }

        let contract = self.catalog.resolve(full_method).cloned();
        let message = contract.as_ref().map(|_| request.get_ref().clone());
        if let (Some(contract), Some(message)) = (&contract, &message) {
            self.check_preconditions(full_method, contract, message);
        }

        let outcome = handler(request).await;

        if let (Some(contract), Some(message)) = (&contract, &message) {
            let calls = match &request_id {
                Some(request_id) => self.history.view(request_id.clone()),
                None => CallHistory::detached(Arc::clone(&self.history)),
            };
            self.check_postconditions(full_method, contract, message, &outcome, &calls);
        }
        if contract.is_none() && !self.config.purge_unmatched {
            // keep only segments that outbound calls actually wrote to
            if let Some(request_id) = &request_id {
                self.history.purge_if_empty(request_id);
            }
            guard.disarm();
        }
        drop(guard);
        outcome
    }

    fn check_preconditions<Req: RpcMessage>(
        &self,
        full_method: &str,
        contract: &UnaryContract,
        request: &Req,
    ) {
        let args = ConditionArgs::Pre { request };
        for condition in contract.preconditions() {
            if let Some(violation) = condition.evaluate(&args) {
                self.report(&ViolationReport {
                    kind: ConditionKind::Pre,
                    full_method,
                    violation: &violation,
                    request,
                    response: None,
                    handler_error: None,
                });
            }
        }
    }

    fn check_postconditions<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        full_method: &str,
        contract: &UnaryContract,
        request: &Req,
        outcome: &Result<Response<Resp>, Status>,
        calls: &CallHistory,
    ) {
        // Conditions always see a response instance; a failed handler yields
        // the zero value.
        let zero;
        let (response, handler_error) = match outcome {
            Ok(response) => (response.get_ref(), None),
            Err(status) => {
                zero = Resp::default();
                (&zero, Some(status))
            }
        };
        let args = ConditionArgs::Post {
            response,
            error: handler_error,
            request,
            calls,
        };
        for condition in contract.postconditions() {
            if let Some(violation) = condition.evaluate(&args) {
                self.report(&ViolationReport {
                    kind: ConditionKind::Post,
                    full_method,
                    violation: &violation,
                    request,
                    response: Some(response),
                    handler_error,
                });
            }
        }
    }

    /// A panicking sink loses its report; the call carries on.
    fn report(&self, report: &ViolationReport<'_>) {
        if catch_unwind(AssertUnwindSafe(|| (self.sink)(report))).is_err() {
            tracing::error!(
                full_method = %report.full_method,
                kind = report.kind.as_str(),
                "violation sink panicked; report dropped"
            );
        }
    }
}

/// Records every outbound unary call made under a tracked context.
#[derive(Clone)]
pub struct ClientInterceptor {
    history: Arc<CallHistoryStore>,
}

impl ClientInterceptor {
    /// Performs the call through `invoke`, then records it under the identity
    /// found in the request's [`CallContext`], whatever the outcome.
    pub async fn call<Req, Resp, F, Fut>(
        &self,
        request: Request<Req>,
        full_method: &str,
        invoke: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Any + Clone + Send + Sync,
        Resp: Any + Clone + Send + Sync,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let ctx = CallContext::from_request(&request);
        let message = ctx.is_tracked().then(|| request.get_ref().clone());

        let outcome = invoke(request).await;

        if let Some(message) = message {
            let (response, error) = match &outcome {
                Ok(response) => (Some(response.get_ref().clone()), None),
                Err(status) => (None, Some(status.clone())),
            };
            self.history
                .record(&ctx, full_method, message, response, error);
        }
        outcome
    }
}
