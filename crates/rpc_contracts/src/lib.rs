#![forbid(unsafe_code)]

//! Design-by-contract monitoring for unary gRPC services.
//!
//! A [`ServerContract`] holds per-method preconditions and postconditions.
//! Its [`ServerInterceptor`] mints a request identity for every inbound call,
//! checks preconditions, runs the handler, then checks postconditions against
//! the handler outcome and the [`CallHistory`] of downstream calls recorded by
//! the [`ClientInterceptor`]. Violations are reported to a sink and never
//! change what the RPC returns.

pub mod catalog;
pub mod condition;
pub mod config;
pub mod error;
pub mod history;
pub mod interceptor;
pub mod request_id;

pub use catalog::{
    full_method_name, ContractBuilder, ContractCatalog, ServiceContract, UnaryContract,
};
pub use condition::{Condition, ConditionKind, ConditionOutcome, PayloadType};
pub use config::ContractConfig;
pub use error::{ContractError, ContractResult, ContractViolation};
pub use history::{CallHistory, CallHistoryStore, CallRecord, Calls};
pub use interceptor::{
    tracing_sink, ClientInterceptor, RpcMessage, ServerContract, ServerInterceptor,
    ViolationReport, ViolationSink,
};
pub use request_id::{CallContext, RequestId};
