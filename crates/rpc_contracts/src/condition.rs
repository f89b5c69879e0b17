#![forbid(unsafe_code)]

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tonic::Status;

use crate::error::{ContractError, ContractResult, ContractViolation};
use crate::history::CallHistory;

pub type ConditionOutcome = Result<(), ContractViolation>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    Pre,
    Post,
}

impl ConditionKind {
    /// Number of parameters a condition of this kind is declared with.
    pub const fn arity(self) -> usize {
        match self {
            ConditionKind::Pre => 1,
            ConditionKind::Post => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionKind::Pre => "precondition",
            ConditionKind::Post => "postcondition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadType {
    id: TypeId,
    name: &'static str,
}

impl PayloadType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Positional arguments handed to a condition at invocation time.
pub(crate) enum ConditionArgs<'a> {
    Pre {
        request: &'a dyn Any,
    },
    Post {
        response: &'a dyn Any,
        error: Option<&'a Status>,
        request: &'a dyn Any,
        calls: &'a CallHistory,
    },
}

impl ConditionArgs<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            ConditionArgs::Pre { .. } => ConditionKind::Pre.arity(),
            ConditionArgs::Post { .. } => ConditionKind::Post.arity(),
        }
    }
}

type ErasedCondition =
    dyn Fn(&ConditionArgs<'_>) -> ContractResult<ConditionOutcome> + Send + Sync;

/// A pre- or postcondition with its payload types erased. The declared shape
/// is kept alongside so registration can check it without invoking anything.
#[derive(Clone)]
pub struct Condition {
    kind: ConditionKind,
    request_type: PayloadType,
    response_type: Option<PayloadType>,
    call: Arc<ErasedCondition>,
}

impl Condition {
    pub fn pre<Req, F>(check: F) -> Self
    where
        Req: Any,
        F: Fn(&Req) -> ConditionOutcome + Send + Sync + 'static,
    {
        let call: Arc<ErasedCondition> = Arc::new(move |args: &ConditionArgs<'_>| {
            let ConditionArgs::Pre { request } = args else {
                return Err(ContractError::Arity {
                    declared: ConditionKind::Pre.arity(),
                    supplied: args.len(),
                });
            };
            let request = downcast::<Req>(*request, 0)?;
            Ok(check(request))
        });
        Self {
            kind: ConditionKind::Pre,
            request_type: PayloadType::of::<Req>(),
            response_type: None,
            call,
        }
    }

    pub fn post<Req, Resp, F>(check: F) -> Self
    where
        Req: Any,
        Resp: Any,
        F: Fn(&Resp, Option<&Status>, &Req, &CallHistory) -> ConditionOutcome
            + Send
            + Sync
            + 'static,
    {
        let call: Arc<ErasedCondition> = Arc::new(move |args: &ConditionArgs<'_>| {
            let ConditionArgs::Post {
                response,
                error,
                request,
                calls,
            } = args
            else {
                return Err(ContractError::Arity {
                    declared: ConditionKind::Post.arity(),
                    supplied: args.len(),
                });
            };
            let response = downcast::<Resp>(*response, 0)?;
            let request = downcast::<Req>(*request, 2)?;
            Ok(check(response, *error, request, *calls))
        });
        Self {
            kind: ConditionKind::Post,
            request_type: PayloadType::of::<Req>(),
            response_type: Some(PayloadType::of::<Resp>()),
            call,
        }
    }

    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    pub fn arity(&self) -> usize {
        self.kind.arity()
    }

    pub fn request_type(&self) -> PayloadType {
        self.request_type
    }

    pub fn response_type(&self) -> Option<PayloadType> {
        self.response_type
    }

    /// Runs the condition. Arity and payload mismatches, and panics raised by
    /// the condition body, come back as `Err` instead of unwinding.
    pub(crate) fn invoke(&self, args: &ConditionArgs<'_>) -> ContractResult<ConditionOutcome> {
        if args.len() != self.arity() {
            return Err(ContractError::Arity {
                declared: self.arity(),
                supplied: args.len(),
            });
        }
        match catch_unwind(AssertUnwindSafe(|| (self.call)(args))) {
            Ok(result) => result,
            Err(payload) => Err(ContractError::ConditionPanicked(panic_message(
                payload.as_ref(),
            ))),
        }
    }

    /// Collapses engine failures into a violation so they are reported the
    /// same way a failing condition is.
    pub(crate) fn evaluate(&self, args: &ConditionArgs<'_>) -> Option<ContractViolation> {
        match self.invoke(args) {
            Ok(Ok(())) => None,
            Ok(Err(violation)) => Some(violation),
            Err(err) => Some(ContractViolation::from(err)),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("kind", &self.kind)
            .field("request_type", &self.request_type.name)
            .field("response_type", &self.response_type.map(|t| t.name))
            .finish()
    }
}

pub fn validate_precondition(method: &str, condition: &Condition) -> ContractResult<()> {
    validate_shape(method, condition, ConditionKind::Pre)
}

pub fn validate_postcondition(method: &str, condition: &Condition) -> ContractResult<()> {
    validate_shape(method, condition, ConditionKind::Post)
}

fn validate_shape(method: &str, condition: &Condition, expected: ConditionKind) -> ContractResult<()> {
    if condition.kind() != expected {
        return Err(ContractError::Shape {
            method: method.to_string(),
            reason: format!(
                "{} must take exactly {} parameter(s), got {}",
                expected.as_str(),
                expected.arity(),
                condition.arity()
            ),
        });
    }
    if expected == ConditionKind::Post && condition.response_type.is_none() {
        return Err(ContractError::Shape {
            method: method.to_string(),
            reason: "postcondition must declare a response payload".to_string(),
        });
    }
    Ok(())
}

fn downcast<T: Any>(value: &dyn Any, position: usize) -> ContractResult<&T> {
    value.downcast_ref::<T>().ok_or(ContractError::PayloadType {
        position,
        expected: type_name::<T>(),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
