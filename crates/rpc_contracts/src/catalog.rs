#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::condition::{validate_postcondition, validate_precondition, Condition, PayloadType};
use crate::error::{ContractError, ContractResult};

/// `/service_name/method_name`, the single key used to match contracts to calls.
pub fn full_method_name(service_name: &str, method_name: &str) -> String {
    format!("/{service_name}/{method_name}")
}

/// Pre- and postconditions declared for one unary method.
#[derive(Debug, Clone)]
pub struct UnaryContract {
    method_name: String,
    preconditions: Vec<Condition>,
    postconditions: Vec<Condition>,
}

impl UnaryContract {
    /// `method_name` is unqualified, e.g. `GetNote`.
    pub fn new(method_name: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
        }
    }

    pub fn precondition(mut self, condition: Condition) -> Self {
        self.preconditions.push(condition);
        self
    }

    pub fn postcondition(mut self, condition: Condition) -> Self {
        self.postconditions.push(condition);
        self
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn preconditions(&self) -> &[Condition] {
        &self.preconditions
    }

    pub fn postconditions(&self) -> &[Condition] {
        &self.postconditions
    }

    fn validate(&self, full_method: &str) -> ContractResult<()> {
        for condition in &self.preconditions {
            validate_precondition(full_method, condition)?;
        }
        for condition in &self.postconditions {
            validate_postcondition(full_method, condition)?;
        }

        let all = self.preconditions.iter().chain(&self.postconditions);
        let mut request_type: Option<PayloadType> = None;
        for condition in all {
            match request_type {
                None => request_type = Some(condition.request_type()),
                Some(expected) if expected != condition.request_type() => {
                    return Err(payload_disagreement(
                        full_method,
                        "request",
                        expected,
                        condition.request_type(),
                    ));
                }
                Some(_) => {}
            }
        }

        let mut response_type: Option<PayloadType> = None;
        for got in self.postconditions.iter().filter_map(Condition::response_type) {
            match response_type {
                None => response_type = Some(got),
                Some(expected) if expected != got => {
                    return Err(payload_disagreement(full_method, "response", expected, got));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn payload_disagreement(
    full_method: &str,
    which: &str,
    expected: PayloadType,
    got: PayloadType,
) -> ContractError {
    ContractError::Shape {
        method: full_method.to_string(),
        reason: format!(
            "conditions disagree on the {which} payload: `{}` vs `{}`",
            expected.name(),
            got.name()
        ),
    }
}

/// A gRPC service (`package.Service`) and the contracts of its methods.
#[derive(Debug, Clone)]
pub struct ServiceContract {
    service_name: String,
    contracts: Vec<UnaryContract>,
}

impl ServiceContract {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            contracts: Vec::new(),
        }
    }

    pub fn rpc(mut self, contract: UnaryContract) -> Self {
        self.contracts.push(contract);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn contracts(&self) -> &[UnaryContract] {
        &self.contracts
    }
}

/// Registration-phase catalog. Consumed by [`ContractBuilder::build`].
#[derive(Debug, Default)]
pub struct ContractBuilder {
    contracts: HashMap<String, Arc<UnaryContract>>,
}

impl ContractBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates every contract of the service, then inserts them all. A
    /// failed registration leaves the builder unchanged.
    pub fn register(&mut self, service: ServiceContract) -> ContractResult<()> {
        let mut pending = HashSet::new();
        for contract in &service.contracts {
            let full_method = full_method_name(&service.service_name, &contract.method_name);
            contract.validate(&full_method)?;
            if self.contracts.contains_key(&full_method) || !pending.insert(full_method.clone()) {
                return Err(ContractError::DuplicateContract { full_method });
            }
        }

        for contract in service.contracts {
            let full_method = full_method_name(&service.service_name, &contract.method_name);
            tracing::debug!(full_method = %full_method, "registered unary contract");
            self.contracts.insert(full_method, Arc::new(contract));
        }
        Ok(())
    }

    pub fn build(self) -> ContractCatalog {
        ContractCatalog {
            contracts: self.contracts,
        }
    }
}

/// Serving-phase catalog: immutable, shared across interceptors.
#[derive(Debug, Default)]
pub struct ContractCatalog {
    contracts: HashMap<String, Arc<UnaryContract>>,
}

impl ContractCatalog {
    /// A miss means the method has no contract.
    pub fn resolve(&self, full_method: &str) -> Option<&Arc<UnaryContract>> {
        self.contracts.get(full_method)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }
}
