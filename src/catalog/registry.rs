use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::constraints::Constraints;
use crate::core::errors::{Result, RuntimeError};

/// How an implementation is executed by the worker runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImplementationType {
    Method,
    Service,
    Mpi,
    Binary,
    Ompss,
    Opencl,
    Decaf,
}

impl FromStr for ImplementationType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "METHOD" => Ok(Self::Method),
            "SERVICE" => Ok(Self::Service),
            "MPI" => Ok(Self::Mpi),
            "BINARY" => Ok(Self::Binary),
            "OMPSS" => Ok(Self::Ompss),
            "OPENCL" => Ok(Self::Opencl),
            "DECAF" => Ok(Self::Decaf),
            other => Err(RuntimeError::InvalidRegistration(format!(
                "unknown implementation type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ImplementationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Method => "METHOD",
            Self::Service => "SERVICE",
            Self::Mpi => "MPI",
            Self::Binary => "BINARY",
            Self::Ompss => "OMPSS",
            Self::Opencl => "OPENCL",
            Self::Decaf => "DECAF",
        };
        f.write_str(name)
    }
}

/// Unparsed implementation as handed over by the binding layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationSpec {
    pub signature: String,
    pub impl_type: ImplementationType,
    pub constraints: String,
    /// Type-specific arguments (declaring class, binary path, MPI runner...)
    #[serde(default)]
    pub type_args: Vec<String>,
}

impl ImplementationSpec {
    pub fn new<S: Into<String>, C: Into<String>>(
        signature: S,
        impl_type: ImplementationType,
        constraints: C,
    ) -> Self {
        Self {
            signature: signature.into(),
            impl_type,
            constraints: constraints.into(),
            type_args: Vec::new(),
        }
    }

    pub fn method<S: Into<String>>(signature: S) -> Self {
        Self::new(signature, ImplementationType::Method, "")
    }

    pub fn with_type_args(mut self, args: Vec<String>) -> Self {
        self.type_args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Implementation {
    pub signature: String,
    pub impl_type: ImplementationType,
    pub constraints: Constraints,
    pub type_args: Vec<String>,
}

impl Implementation {
    fn parse(spec: &ImplementationSpec) -> Result<Self> {
        if spec.signature.trim().is_empty() {
            return Err(RuntimeError::InvalidRegistration(
                "implementation signature is empty".to_string(),
            ));
        }
        Ok(Self {
            signature: spec.signature.clone(),
            impl_type: spec.impl_type,
            constraints: Constraints::parse(&spec.signature, &spec.constraints)?,
            type_args: spec.type_args.clone(),
        })
    }
}

/// A task's abstract signature together with its candidate implementations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreElement {
    /// Dense id in registration order
    pub id: usize,
    pub signature: String,
    pub implementations: Vec<Implementation>,
}

impl CoreElement {
    /// First implementation whose constraints fit `available`
    pub fn select(&self, available: &Constraints) -> Option<&Implementation> {
        self.implementations
            .iter()
            .find(|implementation| implementation.constraints.fits(available))
    }
}

/// Registration catalog keyed by core element signature
#[derive(Clone, Default)]
pub struct Catalog {
    elements: Arc<RwLock<HashMap<String, Arc<CoreElement>>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a core element.
    ///
    /// An implementation whose signature is already present replaces that
    /// entry in place; a new implementation signature is appended. All
    /// constraints are parsed before anything is touched, so a rejected
    /// registration leaves the catalog as it was. Returns whether the
    /// catalog changed.
    pub fn register(&self, signature: &str, implementations: &[ImplementationSpec]) -> Result<bool> {
        if signature.trim().is_empty() {
            return Err(RuntimeError::InvalidRegistration(
                "core element signature is empty".to_string(),
            ));
        }
        if implementations.is_empty() {
            return Err(RuntimeError::InvalidRegistration(format!(
                "core element {} has no implementations",
                signature
            )));
        }
        let parsed = implementations
            .iter()
            .map(Implementation::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut elements = self.elements.write();
        let next_id = elements.len();
        let mut element = match elements.get(signature) {
            Some(existing) => existing.as_ref().clone(),
            None => CoreElement {
                id: next_id,
                signature: signature.to_string(),
                implementations: Vec::new(),
            },
        };

        for implementation in parsed {
            match element
                .implementations
                .iter_mut()
                .find(|known| known.signature == implementation.signature)
            {
                Some(known) => *known = implementation,
                None => element.implementations.push(implementation),
            }
        }

        if elements.get(signature).map(|existing| **existing == element) == Some(true) {
            debug!(signature, "Core element re-registered without changes");
            return Ok(false);
        }

        info!(
            signature,
            id = element.id,
            implementations = element.implementations.len(),
            "Registered core element"
        );
        elements.insert(signature.to_string(), Arc::new(element));
        Ok(true)
    }

    pub fn get(&self, signature: &str) -> Option<Arc<CoreElement>> {
        self.elements.read().get(signature).cloned()
    }

    pub fn resolve(&self, signature: &str) -> Result<Arc<CoreElement>> {
        self.get(signature)
            .ok_or_else(|| RuntimeError::UnknownCoreElement(signature.to_string()))
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.elements.read().contains_key(signature)
    }

    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All signatures ordered by core element id
    pub fn list(&self) -> Vec<String> {
        let elements = self.elements.read();
        let mut listed: Vec<_> = elements.values().map(|e| (e.id, e.signature.clone())).collect();
        listed.sort();
        listed.into_iter().map(|(_, signature)| signature).collect()
    }
}
