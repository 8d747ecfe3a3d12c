//! Name-based stage registry.
//!
//! The registry is an application-owned value, not process-global state:
//! each worker process builds its own instance at startup, registers the
//! stages it needs, and hands it to the assembler. Registration is purely
//! additive and re-registering a name is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::stage::Stage;

/// Constructs a stage from its upstreams and free-form parameters.
///
/// Constructors validate their own parameter and upstream arity and fail
/// with a `Configuration` error on mismatch, before any iteration begins.
pub type StageConstructor<R> =
    Arc<dyn Fn(Vec<Arc<dyn Stage<R>>>, &StageParams) -> Result<Arc<dyn Stage<R>>> + Send + Sync>;

pub struct StageRegistry<R> {
    constructors: HashMap<String, StageConstructor<R>>,
}

impl<R> Default for StageRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> StageRegistry<R> {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: StageConstructor<R>) -> Result<()> {
        if self.constructors.contains_key(name) {
            return Err(PipelineError::DuplicateName {
                name: name.to_string(),
            });
        }
        self.constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    pub fn register_fn<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(Vec<Arc<dyn Stage<R>>>, &StageParams) -> Result<Arc<dyn Stage<R>>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(constructor))
    }

    pub fn resolve(&self, name: &str) -> Result<&StageConstructor<R>> {
        self.constructors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownStage {
                name: name.to_string(),
            })
    }

    pub fn instantiate(
        &self,
        name: &str,
        upstreams: Vec<Arc<dyn Stage<R>>>,
        params: &StageParams,
    ) -> Result<Arc<dyn Stage<R>>> {
        let constructor = self.resolve(name)?;
        constructor(upstreams, params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Free-form stage parameters with typed accessors.
///
/// Accessors return `Configuration` errors naming the offending key, so a
/// malformed description fails at assembly time rather than mid-epoch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StageParams(serde_json::Map<String, serde_json::Value>);

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(PipelineError::configuration(format!(
                "stage params must be a table, got {other}"
            ))),
        }
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(value)) => Ok(Some(value.as_str())),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => match value.as_u64() {
                Some(number) => Ok(Some(number)),
                None => Err(wrong_type(key, "a non-negative integer", value)),
            },
        }
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => match value.as_f64() {
                Some(number) => Ok(Some(number)),
                None => Err(wrong_type(key, "a number", value)),
            },
        }
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(serde_json::Value::Bool(value)) => Ok(Some(*value)),
            Some(other) => Err(wrong_type(key, "a boolean", other)),
        }
    }
}

fn missing(key: &str) -> PipelineError {
    PipelineError::configuration(format!("missing required parameter `{key}`"))
}

fn wrong_type(key: &str, expected: &str, got: &serde_json::Value) -> PipelineError {
    PipelineError::configuration(format!("parameter `{key}` must be {expected}, got {got}"))
}
