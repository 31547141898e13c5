//! Action registry: the plugin resolver behind every testable sandbox.
//!
//! Units are registered explicitly at sandbox-creation time: a unique name,
//! a human-readable description and a handler closure taking a parameter
//! mapping. A unit's result is always a mapping; its `actions` key lists
//! the names of the units offered next, and descriptors for those names are
//! derived from registry metadata rather than from any kind of source
//! introspection.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::HarnessError;

/// Parameter mapping passed to a unit handler.
pub type Params = Map<String, Value>;

type UnitHandler = Box<dyn Fn(&Params) -> Result<Value> + Send>;

/// Name + description of one capability currently offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
}

struct ActionUnit {
    description: String,
    handler: UnitHandler,
}

/// Table of named action units for one sandbox.
#[derive(Default)]
pub struct ActionRegistry {
    units: BTreeMap<String, ActionUnit>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        handler: impl Fn(&Params) -> Result<Value> + Send + 'static,
    ) {
        self.units.insert(
            name.to_string(),
            ActionUnit {
                description: description.to_string(),
                handler: Box::new(handler),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.units.get(name).map(|unit| unit.description.as_str())
    }

    /// Invoke the entry unit with no parameters and derive the initially
    /// offered descriptors from its result.
    pub fn discover(&self, entry: &str) -> Result<Vec<ActionDescriptor>> {
        if !self.contains(entry) {
            return Err(protocol(entry, "entry unit is not registered").into());
        }
        let result = self.invoke(entry, &Params::new())?;
        self.descriptors_from(entry, &result)
    }

    /// Invoke a unit by name with a parameter mapping.
    ///
    /// The unit's result must itself be a mapping; anything else is a
    /// protocol violation by the unit.
    pub fn invoke(&self, name: &str, parameters: &Params) -> Result<Map<String, Value>> {
        let unit = self
            .units
            .get(name)
            .ok_or_else(|| HarnessError::UnitNotFound {
                name: name.to_string(),
            })?;
        let value = (unit.handler)(parameters)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(protocol(
                name,
                &format!("unit returned {} instead of a mapping", kind_of(&other)),
            )
            .into()),
        }
    }

    /// Derive the follow-on descriptors from a unit result.
    ///
    /// A missing or empty `actions` key is a valid terminal signal for that
    /// branch, not an error.
    pub fn descriptors_from(
        &self,
        unit: &str,
        result: &Map<String, Value>,
    ) -> Result<Vec<ActionDescriptor>> {
        let Some(actions) = result.get("actions") else {
            return Ok(Vec::new());
        };
        let items = actions
            .as_array()
            .ok_or_else(|| protocol(unit, "the actions key must be a list"))?;
        let mut descriptors = Vec::with_capacity(items.len());
        for item in items {
            let name = item
                .as_str()
                .ok_or_else(|| protocol(unit, "action entries must be unit names"))?;
            let description = self.description(name).ok_or_else(|| {
                protocol(unit, &format!("advertised unit '{name}' is not registered"))
            })?;
            descriptors.push(ActionDescriptor {
                name: name.to_string(),
                description: description.to_string(),
            });
        }
        Ok(descriptors)
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn protocol(unit: &str, reason: &str) -> HarnessError {
    HarnessError::Protocol {
        unit: unit.to_string(),
        reason: reason.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
