//! JSON codec delegate.
//!
//! The codec never interprets application values itself. Bodies go through a
//! [`JsonSupport`] implementation, and argument lists are checked against an
//! [`ArgSpec`] picked by the caller: the [`EventTypeRegistry`] for events, the
//! ack registration for acknowledgments. Both lookups reach the decoder
//! through [`DecodeContext`].

use crate::WireError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Expected shape of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    /// Anything
    Any,
    /// `null`
    Null,
    /// `true` / `false`
    Bool,
    /// Any JSON number
    Number,
    /// String (spliced attachments are base64 strings)
    String,
    /// Array
    Array,
    /// Object
    Object,
}

impl ArgKind {
    /// Whether `value` has this shape
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ArgKind::Any => true,
            ArgKind::Null => value.is_null(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Number => value.is_number(),
            ArgKind::String => value.is_string(),
            ArgKind::Array => value.is_array(),
            ArgKind::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ArgKind::Any => "any",
            ArgKind::Null => "null",
            ArgKind::Bool => "bool",
            ArgKind::Number => "number",
            ArgKind::String => "string",
            ArgKind::Array => "array",
            ArgKind::Object => "object",
        }
    }
}

/// Positional argument types. Arguments past the listed kinds are accepted
/// as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    kinds: Vec<ArgKind>,
}

impl ArgSpec {
    /// Accept any argument list
    pub fn any() -> Self {
        Self::default()
    }

    /// Expect the given kinds in order
    pub fn new(kinds: impl Into<Vec<ArgKind>>) -> Self {
        Self { kinds: kinds.into() }
    }

    /// Expected kinds
    pub fn kinds(&self) -> &[ArgKind] {
        &self.kinds
    }

    /// Check an argument list. Missing trailing arguments are allowed.
    pub fn check(&self, args: &[Value]) -> Result<(), WireError> {
        for (index, (kind, value)) in self.kinds.iter().zip(args).enumerate() {
            if !kind.matches(value) {
                return Err(WireError::ArgMismatch {
                    index,
                    expected: kind.name(),
                });
            }
        }
        Ok(())
    }
}

/// Pluggable JSON marshaling
pub trait JsonSupport: Send + Sync {
    /// Serialize one value
    fn encode(&self, value: &Value) -> Result<Bytes, WireError>;

    /// Parse one value
    fn read_value(&self, body: &[u8]) -> Result<Value, WireError>;

    /// Parse a JSON array and check it against `spec`
    fn read_args(&self, body: &[u8], spec: &ArgSpec) -> Result<Vec<Value>, WireError>;
}

/// [`JsonSupport`] backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeJsonSupport;

impl JsonSupport for SerdeJsonSupport {
    fn encode(&self, value: &Value) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn read_value(&self, body: &[u8]) -> Result<Value, WireError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn read_args(&self, body: &[u8], spec: &ArgSpec) -> Result<Vec<Value>, WireError> {
        let args: Vec<Value> = serde_json::from_slice(body)?;
        spec.check(&args)?;
        Ok(args)
    }
}

/// Event name to argument types, per namespace
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    events: HashMap<(String, String), ArgSpec>,
}

impl EventTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the argument types of `event` on `namespace`
    pub fn register(&mut self, namespace: impl Into<String>, event: impl Into<String>, spec: ArgSpec) {
        self.events.insert((namespace.into(), event.into()), spec);
    }

    /// Argument types for an event; unregistered events accept anything
    pub fn lookup(&self, namespace: &str, event: &str) -> ArgSpec {
        self.events
            .get(&(namespace.to_string(), event.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of registered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Lookups the decoder needs from its session
pub trait DecodeContext {
    /// JSON delegate used for bodies
    fn json(&self) -> &dyn JsonSupport;

    /// Argument types for an inbound event
    fn event_arg_spec(&self, namespace: &str, event: &str) -> ArgSpec;

    /// Argument types for an inbound ack, `None` if nothing waits for it.
    /// The body of an unclaimed ack is skipped without parsing.
    fn ack_arg_spec(&self, namespace: &str, ack_id: u64) -> Option<ArgSpec>;
}

/// Context that accepts every event and ack with `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveContext;

impl DecodeContext for PermissiveContext {
    fn json(&self) -> &dyn JsonSupport {
        &SerdeJsonSupport
    }

    fn event_arg_spec(&self, _namespace: &str, _event: &str) -> ArgSpec {
        ArgSpec::any()
    }

    fn ack_arg_spec(&self, _namespace: &str, _ack_id: u64) -> Option<ArgSpec> {
        Some(ArgSpec::any())
    }
}
