use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use helm_core::ids::ToolCallId;
use helm_core::stream::StreamEvent;
use helm_core::tools::ToolDefinition;

/// Lifecycle of one tool call. Transitions are monotonic: a call never
/// moves backward, and validation failure jumps straight to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallState {
    Pending,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl ToolCallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Pending may fail directly (validation error).
            (Self::Pending, Self::Validated | Self::Failed) => true,
            (Self::Validated, Self::Executing | Self::Failed) => true,
            (Self::Executing, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("duplicate tool call id {0}")]
    DuplicateId(ToolCallId),

    #[error("unknown tool call id {0}")]
    UnknownId(ToolCallId),

    #[error("invalid transition {from:?} -> {to:?} for {id}")]
    InvalidTransition {
        id: ToolCallId,
        from: ToolCallState,
        to: ToolCallState,
    },
}

/// One call being reassembled from stream fragments.
#[derive(Debug, Clone)]
pub struct AccumulatedCall {
    pub id: ToolCallId,
    pub name: String,
    fragments: String,
    pub state: ToolCallState,
    /// Parsed arguments, present once validated.
    pub arguments: Option<Value>,
    /// Structured failure detail (validation or execution).
    pub error: Option<String>,
}

impl AccumulatedCall {
    /// Raw concatenated argument text, as received so far.
    pub fn raw_arguments(&self) -> &str {
        &self.fragments
    }
}

/// Reassembles fragmented tool-call arguments and validates them against
/// the declared parameter schema on completion. Fragments are plain text
/// until `complete`; nothing is parsed early, so legitimately partial JSON
/// never trips validation.
pub struct ToolCallAccumulator {
    calls: Vec<AccumulatedCall>,
    schemas: HashMap<String, Value>,
}

impl ToolCallAccumulator {
    pub fn new(definitions: &[ToolDefinition]) -> Self {
        Self {
            calls: Vec::new(),
            schemas: definitions
                .iter()
                .map(|d| (d.name.clone(), d.parameters_schema.clone()))
                .collect(),
        }
    }

    /// Route a stream event. Non-tool events are ignored.
    pub fn observe(&mut self, event: &StreamEvent) -> Result<(), AccumulatorError> {
        match event {
            StreamEvent::ToolCallStart { id, name } => self.start(id.clone(), name.clone()),
            StreamEvent::ToolCallDelta { id, fragment } => self.fragment(id, fragment),
            StreamEvent::ToolCallEnd { id } => self.complete(id).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub fn start(&mut self, id: ToolCallId, name: String) -> Result<(), AccumulatorError> {
        if self.calls.iter().any(|c| c.id == id) {
            return Err(AccumulatorError::DuplicateId(id));
        }
        self.calls.push(AccumulatedCall {
            id,
            name,
            fragments: String::new(),
            state: ToolCallState::Pending,
            arguments: None,
            error: None,
        });
        Ok(())
    }

    pub fn fragment(&mut self, id: &ToolCallId, fragment: &str) -> Result<(), AccumulatorError> {
        let call = self.get_mut(id)?;
        call.fragments.push_str(fragment);
        Ok(())
    }

    /// Parse and validate on completion. Empty argument text means an
    /// argument-free call and parses as `{}`.
    pub fn complete(&mut self, id: &ToolCallId) -> Result<&AccumulatedCall, AccumulatorError> {
        let schemas = std::mem::take(&mut self.schemas);
        let call = match self.get_mut(id) {
            Ok(c) => c,
            Err(e) => {
                self.schemas = schemas;
                return Err(e);
            }
        };

        let raw = if call.fragments.trim().is_empty() {
            "{}"
        } else {
            call.fragments.as_str()
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(args) => match schemas.get(&call.name) {
                Some(schema) => match validate_arguments(schema, &args) {
                    Ok(()) => {
                        call.arguments = Some(args);
                        call.state = ToolCallState::Validated;
                    }
                    Err(detail) => {
                        call.error = Some(detail);
                        call.state = ToolCallState::Failed;
                    }
                },
                None => {
                    call.error = Some(format!("unknown tool: {}", call.name));
                    call.state = ToolCallState::Failed;
                }
            },
            Err(e) => {
                call.error = Some(format!("malformed arguments: {e}"));
                call.state = ToolCallState::Failed;
            }
        }

        self.schemas = schemas;
        self.get(id)
    }

    pub fn transition(
        &mut self,
        id: &ToolCallId,
        next: ToolCallState,
    ) -> Result<(), AccumulatorError> {
        let call = self.get_mut(id)?;
        if !call.state.can_transition_to(&next) {
            return Err(AccumulatorError::InvalidTransition {
                id: id.clone(),
                from: call.state.clone(),
                to: next,
            });
        }
        call.state = next;
        Ok(())
    }

    pub fn set_error(&mut self, id: &ToolCallId, detail: String) -> Result<(), AccumulatorError> {
        self.transition(id, ToolCallState::Failed)?;
        if let Ok(call) = self.get_mut(id) {
            call.error = Some(detail);
        }
        Ok(())
    }

    /// All calls in emission order.
    pub fn calls(&self) -> &[AccumulatedCall] {
        &self.calls
    }

    /// Calls that passed validation, in emission order.
    pub fn validated(&self) -> Vec<&AccumulatedCall> {
        self.calls
            .iter()
            .filter(|c| c.state == ToolCallState::Validated)
            .collect()
    }

    pub fn get(&self, id: &ToolCallId) -> Result<&AccumulatedCall, AccumulatorError> {
        self.calls
            .iter()
            .find(|c| c.id == *id)
            .ok_or_else(|| AccumulatorError::UnknownId(id.clone()))
    }

    fn get_mut(&mut self, id: &ToolCallId) -> Result<&mut AccumulatedCall, AccumulatorError> {
        self.calls
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| AccumulatorError::UnknownId(id.clone()))
    }
}

/// Validate arguments against a JSON schema: required properties present,
/// provided property types match. Nested schemas are not recursed into.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let mut errors = Vec::new();

    if !args.is_object() {
        return Err(format!("arguments must be an object, got {}", type_name(args)));
    }

    if let Some(required) = schema["required"].as_array() {
        for field in required {
            if let Some(name) = field.as_str() {
                if args.get(name).is_none() || args[name].is_null() {
                    errors.push(format!("missing required parameter '{name}'"));
                }
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (name, prop_schema) in properties {
            let Some(value) = args.get(name) else { continue };
            if value.is_null() {
                continue;
            }
            let Some(expected) = prop_schema["type"].as_str() else { continue };
            let ok = match expected {
                "string" => value.is_string(),
                "number" | "integer" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                errors.push(format!(
                    "parameter '{name}' should be {expected} but got {}",
                    type_name(value)
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
