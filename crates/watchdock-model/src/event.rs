use serde_json::{Map, Value};

use crate::{ContainerSpec, ValidationError};

/// Field that turns a record into a deletion request on the event channel.
///
/// Lowercase is the only accepted spelling.
pub const DELETE_SENTINEL: &str = "deleteme";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Upsert,
    Tombstone,
}

/// Side of the bus that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Store,
    Runtime,
}

/// Immutable change notification exchanged between store and runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    kind: EventKind,
    record: ContainerSpec,
    origin: Origin,
}

impl Event {
    pub fn upsert(record: ContainerSpec, origin: Origin) -> Self {
        Self {
            kind: EventKind::Upsert,
            record,
            origin,
        }
    }

    pub fn tombstone(name: impl Into<String>, origin: Origin) -> Self {
        Self {
            kind: EventKind::Tombstone,
            record: ContainerSpec {
                name: name.into(),
                ..Default::default()
            },
            origin,
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    #[inline]
    pub fn record(&self) -> &ContainerSpec {
        &self.record
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.kind == EventKind::Tombstone
    }

    /// Wire form: the serialized record, or `{"Name": .., "deleteme": true}`.
    pub fn to_record(&self) -> Result<Value, serde_json::Error> {
        match self.kind {
            EventKind::Tombstone => {
                let mut obj = Map::new();
                obj.insert("Name".into(), Value::String(self.record.name.clone()));
                obj.insert(DELETE_SENTINEL.into(), Value::Bool(true));
                Ok(Value::Object(obj))
            }
            EventKind::Upsert => serde_json::to_value(&self.record),
        }
    }

    /// Parse a wire record, validating the delete sentinel spelling.
    pub fn from_record(value: Value, origin: Origin) -> Result<Self, ValidationError> {
        let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

        if let Some(key) = obj
            .keys()
            .find(|k| k.as_str() != DELETE_SENTINEL && k.eq_ignore_ascii_case(DELETE_SENTINEL))
        {
            return Err(ValidationError::NonCanonicalSentinel(key.clone()));
        }

        let delete = match obj.get(DELETE_SENTINEL) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(ValidationError::InvalidSentinel(other.to_string())),
        };

        if delete {
            let name = obj.get("Name").and_then(Value::as_str).unwrap_or_default();
            return Ok(Self::tombstone(domain_name(name)?, origin));
        }

        let spec: ContainerSpec = serde_json::from_value(value)?;
        Ok(Self::upsert(spec.validated()?, origin))
    }
}

fn domain_name(raw: &str) -> Result<String, ValidationError> {
    ContainerSpec::new(raw, "").validated().map(|s| s.name)
}
