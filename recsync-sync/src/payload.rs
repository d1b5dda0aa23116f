//! Outbound payload construction.
//!
//! [`PayloadBuilder`] is the per-entity seam; [`FieldMapPayloadBuilder`] is
//! the config-driven default that maps columns to fields.

use std::collections::BTreeMap;

use recsync_core::config::{DependencyConfig, FieldKind, FieldMapping};
use recsync_core::{Action, JobConfig, VersionRecord};
use serde_json::{Map, Number, Value};

use crate::error::UnitError;
use crate::lookup::MappingLookup;

/// Everything a builder may consult besides the record itself.
pub struct BuildContext<'a> {
    pub action: Action,
    /// Target id when `action` is `Update`.
    pub remote_id: Option<&'a str>,
    /// Resolved dependency remote ids, keyed by source column.
    pub dependencies: &'a BTreeMap<String, String>,
    pub mappings: &'a dyn MappingLookup,
}

pub trait PayloadBuilder: Send + Sync {
    fn build(&self, record: &VersionRecord, ctx: &BuildContext<'_>) -> Result<Value, UnitError>;
}

#[derive(Debug, Clone)]
pub struct FieldMapPayloadBuilder {
    fields: Vec<FieldMapping>,
    dependencies: Vec<DependencyConfig>,
    update_id_field: Option<String>,
}

impl FieldMapPayloadBuilder {
    pub fn from_job(job: &JobConfig) -> Self {
        Self {
            fields: job.fields.clone(),
            dependencies: job.dependencies.clone(),
            update_id_field: job.endpoints.update_id_field.clone(),
        }
    }

    fn field_value(
        &self,
        field: &FieldMapping,
        record: &VersionRecord,
        ctx: &BuildContext<'_>,
    ) -> Result<Option<Value>, UnitError> {
        let raw = record.field(&field.column).cloned();
        let Some(map_type) = field.map.as_deref() else {
            return Ok(raw.or_else(|| field.default.clone()));
        };
        let Some(raw) = raw else {
            if field.required {
                return Err(UnitError::MappingMissing {
                    map_type: map_type.to_owned(),
                    key: format!("<empty {}>", field.column),
                });
            }
            return Ok(field.default.clone());
        };
        let key = scalar_text(&raw);
        Ok(ctx
            .mappings
            .lookup(map_type, &key, field.required)?
            .map(Value::String)
            .or_else(|| field.default.clone()))
    }
}

impl PayloadBuilder for FieldMapPayloadBuilder {
    fn build(&self, record: &VersionRecord, ctx: &BuildContext<'_>) -> Result<Value, UnitError> {
        let mut out = Map::new();
        for field in &self.fields {
            if let Some(value) = self.field_value(field, record, ctx)? {
                out.insert(field.target.clone(), coerce(field.kind, value));
            }
        }
        for dep in &self.dependencies {
            if let (Some(target), Some(id)) = (&dep.target, ctx.dependencies.get(&dep.column)) {
                out.insert(target.clone(), Value::String(id.clone()));
            }
        }
        if ctx.action == Action::Update {
            if let (Some(field), Some(id)) = (&self.update_id_field, ctx.remote_id) {
                out.insert(field.clone(), Value::String(id.to_owned()));
            }
        }
        Ok(Value::Object(out))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_owned(),
        other => other.to_string(),
    }
}

/// Best-effort conversion; values that cannot be converted become `null`.
pub fn coerce(kind: FieldKind, value: Value) -> Value {
    match (kind, value) {
        (FieldKind::Raw, v) | (_, v @ Value::Null) => v,
        (FieldKind::String, Value::String(s)) => Value::String(s),
        (FieldKind::String, v) => Value::String(v.to_string()),
        (FieldKind::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .map_or(Value::Null, Value::from),
        (FieldKind::Integer, Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
                .map_or(Value::Null, Value::from)
        }
        (FieldKind::Integer, Value::Bool(b)) => Value::from(i64::from(b)),
        (FieldKind::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        (FieldKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        (FieldKind::Bool, Value::Bool(b)) => Value::Bool(b),
        (FieldKind::Bool, Value::Number(n)) => Value::Bool(n.as_f64().map_or(false, |f| f != 0.0)),
        (FieldKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "t" => Value::Bool(true),
            "false" | "0" | "no" | "n" | "f" | "" => Value::Bool(false),
            _ => Value::Null,
        },
        (kind, other) => {
            tracing::debug!("cannot coerce {other} to {kind:?}");
            Value::Null
        }
    }
}
