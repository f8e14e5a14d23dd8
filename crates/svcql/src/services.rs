//! Services described in a JSON file, each backed by in-memory rows.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use svcql_core::graph::source::MemorySource;
use svcql_core::graph::{ExecutionGraph, LocalGraph};
use svcql_core::optimization::OptimizationMeta;
use svcql_core::optimization::parameters::ParameterGeneration;
use svcql_core::service::ServiceDescriptor;
use svcql_core::streaming::WindowConfig;
use svcql_core::types::convert::convert_literal;
use svcql_core::types::{DataType, Field, Row, RowSchema, ScalarValue};
use svcql_error::{DbError, Result, ResultExt};

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub datatype: DataType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub streaming: bool,
    /// Delay between rows of a streaming service.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub row_limit: Option<i64>,
    #[serde(default)]
    pub time_limit_ms: Option<i64>,
    #[serde(default)]
    pub user_defined: bool,
    /// Field to source parameter mappings for predicate push-down.
    #[serde(default)]
    pub push_down: BTreeMap<String, String>,
    /// Window handed to streaming queries.
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Deserialize)]
struct ServicesFile {
    services: Vec<ServiceDefinition>,
}

/// A loaded service with its rows converted to the declared schema.
#[derive(Debug, Clone)]
pub struct Service {
    pub definition: ServiceDefinition,
    pub schema: RowSchema,
    pub rows: Arc<Vec<Row>>,
}

impl Service {
    fn from_definition(definition: ServiceDefinition) -> Result<Self> {
        let schema = RowSchema::new(
            definition
                .fields
                .iter()
                .map(|f| Field::new(f.name.clone(), f.datatype)),
        );
        let mut rows = Vec::with_capacity(definition.rows.len());
        for (idx, values) in definition.rows.iter().enumerate() {
            if values.len() != schema.len() {
                return Err(DbError::new(format!(
                    "Row {idx} of service '{}' has {} values, expected {}",
                    definition.name,
                    values.len(),
                    schema.len()
                )));
            }
            let row = values
                .iter()
                .zip(&schema.fields)
                .map(|(value, field)| convert_literal(&json_to_scalar(value)?, field.datatype))
                .collect::<Result<Row>>()
                .context_fn(|| format!("Invalid row {idx} in service '{}'", definition.name))?;
            rows.push(row);
        }
        Ok(Service {
            definition,
            schema,
            rows: Arc::new(rows),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        let def = &self.definition;
        let mut descriptor = ServiceDescriptor::new(&def.name, &def.name)
            .with_streaming(def.streaming)
            .with_user_defined(def.user_defined);
        if let Some(limit) = def.row_limit {
            descriptor = descriptor.with_row_limit(limit);
        }
        if let Some(limit) = def.time_limit_ms {
            descriptor = descriptor.with_time_limit(limit);
        }
        if !def.push_down.is_empty() {
            let optimization = def
                .push_down
                .iter()
                .fold(ParameterGeneration::new(), |opt, (field, parameter)| {
                    opt.with_mapping(field, parameter)
                });
            descriptor = descriptor.with_optimization(OptimizationMeta::new(optimization));
        }
        descriptor
    }

    /// A fresh source graph over the service's rows.
    pub fn source_graph(&self) -> Result<Arc<dyn ExecutionGraph>> {
        let mut source =
            MemorySource::new(self.schema.clone(), self.rows.as_ref().clone()).with_parameter_filter();
        if self.definition.streaming {
            let interval = self.definition.interval_ms.unwrap_or(100);
            source = source.with_interval(Duration::from_millis(interval));
        }
        let graph = LocalGraph::builder(format!("{}_source", self.definition.name))
            .source(self.definition.name.clone(), self.schema.clone(), source)
            .build()?;
        Ok(graph.into_shared())
    }
}

fn json_to_scalar(value: &serde_json::Value) -> Result<ScalarValue> {
    Ok(match value {
        serde_json::Value::Null => ScalarValue::Null,
        serde_json::Value::Bool(b) => ScalarValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(v) => ScalarValue::Integer(v),
            None => ScalarValue::Number(
                n.as_f64()
                    .ok_or_else(|| DbError::new(format!("Unsupported number: {n}")))?,
            ),
        },
        serde_json::Value::String(s) => ScalarValue::String(s.clone()),
        other => return Err(DbError::new(format!("Unsupported value: {other}"))),
    })
}

/// Services by case insensitive name.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: HashMap<String, Service>,
}

impl ServiceCatalog {
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ServicesFile =
            serde_json::from_str(text).context("Failed to parse services file")?;
        let mut services = HashMap::with_capacity(file.services.len());
        for definition in file.services {
            let service = Service::from_definition(definition)?;
            let key = service.name().to_lowercase();
            if services.insert(key, service).is_some() {
                return Err(DbError::new("Duplicate service name in services file"));
            }
        }
        Ok(ServiceCatalog { services })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .context_fn(|| format!("Failed to read services file {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn get(&self, name: &str) -> Result<&Service> {
        self.services
            .get(&name.to_lowercase())
            .ok_or_else(|| DbError::new(format!("Unknown service '{name}'")).with_field("service", name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.services.values().map(|s| s.name()).collect();
        names.sort();
        names
    }
}
