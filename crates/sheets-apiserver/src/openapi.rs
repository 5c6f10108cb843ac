//! OpenAPI documents
//!
//! Definitions are generated with schemars from the Rust types the server
//! returns. Kubernetes types already carry their dotted canonical names;
//! types of this crate are renamed by a [`DefinitionNamer`] and every
//! `$ref` is rewritten to match.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroup, APIResourceList, Status};
use schemars::gen::{SchemaGenerator, SchemaSettings};
use serde_json::{json, Map, Value};

const V2_DEFINITIONS_PATH: &str = "#/definitions/";
const V3_DEFINITIONS_PATH: &str = "#/components/schemas/";

/// Registers every type a document must describe
pub type DefinitionsProvider = fn(&mut SchemaGenerator);

/// Maps schema names to dotted canonical definition names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionNamer {
    prefix: String,
}

impl DefinitionNamer {
    /// Names without a package are placed under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Namer for an API group, e.g. `com.grafana.ext.googlesheets.v1`
    pub fn for_group(group: &str, version: &str) -> Self {
        let reversed: Vec<&str> = group.split('.').rev().collect();
        Self::new(format!("{}.{}", reversed.join("."), version))
    }

    /// Canonical name of a schema
    pub fn name(&self, schema_name: &str) -> String {
        if schema_name.contains('.') {
            schema_name.to_string()
        } else {
            format!("{}.{}", self.prefix, schema_name)
        }
    }
}

/// Inputs of the OpenAPI v2 and v3 documents
#[derive(Debug, Clone)]
pub struct OpenApiConfig {
    /// `info.title` of both documents
    pub title: String,
    /// `info.version` of both documents
    pub version: String,
    /// Maps schema names to definition keys
    pub namer: DefinitionNamer,
    /// Schemas placed under `definitions` or `components.schemas`
    pub definitions: DefinitionsProvider,
    /// `group/version` entries served under `/openapi/v3/apis/`
    pub group_versions: Vec<String>,
}

/// Types every server response may carry
pub fn discovery_definitions(gen: &mut SchemaGenerator) {
    gen.subschema_for::<Status>();
    gen.subschema_for::<APIGroup>();
    gen.subschema_for::<APIResourceList>();
}

impl OpenApiConfig {
    /// Config for `group/version` with the discovery definitions
    pub fn for_group(title: &str, group: &str, version: &str) -> Self {
        Self {
            title: title.to_string(),
            version: version.to_string(),
            namer: DefinitionNamer::for_group(group, version),
            definitions: discovery_definitions,
            group_versions: vec![format!("{}/{}", group, version)],
        }
    }

    fn generate(&self, mut settings: SchemaSettings, path: &str) -> Map<String, Value> {
        settings.definitions_path = path.to_string();
        let mut gen = settings.into_generator();
        (self.definitions)(&mut gen);

        let renames: BTreeMap<String, String> = gen
            .definitions()
            .keys()
            .map(|name| (name.clone(), self.namer.name(name)))
            .collect();

        gen.take_definitions()
            .into_iter()
            .filter_map(|(name, schema)| {
                let mut value = serde_json::to_value(schema).ok()?;
                rewrite_refs(&mut value, path, &renames);
                Some((renames.get(&name).cloned().unwrap_or(name), value))
            })
            .collect()
    }

    fn info(&self) -> Value {
        json!({ "title": self.title, "version": self.version })
    }

    /// Swagger 2.0 document
    pub fn v2_document(&self) -> Value {
        let definitions = self.generate(SchemaSettings::draft07(), V2_DEFINITIONS_PATH);
        json!({
            "swagger": "2.0",
            "info": self.info(),
            "paths": {},
            "definitions": definitions,
        })
    }

    /// OpenAPI 3.0 document
    pub fn v3_document(&self) -> Value {
        let schemas = self.generate(SchemaSettings::openapi3(), V3_DEFINITIONS_PATH);
        json!({
            "openapi": "3.0.0",
            "info": self.info(),
            "paths": {},
            "components": { "schemas": schemas },
        })
    }

    /// `/openapi/v3` discovery listing
    pub fn v3_discovery(&self) -> Value {
        let paths: Map<String, Value> = self
            .group_versions
            .iter()
            .map(|gv| {
                (
                    format!("apis/{}", gv),
                    json!({ "serverRelativeURL": format!("/openapi/v3/apis/{}", gv) }),
                )
            })
            .collect();
        json!({ "paths": paths })
    }
}

fn rewrite_refs(value: &mut Value, path: &str, renames: &BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "$ref" {
                    if let Value::String(reference) = child {
                        if let Some(renamed) = reference
                            .strip_prefix(path)
                            .and_then(|name| renames.get(name))
                        {
                            *reference = format!("{}{}", path, renamed);
                        }
                    }
                } else {
                    rewrite_refs(child, path, renames);
                }
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| rewrite_refs(item, path, renames)),
        _ => {}
    }
}
