//! Provider schema catalog.
//!
//! Schemas are loaded from `./<package>.json` files (the schema oracle),
//! decoded from the provider package-spec format, and synthesized into the
//! descriptors execution needs: a decoding spec per resource (how its HCL
//! body maps onto typed attributes and nested blocks) and an args/return
//! type pair per function.
//!

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("can not load schema for package {0}: {1}")]
    Load(String, #[source] std::io::Error),
    #[error("malformed schema for package {0}: {1}")]
    Decode(String, #[source] serde_json::Error),
    #[error("malformed token {0}")]
    BadToken(String),
    #[error("unknown resource type {0}")]
    UnknownResource(String),
    #[error("unknown function {0}")]
    UnknownFunction(String),
}

// ----- On-disk package spec (the subset execution needs)

#[derive(Debug, Default, Deserialize)]
pub struct PackageSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionSpec>,
    #[serde(default)]
    pub types: BTreeMap<String, PropertySpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, rename = "inputProperties")]
    pub input_properties: BTreeMap<String, PropertySpec>,
    #[serde(default, rename = "requiredInputs")]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionSpec {
    #[serde(default)]
    pub inputs: Option<PropertySpec>,
    #[serde(default)]
    pub outputs: Option<PropertySpec>,
}

/// A type expression in the package spec: a primitive `type`, an array
/// (`items`), a map (`additionalProperties`), an inline object
/// (`properties`) or a `$ref` into the package's named types (or one of the
/// provider-independent capsule types).
///
#[derive(Debug, Default, Deserialize)]
pub struct PropertySpec {
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    #[serde(default, rename = "$ref")]
    pub ref_: Option<String>,
    #[serde(default)]
    pub items: Option<Box<PropertySpec>>,
    #[serde(default, rename = "additionalProperties")]
    pub additional_properties: Option<Box<PropertySpec>>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

// ----- Synthesized descriptors

/// The static type of a schema-declared property.
///
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaType {
    Dynamic,
    Bool,
    Number,
    String,
    Asset,
    Archive,
    List(Box<SchemaType>),
    Map(Box<SchemaType>),
    Object(BTreeMap<String, SchemaType>),
}

impl SchemaType {
    pub fn display_name(&self) -> &'static str {
        match self {
            SchemaType::Dynamic => "dynamic",
            SchemaType::Bool => "bool",
            SchemaType::Number => "number",
            SchemaType::String => "string",
            SchemaType::Asset => "asset",
            SchemaType::Archive => "archive",
            SchemaType::List(_) => "list",
            SchemaType::Map(_) => "map",
            SchemaType::Object(_) => "object",
        }
    }
}

/// How a single input property decodes out of a resource body.
///
/// Arrays of objects become repeatable nested blocks, maps of objects become
/// labelled nested blocks, plain objects become single nested blocks and
/// everything else is a typed attribute.
///
#[derive(Clone, Debug)]
pub enum PropDecode {
    Attr { typ: SchemaType, required: bool },
    Block { spec: ObjectSpec, required: bool },
    BlockList { spec: ObjectSpec, min_one: bool },
    BlockMap { spec: ObjectSpec },
}

pub type ObjectSpec = BTreeMap<String, PropDecode>;

#[derive(Clone, Debug)]
pub struct ResourceSchema {
    /// Canonical token, as sent on the wire.
    pub token: String,
    /// Decoding spec synthesized from the declared input properties.
    pub spec: ObjectSpec,
    /// Names of the declared output properties, used to fill holes in
    /// monitor responses.
    pub outputs: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct FunctionSchema {
    pub token: String,
    pub args_type: SchemaType,
    pub return_type: SchemaType,
    pub outputs: Vec<String>,
}

#[derive(Debug)]
pub struct PackageSchema {
    pub name: String,
    pub resources: BTreeMap<String, Arc<ResourceSchema>>,
    pub functions: BTreeMap<String, Arc<FunctionSchema>>,
}

impl PackageSchema {
    pub fn resource(&self, token: &str) -> Result<Arc<ResourceSchema>, SchemaError> {
        let canonical = canonicalize_token(token)?;
        self.resources
            .get(&canonical)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownResource(token.to_owned()))
    }

    pub fn function(&self, token: &str) -> Result<Arc<FunctionSchema>, SchemaError> {
        let canonical = canonicalize_token(token)?;
        self.functions
            .get(&canonical)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownFunction(token.to_owned()))
    }
}

// ----- Token utilities

/// Split a `package:module:member` token into its three components.
///
pub fn decompose_token(tok: &str) -> Result<(&str, &str, &str), SchemaError> {
    let mut parts = tok.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(pkg), Some(module), Some(member), None) if !pkg.is_empty() && !member.is_empty() => {
            Ok((pkg, module, member))
        }
        _ => Err(SchemaError::BadToken(tok.to_owned())),
    }
}

/// Canonical token form: the module component is cut at the first `/`
/// (providers commonly write `pkg:mod/lowerCamel:Member`).
///
pub fn canonicalize_token(tok: &str) -> Result<String, SchemaError> {
    let (pkg, module, member) = decompose_token(tok)?;
    let module = module.split('/').next().unwrap_or(module);
    Ok(format!("{pkg}:{module}:{member}"))
}

// ----- Type & decoding-spec synthesis

const MAX_TYPE_DEPTH: u32 = 32;

fn resolve_ref<'a>(
    r: &str,
    types: &'a BTreeMap<String, PropertySpec>,
) -> Option<&'a PropertySpec> {
    let token = r.strip_prefix("#/types/")?;
    types.get(token)
}

fn make_type(p: &PropertySpec, types: &BTreeMap<String, PropertySpec>, depth: u32) -> SchemaType {
    if depth > MAX_TYPE_DEPTH {
        return SchemaType::Dynamic;
    }

    if let Some(r) = &p.ref_ {
        return match r.as_str() {
            "pulumi.json#/Asset" => SchemaType::Asset,
            "pulumi.json#/Archive" => SchemaType::Archive,
            "pulumi.json#/Any" => SchemaType::Dynamic,
            _ => match resolve_ref(r, types) {
                Some(target) => make_type(target, types, depth + 1),
                None => SchemaType::Dynamic,
            },
        };
    }

    if !p.properties.is_empty() {
        let attrs = p
            .properties
            .iter()
            .map(|(name, spec)| (name.clone(), make_type(spec, types, depth + 1)))
            .collect();
        return SchemaType::Object(attrs);
    }

    match p.type_.as_deref() {
        Some("boolean") => SchemaType::Bool,
        Some("integer") | Some("number") => SchemaType::Number,
        Some("string") => SchemaType::String,
        Some("array") => {
            let elem = p
                .items
                .as_deref()
                .map(|e| make_type(e, types, depth + 1))
                .unwrap_or(SchemaType::Dynamic);
            SchemaType::List(Box::new(elem))
        }
        Some("object") => {
            let elem = p
                .additional_properties
                .as_deref()
                .map(|e| make_type(e, types, depth + 1))
                .unwrap_or(SchemaType::Dynamic);
            SchemaType::Map(Box::new(elem))
        }
        _ => SchemaType::Dynamic,
    }
}

/// Resolve a property spec to an object shape (inline or through one `$ref`
/// hop), if it has one.
///
fn resolve_object<'a>(
    p: &'a PropertySpec,
    types: &'a BTreeMap<String, PropertySpec>,
) -> Option<(&'a BTreeMap<String, PropertySpec>, &'a [String])> {
    if !p.properties.is_empty() {
        return Some((&p.properties, &p.required));
    }
    let target = resolve_ref(p.ref_.as_deref()?, types)?;
    if target.properties.is_empty() {
        None
    } else {
        Some((&target.properties, &target.required))
    }
}

fn make_prop_decode(
    p: &PropertySpec,
    required: bool,
    types: &BTreeMap<String, PropertySpec>,
    depth: u32,
) -> PropDecode {
    if depth <= MAX_TYPE_DEPTH {
        match p.type_.as_deref() {
            Some("array") => {
                if let Some(elem) = p.items.as_deref() {
                    if let Some((props, req)) = resolve_object(elem, types) {
                        return PropDecode::BlockList {
                            spec: make_object_spec(props, req, types, depth + 1),
                            min_one: required,
                        };
                    }
                }
            }
            Some("object") => {
                if let Some(elem) = p.additional_properties.as_deref() {
                    if let Some((props, req)) = resolve_object(elem, types) {
                        return PropDecode::BlockMap {
                            spec: make_object_spec(props, req, types, depth + 1),
                        };
                    }
                }
            }
            _ => {
                if let Some((props, req)) = resolve_object(p, types) {
                    return PropDecode::Block {
                        spec: make_object_spec(props, req, types, depth + 1),
                        required,
                    };
                }
            }
        }
    }

    PropDecode::Attr {
        typ: make_type(p, types, depth),
        required,
    }
}

fn make_object_spec(
    properties: &BTreeMap<String, PropertySpec>,
    required: &[String],
    types: &BTreeMap<String, PropertySpec>,
    depth: u32,
) -> ObjectSpec {
    properties
        .iter()
        .map(|(name, p)| {
            let req = required.iter().any(|r| r == name);
            (name.clone(), make_prop_decode(p, req, types, depth))
        })
        .collect()
}

// ----- Loading

/// The schema oracle: read and synthesize `<dir>/<pkg_name>.json`.
///
#[tracing::instrument]
pub fn load_schema(dir: &std::path::Path, pkg_name: &str) -> Result<PackageSchema, SchemaError> {
    trace!("loading schema");

    let path = dir.join(format!("{pkg_name}.json"));
    let data = fs::read_to_string(&path).map_err(|e| SchemaError::Load(pkg_name.to_owned(), e))?;
    let spec: PackageSpec =
        serde_json::from_str(&data).map_err(|e| SchemaError::Decode(pkg_name.to_owned(), e))?;

    let mut resources = BTreeMap::new();
    for (token, r) in &spec.resources {
        let canonical = canonicalize_token(token)?;
        resources.insert(
            canonical.clone(),
            Arc::new(ResourceSchema {
                token: canonical,
                spec: make_object_spec(&r.input_properties, &r.required_inputs, &spec.types, 0),
                outputs: r.properties.keys().cloned().collect(),
            }),
        );
    }

    let mut functions = BTreeMap::new();
    for (token, f) in &spec.functions {
        let canonical = canonicalize_token(token)?;
        let args_type = f
            .inputs
            .as_ref()
            .map(|i| make_type(i, &spec.types, 0))
            .unwrap_or(SchemaType::Dynamic);
        let return_type = f
            .outputs
            .as_ref()
            .map(|o| make_type(o, &spec.types, 0))
            .unwrap_or(SchemaType::Dynamic);
        let outputs = f
            .outputs
            .as_ref()
            .map(|o| o.properties.keys().cloned().collect())
            .unwrap_or_default();
        functions.insert(
            canonical.clone(),
            Arc::new(FunctionSchema {
                token: canonical,
                args_type,
                return_type,
                outputs,
            }),
        );
    }

    Ok(PackageSchema {
        name: if spec.name.is_empty() {
            pkg_name.to_owned()
        } else {
            spec.name
        },
        resources,
        functions,
    })
}

/// Lazily-populated, concurrency-safe package schema cache.
///
#[derive(Debug)]
pub struct SchemaCache {
    dir: PathBuf,
    loaded: Mutex<BTreeMap<String, Arc<PackageSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        SchemaCache::with_dir(PathBuf::from("."))
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        SchemaCache {
            dir: dir.into(),
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ensure(&self, pkg_name: &str) -> Result<Arc<PackageSchema>, SchemaError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schema) = loaded.get(pkg_name) {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(load_schema(&self.dir, pkg_name)?);
        loaded.insert(pkg_name.to_owned(), Arc::clone(&schema));
        Ok(schema)
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        SchemaCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCHEMA: &str = r##"{
        "name": "pkg",
        "resources": {
            "pkg:index/thing:Thing": {
                "inputProperties": {
                    "count": {"type": "integer"},
                    "tags": {"type": "object", "additionalProperties": {"type": "string"}},
                    "rules": {"type": "array", "items": {"$ref": "#/types/pkg:index:Rule"}},
                    "endpoints": {"type": "object", "additionalProperties": {"$ref": "#/types/pkg:index:Rule"}},
                    "settings": {"$ref": "#/types/pkg:index:Rule"},
                    "source": {"$ref": "pulumi.json#/Asset"}
                },
                "requiredInputs": ["count"],
                "properties": {
                    "arn": {"type": "string"},
                    "count": {"type": "integer"}
                }
            }
        },
        "functions": {
            "pkg:index/getThing:getThing": {
                "inputs": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                },
                "outputs": {
                    "type": "object",
                    "properties": {"arn": {"type": "string"}, "zone": {"type": "string"}}
                }
            }
        },
        "types": {
            "pkg:index:Rule": {
                "type": "object",
                "properties": {"port": {"type": "number"}, "open": {"type": "boolean"}},
                "required": ["port"]
            }
        }
    }"##;

    fn write_schema(dir: &std::path::Path) {
        let mut f = std::fs::File::create(dir.join("pkg.json")).unwrap();
        f.write_all(SCHEMA.as_bytes()).unwrap();
    }

    #[test]
    fn test_decompose_token() {
        let (pkg, module, member) = decompose_token("aws:s3/bucket:Bucket").unwrap();
        assert_eq!((pkg, module, member), ("aws", "s3/bucket", "Bucket"));

        assert!(decompose_token("no-colons").is_err());
        assert!(decompose_token("a:b:c:d").is_err());
        assert!(decompose_token(":b:c").is_err());
    }

    #[test]
    fn test_canonicalize_token() {
        assert_eq!(
            canonicalize_token("aws:s3/bucket:Bucket").unwrap(),
            "aws:s3:Bucket"
        );
        assert_eq!(canonicalize_token("pkg:m:R").unwrap(), "pkg:m:R");
    }

    #[test]
    fn test_spec_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path());

        let schema = load_schema(dir.path(), "pkg").unwrap();
        let r = schema.resource("pkg:index/thing:Thing").unwrap();
        assert_eq!(r.token, "pkg:index:Thing");

        // Scalar attribute, required.
        //
        assert!(matches!(
            r.spec.get("count"),
            Some(PropDecode::Attr { typ: SchemaType::Number, required: true })
        ));

        // Map of scalars stays an attribute.
        //
        assert!(matches!(r.spec.get("tags"), Some(PropDecode::Attr { .. })));

        // Array of objects becomes a repeatable block.
        //
        match r.spec.get("rules") {
            Some(PropDecode::BlockList { spec, min_one: false }) => {
                assert!(matches!(
                    spec.get("port"),
                    Some(PropDecode::Attr { typ: SchemaType::Number, required: true })
                ));
            }
            other => panic!("rules synthesized as {other:?}"),
        }

        // Map of objects becomes a labelled block.
        //
        assert!(matches!(r.spec.get("endpoints"), Some(PropDecode::BlockMap { .. })));

        // Plain object becomes a single block.
        //
        assert!(matches!(
            r.spec.get("settings"),
            Some(PropDecode::Block { required: false, .. })
        ));

        // Capsule type.
        //
        assert!(matches!(
            r.spec.get("source"),
            Some(PropDecode::Attr { typ: SchemaType::Asset, .. })
        ));

        assert_eq!(r.outputs, vec!["arn".to_string(), "count".to_string()]);
    }

    #[test]
    fn test_function_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path());

        let schema = load_schema(dir.path(), "pkg").unwrap();
        let f = schema.function("pkg:index/getThing:getThing").unwrap();
        assert_eq!(f.token, "pkg:index:getThing");
        assert!(matches!(f.args_type, SchemaType::Object(_)));
        assert_eq!(f.outputs, vec!["arn".to_string(), "zone".to_string()]);

        assert!(matches!(
            schema.function("pkg:index:nope"),
            Err(SchemaError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_cache_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path());

        let cache = SchemaCache::with_dir(dir.path());
        let first = cache.ensure("pkg").unwrap();
        let second = cache.ensure("pkg").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(matches!(cache.ensure("missing"), Err(SchemaError::Load(..))));
    }
}
