use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{BehaviorResult, ConfigurationError};
use crate::mapping::class::ClassMetadata;
use crate::mapping::extension::{ExtensionConfig, RoleDescriptor};
use super::MetadataReader;

/// Keys accepted as the list of fields a role reads from
const SOURCE_KEYS: [&str; 3] = ["sources", "fields", "trackedField"];

/// Reads extension metadata from YAML mapping documents.
///
/// ```yaml
/// app::Article:
///   timestampable:
///     create: created
///     update: [updated]
///     change:
///       - { field: changed, trackedField: title, value: Test }
///   loggable:
///     options: { loggable: true }
///     versioned: [title]
/// ```
///
/// Under each extension, `options` holds class-level options and every other
/// key is a role. A role is a field name, a list of field names, or
/// descriptors with `field`, an optional source list and free-form options.
/// Documents are parsed up front, so a malformed document fails on load.
#[derive(Debug, Default)]
pub struct YamlReader {
    classes: HashMap<String, HashMap<String, ExtensionConfig>>,
}

impl YamlReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_str(document: &str) -> BehaviorResult<Self> {
        let mut reader = Self::new();
        reader.load_str(document)?;
        Ok(reader)
    }

    pub fn from_file(path: impl AsRef<Path>) -> BehaviorResult<Self> {
        let mut reader = Self::new();
        reader.load_file(path)?;
        Ok(reader)
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> BehaviorResult<()> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|err| {
            ConfigurationError::document(format!("{}: {}", path.display(), err))
        })?;
        self.load_str(&document)
    }

    /// Parse a document; classes it mentions replace earlier definitions
    pub fn load_str(&mut self, document: &str) -> BehaviorResult<()> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(document)
            .map_err(|err| ConfigurationError::document(err.to_string()))?;
        let root = serde_json::to_value(yaml)
            .map_err(|err| ConfigurationError::document(err.to_string()))?;

        let classes = match root {
            Value::Object(classes) => classes,
            Value::Null => return Ok(()),
            _ => return Err(ConfigurationError::document("top level must map class names").into()),
        };

        for (class, extensions) in classes {
            let parsed = parse_class(&class, extensions)?;
            debug!(class = %class, extensions = parsed.len(), "loaded yaml extension metadata");
            self.classes.insert(class, parsed);
        }
        Ok(())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

impl MetadataReader for YamlReader {
    fn read(&self, class: &ClassMetadata, extension: &str) -> BehaviorResult<ExtensionConfig> {
        Ok(self
            .classes
            .get(&class.name)
            .and_then(|extensions| extensions.get(extension))
            .cloned()
            .unwrap_or_default())
    }
}

fn parse_class(class: &str, extensions: Value) -> Result<HashMap<String, ExtensionConfig>, ConfigurationError> {
    let Value::Object(extensions) = extensions else {
        return Err(ConfigurationError::document(format!("{class}: expected a map of extensions")));
    };

    let mut parsed = HashMap::new();
    for (extension, body) in extensions {
        let config = parse_extension(class, &extension, body)?;
        parsed.insert(extension, config);
    }
    Ok(parsed)
}

fn parse_extension(class: &str, extension: &str, body: Value) -> Result<ExtensionConfig, ConfigurationError> {
    let Value::Object(entries) = body else {
        return Err(ConfigurationError::document(format!(
            "{class}.{extension}: expected a map of roles"
        )));
    };

    let mut config = ExtensionConfig::new();
    for (key, value) in entries {
        if key == "options" {
            let Value::Object(options) = value else {
                return Err(ConfigurationError::document(format!(
                    "{class}.{extension}.options: expected a map"
                )));
            };
            for (option, value) in options {
                config.set_option(option, value);
            }
            continue;
        }

        for descriptor in parse_role(class, extension, &key, value)? {
            config.add_role(key.clone(), descriptor);
        }
    }
    Ok(config)
}

fn parse_role(class: &str, extension: &str, role: &str, value: Value) -> Result<Vec<RoleDescriptor>, ConfigurationError> {
    let context = || format!("{class}.{extension}.{role}");
    match value {
        Value::String(field) => Ok(vec![RoleDescriptor::new(field)]),
        Value::Object(entry) => Ok(vec![parse_descriptor(&context(), entry)?]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(field) => Ok(RoleDescriptor::new(field)),
                Value::Object(entry) => parse_descriptor(&context(), entry),
                other => Err(ConfigurationError::document(format!(
                    "{}: unexpected entry {other}",
                    context()
                ))),
            })
            .collect(),
        other => Err(ConfigurationError::document(format!(
            "{}: unexpected value {other}",
            context()
        ))),
    }
}

fn parse_descriptor(context: &str, mut entry: Map<String, Value>) -> Result<RoleDescriptor, ConfigurationError> {
    let field = match entry.remove("field") {
        Some(Value::String(field)) => field,
        _ => return Err(ConfigurationError::document(format!("{context}: descriptor needs a 'field'"))),
    };

    let mut descriptor = RoleDescriptor::new(field);
    for key in SOURCE_KEYS {
        if let Some(sources) = entry.remove(key) {
            descriptor.sources.extend(parse_sources(context, sources)?);
        }
    }
    descriptor.options.extend(entry);
    Ok(descriptor)
}

fn parse_sources(context: &str, value: Value) -> Result<Vec<String>, ConfigurationError> {
    match value {
        Value::String(field) => Ok(vec![field]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(field) => Ok(field),
                other => Err(ConfigurationError::document(format!(
                    "{context}: source fields must be names, got {other}"
                ))),
            })
            .collect(),
        other => Err(ConfigurationError::document(format!(
            "{context}: source fields must be names, got {other}"
        ))),
    }
}
