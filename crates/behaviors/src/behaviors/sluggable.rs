//! Sluggable: URL-friendly identifiers built from source fields

use std::fmt;

use deunicode::deunicode;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::hierarchy_root;
use crate::config::ExtensionsConfig;
use crate::entity::{is_blank, value_to_text, Entity};
use crate::error::{BehaviorError, BehaviorResult, ConfigurationError, MutationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{ClassMetadata, ExtensionConfig, ExtensionMetadataFactory, ExtensionSchema, MappingRegistry, RoleDescriptor};
use crate::unit_of_work::{ChangeSet, ObjectId, UnitOfWork};

const NAME: &str = "sluggable";
pub const SLUG: &str = "slug";

const SUBSCRIBED: &[Phase] = &[Phase::LoadClassMetadata, Phase::PrePersist, Phase::PreUpdate];

/// Letter case applied to slug words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlugStyle {
    #[default]
    Default,
    Lower,
    Upper,
    Camel,
}

impl SlugStyle {
    pub fn parse(style: &str) -> Option<Self> {
        match style {
            "default" => Some(Self::Default),
            "lower" => Some(Self::Lower),
            "upper" => Some(Self::Upper),
            "camel" => Some(Self::Camel),
            _ => None,
        }
    }

    fn apply(self, word: &str) -> String {
        match self {
            Self::Default | Self::Lower => word.to_ascii_lowercase(),
            Self::Upper => word.to_ascii_uppercase(),
            Self::Camel => {
                let lower = word.to_ascii_lowercase();
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
        }
    }
}

impl fmt::Display for SlugStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Camel => "camel",
        };
        f.write_str(name)
    }
}

/// Turn free text into separator-joined ASCII words. Non-Latin scripts are
/// transliterated first.
pub fn slugify(text: &str, separator: &str, style: SlugStyle) -> String {
    deunicode(text)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| style.apply(word))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Settings of one slug field after defaults are applied
#[derive(Debug, Clone, PartialEq)]
struct SlugOptions {
    separator: String,
    style: SlugStyle,
    unique: bool,
    updatable: bool,
    prefix: String,
    suffix: String,
}

const DEFAULT_RELATIVE_SEPARATOR: &str = "/";

/// Slug prefixed with the slug of the object behind a single-valued association
#[derive(Debug, Clone, PartialEq)]
struct RelativeSlug {
    relation_field: String,
    relation_slug_field: String,
    separator: String,
}

/// Objects of `relation_class` whose relative slug starts with this slug;
/// their prefix follows when this slug changes
#[derive(Debug, Clone, PartialEq)]
struct InversedRelativeSlug {
    relation_class: String,
    mapped_by: String,
    inverse_slug_field: String,
}

#[derive(Debug, Clone, PartialEq)]
enum SlugHandler {
    Relative(RelativeSlug),
    InversedRelative(InversedRelativeSlug),
}

impl SlugHandler {
    fn as_relative(&self) -> Option<&RelativeSlug> {
        match self {
            Self::Relative(relative) => Some(relative),
            Self::InversedRelative(_) => None,
        }
    }

    fn as_inversed(&self) -> Option<&InversedRelativeSlug> {
        match self {
            Self::InversedRelative(inversed) => Some(inversed),
            Self::Relative(_) => None,
        }
    }
}

/// Parse the `handlers` option: a list of handler names or tables with a
/// `handler` key and the handler's options
fn parse_handlers(descriptor: &RoleDescriptor) -> Result<Vec<SlugHandler>, String> {
    match descriptor.option("handlers") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries.iter().map(parse_handler).collect(),
        Some(other) => Err(format!("expected a list of handlers, got {}", other)),
    }
}

fn parse_handler(entry: &Value) -> Result<SlugHandler, String> {
    let bare = Map::new();
    let (name, options) = match entry {
        Value::String(name) => (name.as_str(), &bare),
        Value::Object(options) => match options.get("handler").and_then(Value::as_str) {
            Some(name) => (name, options),
            None => return Err("handler table needs a 'handler' name".to_string()),
        },
        other => return Err(format!("expected a handler name or table, got {}", other)),
    };

    let text = |key: &str| -> Result<Option<String>, String> {
        match options.get(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(format!("{} handler option '{}' must be a string", name, key)),
        }
    };
    let required = |key: &str| -> Result<String, String> {
        text(key)?.ok_or_else(|| format!("{} handler needs '{}'", name, key))
    };

    match name {
        "relative" => Ok(SlugHandler::Relative(RelativeSlug {
            relation_field: required("relationField")?,
            relation_slug_field: text("relationSlugField")?.unwrap_or_else(|| SLUG.to_string()),
            separator: text("separator")?.unwrap_or_else(|| DEFAULT_RELATIVE_SEPARATOR.to_string()),
        })),
        "inversedRelative" => Ok(SlugHandler::InversedRelative(InversedRelativeSlug {
            relation_class: required("relationClass")?,
            mapped_by: required("mappedBy")?,
            inverse_slug_field: text("inverseSlugField")?.unwrap_or_else(|| SLUG.to_string()),
        })),
        "tree" | "treeSlug" => Err(format!("tree slug handler '{}' is not supported", name)),
        other => Err(format!("unknown slug handler '{}'", other)),
    }
}

fn handlers_of(class: &ClassMetadata, descriptor: &RoleDescriptor) -> Result<Vec<SlugHandler>, ConfigurationError> {
    parse_handlers(descriptor).map_err(|message| ConfigurationError::invalid_option(&class.name, NAME, "handlers", message))
}

pub struct SluggableListener {
    separator: String,
}

impl SluggableListener {
    pub fn new() -> Self {
        Self {
            separator: "-".to_string(),
        }
    }

    pub fn from_config(config: &ExtensionsConfig) -> Self {
        Self {
            separator: config.slug_separator.clone(),
        }
    }

    fn options(&self, descriptor: &RoleDescriptor) -> SlugOptions {
        SlugOptions {
            separator: descriptor
                .option_str("separator")
                .unwrap_or(&self.separator)
                .to_string(),
            style: descriptor
                .option_str("style")
                .and_then(SlugStyle::parse)
                .unwrap_or_default(),
            unique: descriptor.option_bool("unique", true),
            updatable: descriptor.option_bool("updatable", true),
            prefix: descriptor.option_str("prefix").unwrap_or_default().to_string(),
            suffix: descriptor.option_str("suffix").unwrap_or_default().to_string(),
        }
    }

    fn on_persist(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let scope = hierarchy_root(event, &class)?;
        let (oid, entity, uow) = event.split()?;
        let mut touched = false;

        for descriptor in config.role(SLUG) {
            let current = entity.field(&descriptor.field);
            let text = if is_blank(current.as_ref()) {
                source_text(&class, &*entity, descriptor)?
            } else {
                current.as_ref().and_then(value_to_text).unwrap_or_default()
            };
            touched |= self.assign(&class, &scope, oid, entity, &*uow, descriptor, &text)?;
        }

        if touched {
            uow.recompute_change_set(&class, oid, &*entity)?;
        }
        Ok(())
    }

    fn on_update(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let scope = hierarchy_root(event, &class)?;
        let metadata = event.metadata();
        let changes = event.change_set()?;
        let (oid, entity, uow) = event.split()?;
        let mut touched = false;

        for descriptor in config.role(SLUG) {
            let options = self.options(descriptor);
            let handlers = handlers_of(&class, descriptor)?;
            let regenerate = sources_changed(&changes, descriptor) || relation_changed(&changes, &handlers);
            let text = match manual_slug(&changes, &descriptor.field) {
                Some(text) => text,
                None if options.updatable && regenerate => source_text(&class, &*entity, descriptor)?,
                None => continue,
            };
            let previous = match changes.get(&descriptor.field) {
                Some(change) => change.old.clone(),
                None => entity.field(&descriptor.field).unwrap_or(Value::Null),
            };
            touched |= self.assign(&class, &scope, oid, entity, &*uow, descriptor, &text)?;

            let current = entity.field(&descriptor.field).unwrap_or(Value::Null);
            let id = entity.field(&class.identifier).unwrap_or(Value::Null);
            if let (Some(old), Some(new)) = (previous.as_str(), current.as_str()) {
                if old != new && !id.is_null() {
                    for inversed in handlers.iter().filter_map(SlugHandler::as_inversed) {
                        rewrite_inversed(metadata, uow, &id, inversed, old, new)?;
                    }
                }
            }
        }

        if touched {
            uow.recompute_change_set(&class, oid, &*entity)?;
        }
        Ok(())
    }

    /// Build the slug for `text` and write it when it differs; returns
    /// whether the object changed
    #[allow(clippy::too_many_arguments)]
    fn assign(
        &self,
        class: &ClassMetadata,
        scope: &str,
        oid: ObjectId,
        entity: &mut dyn Entity,
        uow: &dyn UnitOfWork,
        descriptor: &RoleDescriptor,
        text: &str,
    ) -> BehaviorResult<bool> {
        let options = self.options(descriptor);
        let body = slugify(text, &options.separator, options.style);
        if body.is_empty() {
            return Err(MutationError::invalid_value(
                &class.name,
                &descriptor.field,
                "no non-empty source field to build a slug from",
            )
            .into());
        }

        let handlers = handlers_of(class, descriptor)?;
        let related = relative_prefix(uow, class, &*entity, &handlers)?;
        let mut slug = format!("{}{}{}{}", options.prefix, related, body, options.suffix);
        if options.unique {
            slug = unique_slug(uow, scope, &descriptor.field, oid, &slug, &options.separator);
        }

        let slug = Value::from(slug);
        if entity.field(&descriptor.field).as_ref() == Some(&slug) {
            return Ok(false);
        }
        trace!(class = %class.name, field = %descriptor.field, slug = %slug, "slug generated");
        entity.set_field(&descriptor.field, slug)?;
        Ok(true)
    }
}

impl Default for SluggableListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionSchema for SluggableListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        if let Some(role) = config.role_names().find(|role| *role != SLUG) {
            return Err(ConfigurationError::unknown_role(&class.name, NAME, role));
        }

        for descriptor in config.role(SLUG) {
            match class.field_mapping(&descriptor.field) {
                Some(mapping) if mapping.field_type.is_textual() => {}
                Some(mapping) => {
                    return Err(ConfigurationError::invalid_field_type(
                        &class.name,
                        NAME,
                        &descriptor.field,
                        mapping.field_type.as_str(),
                        "string",
                    ))
                }
                None => {
                    return Err(ConfigurationError::invalid_field_type(
                        &class.name,
                        NAME,
                        &descriptor.field,
                        "association",
                        "string",
                    ))
                }
            }

            if descriptor.sources.is_empty() {
                return Err(ConfigurationError::invalid_option(
                    &class.name,
                    NAME,
                    "fields",
                    format!("slug '{}' declares no source fields", descriptor.field),
                ));
            }
            if let Some(source) = descriptor.sources.iter().find(|source| !class.has_field(source)) {
                return Err(ConfigurationError::invalid_field_type(
                    &class.name,
                    NAME,
                    source,
                    "association",
                    "a column",
                ));
            }

            if let Some(style) = descriptor.option("style") {
                if style.as_str().and_then(SlugStyle::parse).is_none() {
                    return Err(ConfigurationError::invalid_option(
                        &class.name,
                        NAME,
                        "style",
                        format!("expected default, lower, upper or camel, got {}", style),
                    ));
                }
            }
            for flag in ["unique", "updatable"] {
                if descriptor.option(flag).is_some_and(|value| !value.is_boolean()) {
                    return Err(ConfigurationError::invalid_option(&class.name, NAME, flag, "expected a boolean"));
                }
            }
            for text in ["separator", "prefix", "suffix"] {
                if descriptor.option(text).is_some_and(|value| !value.is_string()) {
                    return Err(ConfigurationError::invalid_option(&class.name, NAME, text, "expected a string"));
                }
            }

            for relative in handlers_of(class, descriptor)?.iter().filter_map(SlugHandler::as_relative) {
                match class.association_mapping(&relative.relation_field) {
                    Some(association) if association.kind.is_single_valued() => {}
                    Some(_) => {
                        return Err(ConfigurationError::invalid_field_type(
                            &class.name,
                            NAME,
                            &relative.relation_field,
                            "collection association",
                            "a single-valued association",
                        ))
                    }
                    None => {
                        return Err(ConfigurationError::invalid_field_type(
                            &class.name,
                            NAME,
                            &relative.relation_field,
                            "column",
                            "a single-valued association",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_references(
        &self,
        class: &ClassMetadata,
        config: &ExtensionConfig,
        mappings: &MappingRegistry,
    ) -> Result<(), ConfigurationError> {
        let invalid = |message: String| ConfigurationError::invalid_option(&class.name, NAME, "handlers", message);

        for descriptor in config.role(SLUG) {
            for handler in handlers_of(class, descriptor)? {
                match handler {
                    SlugHandler::Relative(relative) => {
                        let Some(association) = class.association_mapping(&relative.relation_field) else {
                            continue;
                        };
                        let target = mappings
                            .metadata(&association.target)
                            .ok_or_else(|| invalid(format!("related class '{}' is not mapped", association.target)))?;
                        if !target.has_field(&relative.relation_slug_field) {
                            return Err(invalid(format!(
                                "related class '{}' has no slug field '{}'",
                                target.name, relative.relation_slug_field
                            )));
                        }
                    }
                    SlugHandler::InversedRelative(inversed) => {
                        let related = mappings
                            .metadata(&inversed.relation_class)
                            .ok_or_else(|| invalid(format!("related class '{}' is not mapped", inversed.relation_class)))?;
                        if !related
                            .association_mapping(&inversed.mapped_by)
                            .is_some_and(|association| association.kind.is_single_valued())
                        {
                            return Err(invalid(format!(
                                "'{}' of '{}' must be a single-valued association",
                                inversed.mapped_by, related.name
                            )));
                        }
                        if !related.has_field(&inversed.inverse_slug_field) {
                            return Err(invalid(format!(
                                "related class '{}' has no slug field '{}'",
                                related.name, inversed.inverse_slug_field
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl BehaviorListener for SluggableListener {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let config = event.configuration(NAME)?;
        if config.is_empty() {
            return Ok(());
        }

        match event.phase() {
            Phase::PrePersist => self.on_persist(event, &config),
            Phase::PreUpdate => self.on_update(event, &config),
            _ => Ok(()),
        }
    }
}

fn source_text(class: &ClassMetadata, entity: &dyn Entity, descriptor: &RoleDescriptor) -> BehaviorResult<String> {
    let parts: Vec<String> = descriptor
        .sources
        .iter()
        .filter_map(|source| entity.field(source))
        .filter_map(|value| value_to_text(&value))
        .filter(|text| !text.trim().is_empty())
        .collect();

    if parts.is_empty() {
        return Err(MutationError::invalid_value(
            &class.name,
            &descriptor.field,
            "no non-empty source field to build a slug from",
        )
        .into());
    }
    Ok(parts.join(" "))
}

fn manual_slug(changes: &ChangeSet, field: &str) -> Option<String> {
    changes
        .get(field)
        .and_then(|change| value_to_text(&change.new))
        .filter(|text| !text.is_empty())
}

fn sources_changed(changes: &ChangeSet, descriptor: &RoleDescriptor) -> bool {
    descriptor.sources.iter().any(|source| changes.contains(source))
}

fn relation_changed(changes: &ChangeSet, handlers: &[SlugHandler]) -> bool {
    handlers
        .iter()
        .filter_map(SlugHandler::as_relative)
        .any(|relative| changes.contains(&relative.relation_field))
}

/// Slugs of the objects behind `relative` handlers, each followed by its separator
fn relative_prefix(
    uow: &dyn UnitOfWork,
    class: &ClassMetadata,
    entity: &dyn Entity,
    handlers: &[SlugHandler],
) -> BehaviorResult<String> {
    let mut prefix = String::new();
    for relative in handlers.iter().filter_map(SlugHandler::as_relative) {
        let related = entity.field(&relative.relation_field).unwrap_or(Value::Null);
        if related.is_null() {
            continue;
        }
        let association = class
            .association_mapping(&relative.relation_field)
            .ok_or_else(|| MutationError::unknown_field(&class.name, &relative.relation_field))?;
        let target = uow
            .class_metadata(&association.target)
            .ok_or_else(|| BehaviorError::unmapped(&association.target))?;

        let slug = uow
            .find_by(&target.name, &[(target.identifier.as_str(), related)])
            .into_iter()
            .find_map(|(_, fields)| fields.get(&relative.relation_slug_field).and_then(value_to_text))
            .filter(|slug| !slug.is_empty());
        if let Some(slug) = slug {
            prefix.push_str(&slug);
            prefix.push_str(&relative.separator);
        }
    }
    Ok(prefix)
}

/// Separator the related class puts after this slug in its relative slugs
fn relative_separator(metadata: &ExtensionMetadataFactory, inversed: &InversedRelativeSlug) -> BehaviorResult<String> {
    let config = metadata.extension_metadata(&inversed.relation_class, NAME)?;
    let separator = config
        .role(SLUG)
        .iter()
        .filter(|descriptor| descriptor.field == inversed.inverse_slug_field)
        .filter_map(|descriptor| parse_handlers(descriptor).ok())
        .flatten()
        .find_map(|handler| handler.as_relative().map(|relative| relative.separator.clone()));
    Ok(separator.unwrap_or_else(|| DEFAULT_RELATIVE_SEPARATOR.to_string()))
}

/// Replace the `old` prefix of every related slug with `new`
fn rewrite_inversed(
    metadata: &ExtensionMetadataFactory,
    uow: &mut dyn UnitOfWork,
    id: &Value,
    inversed: &InversedRelativeSlug,
    old: &str,
    new: &str,
) -> BehaviorResult<()> {
    let separator = relative_separator(metadata, inversed)?;
    let old_prefix = format!("{}{}", old, separator);
    let field = inversed.inverse_slug_field.as_str();

    let related = uow.find_by(&inversed.relation_class, &[(inversed.mapped_by.as_str(), id.clone())]);
    let mut rewritten = 0;
    for (other, fields) in related {
        let Some(slug) = fields.get(field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(rest) = slug.strip_prefix(&old_prefix) {
            let renamed = format!("{}{}{}", new, separator, rest);
            uow.schedule_extra_update(other, ChangeSet::single(field, slug, renamed))?;
            rewritten += 1;
        }
    }
    if rewritten > 0 {
        debug!(class = %inversed.relation_class, count = rewritten, from = old, to = new, "related slugs rewritten");
    }
    Ok(())
}

fn unique_slug(uow: &dyn UnitOfWork, scope: &str, field: &str, oid: ObjectId, slug: &str, separator: &str) -> String {
    let taken = |candidate: &str| {
        uow.find_by(scope, &[(field, Value::from(candidate))])
            .iter()
            .any(|(other, _)| *other != oid)
    };

    let mut candidate = slug.to_string();
    let mut counter = 0;
    while taken(&candidate) {
        counter += 1;
        candidate = format!("{}{}{}", slug, separator, counter);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{AssociationKind, FieldType};
    use serde_json::json;

    #[test]
    fn test_slugify_styles() {
        assert_eq!(slugify("Hello, World!", "-", SlugStyle::Default), "hello-world");
        assert_eq!(slugify("  Hello   World  ", "_", SlugStyle::Upper), "HELLO_WORLD");
        assert_eq!(slugify("hello wORLD", "-", SlugStyle::Camel), "Hello-World");
        assert_eq!(slugify("Crème Brûlée à Paris", "-", SlugStyle::Lower), "creme-brulee-a-paris");
        assert_eq!(slugify("Straße", "-", SlugStyle::Default), "strasse");
        assert_eq!(slugify("!!!", "-", SlugStyle::Default), "");
    }

    #[test]
    fn test_slugify_transliterates_other_scripts() {
        assert_eq!(slugify("Привет мир", "-", SlugStyle::Default), "privet-mir");
        assert_eq!(slugify("Ελλάδα", "-", SlugStyle::Default), "ellada");
        assert!(!slugify("北京", "-", SlugStyle::Default).is_empty());
    }

    #[test]
    fn test_handler_parsing() {
        let descriptor = RoleDescriptor::new("slug").with_sources(["name"]).with_option(
            "handlers",
            json!([
                {"handler": "relative", "relationField": "occupation"},
                {"handler": "inversedRelative", "relationClass": "app::Person", "mappedBy": "occupation"}
            ]),
        );
        assert_eq!(
            parse_handlers(&descriptor).unwrap(),
            vec![
                SlugHandler::Relative(RelativeSlug {
                    relation_field: "occupation".to_string(),
                    relation_slug_field: "slug".to_string(),
                    separator: "/".to_string(),
                }),
                SlugHandler::InversedRelative(InversedRelativeSlug {
                    relation_class: "app::Person".to_string(),
                    mapped_by: "occupation".to_string(),
                    inverse_slug_field: "slug".to_string(),
                }),
            ]
        );

        for rejected in [json!(["relative"]), json!(["tree"]), json!(["unheard"]), json!("relative")] {
            let descriptor = RoleDescriptor::new("slug").with_option("handlers", rejected.clone());
            assert!(parse_handlers(&descriptor).is_err(), "accepted {}", rejected);
        }
    }

    #[test]
    fn test_relative_handler_needs_single_valued_association() {
        let class = ClassMetadata::new("app::Person")
            .field("name", FieldType::String)
            .field("slug", FieldType::String)
            .field("nickname", FieldType::String)
            .association("occupation", "app::Occupation", AssociationKind::ManyToOne, None);
        let listener = SluggableListener::new();
        let relative_to = |field: &str| {
            ExtensionConfig::new().with_role(
                SLUG,
                RoleDescriptor::new("slug")
                    .with_sources(["name"])
                    .with_option("handlers", json!([{"handler": "relative", "relationField": field}])),
            )
        };

        assert!(listener.validate(&class, &relative_to("occupation")).is_ok());
        assert!(matches!(
            listener.validate(&class, &relative_to("nickname")),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));

        let mappings = MappingRegistry::new();
        assert!(matches!(
            listener.validate_references(&class, &relative_to("occupation"), &mappings),
            Err(ConfigurationError::InvalidOption { option, .. }) if option == "handlers"
        ));
        mappings
            .register(ClassMetadata::new("app::Occupation").field("slug", FieldType::String))
            .unwrap();
        assert!(listener.validate_references(&class, &relative_to("occupation"), &mappings).is_ok());
    }

    #[test]
    fn test_tree_handlers_are_rejected() {
        let class = ClassMetadata::new("app::Article")
            .field("title", FieldType::String)
            .field("slug", FieldType::String);
        let tree = ExtensionConfig::new().with_role(
            SLUG,
            RoleDescriptor::new("slug")
                .with_sources(["title"])
                .with_option("handlers", json!([{"handler": "tree", "parentRelationField": "parent"}])),
        );
        assert!(matches!(
            SluggableListener::new().validate(&class, &tree),
            Err(ConfigurationError::InvalidOption { option, .. }) if option == "handlers"
        ));
    }

    #[test]
    fn test_options_fall_back_to_listener_separator() {
        let listener = SluggableListener::from_config(&ExtensionsConfig {
            slug_separator: "_".to_string(),
            ..Default::default()
        });
        let options = listener.options(&RoleDescriptor::new("slug").with_sources(["title"]));
        assert_eq!(options.separator, "_");
        assert!(options.unique);
        assert!(options.updatable);
        assert_eq!(options.style, SlugStyle::Default);

        let options = listener.options(
            &RoleDescriptor::new("slug")
                .with_sources(["title"])
                .with_option("separator", ".")
                .with_option("unique", false)
                .with_option("style", "camel"),
        );
        assert_eq!(options.separator, ".");
        assert!(!options.unique);
        assert_eq!(options.style, SlugStyle::Camel);
    }

    #[test]
    fn test_validation() {
        let class = ClassMetadata::new("app::Article")
            .field("title", FieldType::String)
            .field("slug", FieldType::String)
            .field("views", FieldType::Integer);
        let listener = SluggableListener::new();

        let ok = ExtensionConfig::new().with_role(SLUG, RoleDescriptor::new("slug").with_sources(["title"]));
        assert!(listener.validate(&class, &ok).is_ok());

        let no_sources = ExtensionConfig::new().with_role(SLUG, RoleDescriptor::new("slug"));
        assert!(matches!(
            listener.validate(&class, &no_sources),
            Err(ConfigurationError::InvalidOption { .. })
        ));

        let numeric = ExtensionConfig::new().with_role(SLUG, RoleDescriptor::new("views").with_sources(["title"]));
        assert!(matches!(
            listener.validate(&class, &numeric),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));

        let bad_style = ExtensionConfig::new().with_role(
            SLUG,
            RoleDescriptor::new("slug").with_sources(["title"]).with_option("style", "shouty"),
        );
        assert!(listener.validate(&class, &bad_style).is_err());
    }
}
