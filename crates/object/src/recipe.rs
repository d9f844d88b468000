use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ObjectError;
use crate::value::{ObjectData, Value, text};

/// Field name used by the versioned layer to chain revisions. Recipes that
/// declare it get the previous content hash injected on every new version.
pub const PREVIOUS_VERSION: &str = "previousVersion";

/// Declarative field type inside a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemType {
    Text,
    Int,
    Number,
    Bool,
    /// Ordered sequence; order is hash-significant.
    ArrayOf(Box<ItemType>),
    /// Unordered collection; canonically sorted before hashing.
    SetOf(Box<ItemType>),
    /// Reference to a stored object of the named type, by content hash.
    ReferenceTo(String),
    /// Reference to a logical object of the named type, by id hash.
    ReferenceToId(String),
    /// Embedded record validated against the named recipe.
    Nested(String),
}

impl ItemType {
    /// Compact textual form used when a recipe is itself persisted as an
    /// object, e.g. `set<string>`, `ref<Message>`, `idref<Subject>`.
    pub fn render(&self) -> String {
        match self {
            ItemType::Text => "string".into(),
            ItemType::Int => "int".into(),
            ItemType::Number => "number".into(),
            ItemType::Bool => "bool".into(),
            ItemType::ArrayOf(inner) => format!("array<{}>", inner.render()),
            ItemType::SetOf(inner) => format!("set<{}>", inner.render()),
            ItemType::ReferenceTo(target) => format!("ref<{target}>"),
            ItemType::ReferenceToId(target) => format!("idref<{target}>"),
            ItemType::Nested(recipe) => format!("object<{recipe}>"),
        }
    }

    pub fn parse(input: &str) -> Result<Self, ObjectError> {
        let input = input.trim();
        let simple = match input {
            "string" => Some(ItemType::Text),
            "int" => Some(ItemType::Int),
            "number" => Some(ItemType::Number),
            "bool" => Some(ItemType::Bool),
            _ => None,
        };
        if let Some(item) = simple {
            return Ok(item);
        }
        let (outer, inner) = input
            .split_once('<')
            .and_then(|(outer, rest)| rest.strip_suffix('>').map(|inner| (outer, inner)))
            .ok_or_else(|| {
                ObjectError::InvalidEncoding(format!("unparseable item type `{input}`"))
            })?;
        match outer {
            "array" => Ok(ItemType::ArrayOf(Box::new(ItemType::parse(inner)?))),
            "set" => Ok(ItemType::SetOf(Box::new(ItemType::parse(inner)?))),
            "ref" => Ok(ItemType::ReferenceTo(inner.to_string())),
            "idref" => Ok(ItemType::ReferenceToId(inner.to_string())),
            "object" => Ok(ItemType::Nested(inner.to_string())),
            _ => Err(ObjectError::InvalidEncoding(format!(
                "unparseable item type `{input}`"
            ))),
        }
    }
}

/// One field declaration inside a recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub itemprop: String,
    pub itemtype: ItemType,
    pub optional: bool,
    pub is_id: bool,
}

impl FieldRule {
    pub fn required(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            itemtype,
            optional: false,
            is_id: false,
        }
    }

    pub fn optional(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            itemtype,
            optional: true,
            is_id: false,
        }
    }

    /// Required identity-forming field.
    pub fn id(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            itemtype,
            optional: false,
            is_id: true,
        }
    }

    /// Optional identity-forming field (e.g. the absent owner of a shared
    /// 1:1 channel — absence is part of the identity).
    pub fn id_optional(itemprop: impl Into<String>, itemtype: ItemType) -> Self {
        Self {
            itemprop: itemprop.into(),
            itemtype,
            optional: true,
            is_id: true,
        }
    }
}

/// A declarative schema for one object kind. Field order here is the
/// canonical encoding order.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub rules: Vec<FieldRule>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, rules: Vec<FieldRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    pub fn rule(&self, itemprop: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.itemprop == itemprop)
    }

    pub fn id_rules(&self) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter().filter(|r| r.is_id)
    }

    pub fn is_versioned(&self) -> bool {
        self.rule(PREVIOUS_VERSION).is_some()
    }

    /// Persistable form, validated against the built-in `Recipe` recipe.
    pub fn to_data(&self) -> ObjectData {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                Value::Object(
                    ObjectData::new(recipes::FIELD_RULE)
                        .with("itemprop", text(&rule.itemprop))
                        .with("itemtype", text(rule.itemtype.render()))
                        .with("optional", Value::Bool(rule.optional))
                        .with("isId", Value::Bool(rule.is_id)),
                )
            })
            .collect();
        ObjectData::new(recipes::RECIPE)
            .with("name", text(&self.name))
            .with("rules", Value::Array(rules))
    }

    pub fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        let name = data.text("name")?.to_string();
        let raw_rules = data
            .require("rules")?
            .as_array()
            .ok_or_else(|| ObjectError::InvalidEncoding("Recipe: rules must be array".into()))?;
        let mut rules = Vec::with_capacity(raw_rules.len());
        for raw in raw_rules {
            let rule = raw.as_object().ok_or_else(|| {
                ObjectError::InvalidEncoding("Recipe: rule must be nested object".into())
            })?;
            rules.push(FieldRule {
                itemprop: rule.text("itemprop")?.to_string(),
                itemtype: ItemType::parse(rule.text("itemtype")?)?,
                optional: rule.bool("optional")?,
                is_id: rule.bool("isId")?,
            });
        }
        Ok(Self { name, rules })
    }
}

/// Process-wide schema registry. Built once at startup from the built-in
/// seed set and passed around by `Arc` — never a hidden global.
#[derive(Debug)]
pub struct RecipeRegistry {
    recipes: HashMap<String, Arc<Recipe>>,
}

impl RecipeRegistry {
    pub fn empty() -> Self {
        Self {
            recipes: HashMap::new(),
        }
    }

    /// Registry seeded with every built-in entity recipe.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for recipe in builtin_recipes() {
            registry
                .register(recipe)
                .expect("builtin recipes are unique");
        }
        registry
    }

    /// Once registered a recipe version is frozen; re-registering the same
    /// name is rejected, schema evolution means registering a new name or
    /// bumping the recipe object's version through the store.
    pub fn register(&mut self, recipe: Recipe) -> Result<(), ObjectError> {
        if self.recipes.contains_key(&recipe.name) {
            return Err(ObjectError::validation(
                "name",
                format!("recipe `{}` already registered", recipe.name),
            ));
        }
        self.recipes.insert(recipe.name.clone(), Arc::new(recipe));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Recipe>, ObjectError> {
        self.recipes
            .get(name)
            .ok_or_else(|| ObjectError::UnknownRecipe(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Recipe>> {
        self.recipes.values()
    }

    /// Validate a record against its declared recipe: every required field
    /// present, every present field well-typed, no undeclared fields.
    pub fn validate(&self, data: &ObjectData) -> Result<(), ObjectError> {
        let recipe = self.get(data.kind())?;
        for rule in &recipe.rules {
            match data.get(&rule.itemprop) {
                None if rule.optional => {}
                None => {
                    return Err(ObjectError::validation(
                        &rule.itemprop,
                        "required field is missing",
                    ));
                }
                Some(value) => self.validate_value(&rule.itemprop, value, &rule.itemtype)?,
            }
        }
        for field in data.field_names() {
            if recipe.rule(field).is_none() {
                return Err(ObjectError::validation(
                    field,
                    format!("field not declared by recipe `{}`", recipe.name),
                ));
            }
        }
        Ok(())
    }

    fn validate_value(
        &self,
        field: &str,
        value: &Value,
        expected: &ItemType,
    ) -> Result<(), ObjectError> {
        let mismatch = || {
            ObjectError::validation(
                field,
                format!(
                    "expected {}, found {}",
                    expected.render(),
                    value.type_name()
                ),
            )
        };
        match (expected, value) {
            (ItemType::Text, Value::Text(_)) => Ok(()),
            (ItemType::Int, Value::Int(_)) => Ok(()),
            (ItemType::Number, Value::Number(number)) => {
                if number.is_nan() {
                    Err(ObjectError::validation(field, "NaN is not hashable"))
                } else {
                    Ok(())
                }
            }
            (ItemType::Bool, Value::Bool(_)) => Ok(()),
            (ItemType::ArrayOf(inner), Value::Array(elements))
            | (ItemType::SetOf(inner), Value::Set(elements)) => {
                for element in elements {
                    self.validate_value(field, element, inner)?;
                }
                Ok(())
            }
            (ItemType::ReferenceTo(_), Value::Reference(_)) => Ok(()),
            (ItemType::ReferenceToId(_), Value::IdReference(_)) => Ok(()),
            (ItemType::Nested(recipe), Value::Object(nested)) => {
                if nested.kind() != recipe {
                    return Err(ObjectError::validation(
                        field,
                        format!(
                            "nested object is `{}`, expected `{recipe}`",
                            nested.kind()
                        ),
                    ));
                }
                self.validate(nested)
            }
            _ => Err(mismatch()),
        }
    }
}

/// Built-in recipe names.
pub mod recipes {
    pub const RECIPE: &str = "Recipe";
    pub const FIELD_RULE: &str = "FieldRule";
    pub const PERSON: &str = "Person";
    pub const GROUP: &str = "Group";
    pub const TOPIC: &str = "Topic";
    pub const CHANNEL: &str = "Channel";
    pub const ENTRY: &str = "Entry";
    pub const MESSAGE: &str = "Message";
    pub const ATTACHMENT: &str = "Attachment";
    pub const KEYWORD: &str = "Keyword";
    pub const SUBJECT: &str = "Subject";
    pub const SUMMARY: &str = "Summary";
    pub const SUMMARY_SUBJECT: &str = "SummarySubject";
    pub const ANALYSIS_CURSOR: &str = "AnalysisCursor";
    pub const PROPOSAL_CONFIG: &str = "ProposalConfig";
    pub const ACCESS_GRANT: &str = "AccessGrant";
    pub const USER_SETTINGS: &str = "UserSettings";
}

fn builtin_recipes() -> Vec<Recipe> {
    use FieldRule as F;
    use ItemType as T;
    let previous_version = || F::optional(PREVIOUS_VERSION, T::ReferenceTo(String::new()));

    vec![
        Recipe::new(
            recipes::FIELD_RULE,
            vec![
                F::required("itemprop", T::Text),
                F::required("itemtype", T::Text),
                F::required("optional", T::Bool),
                F::required("isId", T::Bool),
            ],
        ),
        Recipe::new(
            recipes::RECIPE,
            vec![
                F::id("name", T::Text),
                F::required("rules", T::ArrayOf(Box::new(T::Nested(
                    recipes::FIELD_RULE.into(),
                )))),
            ],
        ),
        Recipe::new(
            recipes::PERSON,
            vec![
                F::id("email", T::Text),
                F::optional("name", T::Text),
                F::required("deactivated", T::Bool),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::GROUP,
            vec![
                F::id("groupId", T::Text),
                F::required("members", T::SetOf(Box::new(T::Text))),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::TOPIC,
            vec![
                F::id("topicId", T::Text),
                F::optional("title", T::Text),
                F::required("sharingEnabled", T::Bool),
                F::required("createdAt", T::Int),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::CHANNEL,
            vec![
                F::id("topicId", T::Text),
                F::id_optional("owner", T::Text),
                F::optional("head", T::ReferenceTo(recipes::ENTRY.into())),
                F::required("entryCount", T::Int),
                previous_version(),
            ],
        ),
        // Every Entry field forms its identity: the entry IS its position
        // in the channel's hash chain.
        Recipe::new(
            recipes::ENTRY,
            vec![
                F::id("topicId", T::Text),
                F::id_optional("owner", T::Text),
                F::id_optional("previousEntry", T::ReferenceTo(recipes::ENTRY.into())),
                F::id("dataHash", T::ReferenceTo(String::new())),
                F::id("creationTime", T::Int),
            ],
        ),
        Recipe::new(
            recipes::MESSAGE,
            vec![
                F::id_optional("channelOwner", T::Text),
                F::id("createdAt", T::Int),
                F::id("author", T::Text),
                F::id("textHash", T::Text),
                F::required("text", T::Text),
                F::required(
                    "attachments",
                    T::ArrayOf(Box::new(T::ReferenceTo(recipes::ATTACHMENT.into()))),
                ),
            ],
        ),
        Recipe::new(
            recipes::ATTACHMENT,
            vec![
                F::id("name", T::Text),
                F::id("dataHash", T::Text),
                F::optional("mimeType", T::Text),
            ],
        ),
        Recipe::new(
            recipes::KEYWORD,
            vec![
                F::id("term", T::Text),
                F::required("frequency", T::Int),
                F::optional("score", T::Number),
                F::required(
                    "subjects",
                    T::SetOf(Box::new(T::ReferenceToId(recipes::SUBJECT.into()))),
                ),
                F::required("lastSeen", T::Int),
                F::required("deleted", T::Bool),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::SUBJECT,
            vec![
                F::id("topicId", T::Text),
                F::id("keywordSetHash", T::Text),
                F::required("name", T::Text),
                F::required("keywords", T::SetOf(Box::new(T::Text))),
                F::required("messageCount", T::Int),
                F::required("timestamp", T::Int),
                F::required("archived", T::Bool),
                F::optional("archivedAt", T::Int),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::SUMMARY_SUBJECT,
            vec![
                F::required("subject", T::ReferenceToId(recipes::SUBJECT.into())),
                F::required("weight", T::Number),
            ],
        ),
        // Summary.subjects is an ordered sequence — weights are
        // order-significant, unlike Subject.keywords which is a set.
        Recipe::new(
            recipes::SUMMARY,
            vec![
                F::id("topicId", T::Text),
                F::required("version", T::Int),
                F::required("content", T::Text),
                F::required(
                    "subjects",
                    T::ArrayOf(Box::new(T::Nested(recipes::SUMMARY_SUBJECT.into()))),
                ),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::ANALYSIS_CURSOR,
            vec![
                F::id("topicId", T::Text),
                F::optional("lastAnalyzedEntry", T::ReferenceTo(recipes::ENTRY.into())),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::PROPOSAL_CONFIG,
            vec![
                F::id("userEmail", T::Text),
                F::required("matchWeight", T::Number),
                F::required("recencyWeight", T::Number),
                F::required("recencyWindowDays", T::Int),
                F::required("minJaccard", T::Number),
                F::required("maxProposals", T::Int),
                F::required("updated", T::Int),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::ACCESS_GRANT,
            vec![
                F::id("objectId", T::ReferenceToId(String::new())),
                F::id("mode", T::Text),
                F::required("persons", T::SetOf(Box::new(T::Text))),
                F::required("groups", T::SetOf(Box::new(T::Text))),
                previous_version(),
            ],
        ),
        Recipe::new(
            recipes::USER_SETTINGS,
            vec![
                F::id("userEmail", T::Text),
                F::optional("llmEndpoint", T::Text),
                F::optional("llmModel", T::Text),
                F::optional("apiTokenCipher", T::Text),
                F::required("updated", T::Int),
                previous_version(),
            ],
        ),
    ]
}
