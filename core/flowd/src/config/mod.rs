//! Declarations of the pipeline.
//!
//! A pipeline is a list of [`Block`]s. In the configuration file, each block is an
//! element of the `component` array:
//!
//! ```toml
//! [[component]]
//! type = "local.value"
//! label = "source"
//! arguments = { value = 5 }
//!
//! [[component]]
//! type = "local.value"
//! label = "sink"
//! expressions = { value = "local.value.source.value * 2" }
//! ```
//!
//! `arguments` contains literal values, `expressions` contains expressions of the
//! [syntax](crate::syntax) module, which can refer to the outputs of other units.
//!
//! Blocks of type `foreach` instantiate their `template` once per item of a collection:
//!
//! ```toml
//! [[component]]
//! type = "foreach"
//! label = "targets"
//! arguments = { var = "item", id = "name" }
//! expressions = { collection = "local.value.targets.value" }
//!
//! [[component.template]]
//! type = "local.log"
//! label = "print"
//! expressions = { message = "item.name" }
//! ```

mod error;
mod loader;

pub use error::{ConfigError, InvalidSubstitutionError};
pub use loader::{Loader, merge_override, substitute_env};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::syntax::{self, Expr, ParseError};
use crate::value::Value;

/// Type name of the blocks that fan out their template.
pub const FOREACH: &str = "foreach";

/// A declaration of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Component(Declaration),
    ForEach(ForEachDeclaration),
}

/// Declaration of a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub type_name: String,
    pub label: String,
    /// Unevaluated arguments, in declaration order.
    pub arguments: IndexMap<String, Expr>,
}

/// Declaration of a `foreach` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ForEachDeclaration {
    pub label: String,
    pub arguments: ForEachArguments,
    pub template: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForEachArguments {
    /// Expression that evaluates to the array to iterate on.
    pub collection: Expr,
    /// Name of the variable that holds the current item in the template.
    pub var: String,
    /// Field of the items that identifies them, for items that are objects.
    pub id: Option<String>,
    /// Use a hash of the string items as their identity.
    pub hash_string_id: bool,
    /// Register the metrics of the template units.
    pub enable_metrics: bool,
}

impl Block {
    /// Identifier of the block, unique in its scope.
    pub fn id(&self) -> String {
        match self {
            Block::Component(decl) => decl.id(),
            Block::ForEach(decl) => decl.id(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Block::Component(decl) => &decl.label,
            Block::ForEach(decl) => &decl.label,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Block::Component(decl) => &decl.type_name,
            Block::ForEach(_) => FOREACH,
        }
    }

    /// Iterates on the expressions of the block, with the name of their argument.
    ///
    /// The expressions of a `foreach` template are not included: they are
    /// evaluated in the scope of each instance.
    pub fn expressions(&self) -> Box<dyn Iterator<Item = (&str, &Expr)> + '_> {
        match self {
            Block::Component(decl) => Box::new(decl.arguments.iter().map(|(k, v)| (k.as_str(), v))),
            Block::ForEach(decl) => Box::new(std::iter::once(("collection", &decl.arguments.collection))),
        }
    }
}

impl Declaration {
    pub fn new(type_name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            label: label.into(),
            arguments: IndexMap::new(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.type_name, self.label)
    }

    /// Adds a literal argument.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), Expr::Literal(value.into()));
        self
    }

    /// Parses and adds an argument given as an expression.
    pub fn with_expr(mut self, name: impl Into<String>, expr: &str) -> Result<Self, ParseError> {
        self.arguments.insert(name.into(), syntax::parse(expr)?);
        Ok(self)
    }
}

impl ForEachDeclaration {
    pub fn id(&self) -> String {
        format!("{FOREACH}.{}", self.label)
    }
}

impl From<Declaration> for Block {
    fn from(value: Declaration) -> Self {
        Block::Component(value)
    }
}

impl From<ForEachDeclaration> for Block {
    fn from(value: ForEachDeclaration) -> Self {
        Block::ForEach(value)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    #[serde(default)]
    component: Vec<RawBlock>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBlock {
    #[serde(rename = "type")]
    type_name: String,
    label: String,
    #[serde(default)]
    arguments: toml::Table,
    #[serde(default)]
    expressions: toml::Table,
    #[serde(default)]
    template: Vec<RawBlock>,
}

/// Turns a configuration table into a list of blocks.
pub fn parse_blocks(table: toml::Table) -> Result<Vec<Block>, ConfigError> {
    let raw: RawPipeline = table.try_into()?;
    raw.component.into_iter().map(convert_block).collect()
}

fn convert_block(raw: RawBlock) -> Result<Block, ConfigError> {
    let block_id = format!("{}.{}", raw.type_name, raw.label);
    let invalid = |message: String| ConfigError::InvalidBlock {
        block: block_id.clone(),
        message,
    };

    if !is_identifier(&raw.label) {
        return Err(invalid(format!(
            "label {:?} is not a valid identifier (letters, digits and underscores)",
            raw.label
        )));
    }
    if raw.type_name.is_empty() || !raw.type_name.split('.').all(is_identifier) {
        return Err(invalid(format!("type {:?} is not a valid type name", raw.type_name)));
    }

    let mut arguments: IndexMap<String, Expr> = IndexMap::new();
    for (name, value) in raw.arguments {
        arguments.insert(name, Expr::Literal(Value::from(value)));
    }
    for (name, value) in raw.expressions {
        let src = match value {
            toml::Value::String(src) => src,
            other => {
                return Err(invalid(format!(
                    "expression {name:?} must be a string, not a {}",
                    other.type_str()
                )));
            }
        };
        if arguments.contains_key(&name) {
            return Err(invalid(format!(
                "argument {name:?} is defined both in arguments and expressions"
            )));
        }
        let expr = syntax::parse(&src).map_err(|source| ConfigError::InvalidExpression {
            block: block_id.clone(),
            argument: name.clone(),
            source,
        })?;
        arguments.insert(name, expr);
    }

    if raw.type_name != FOREACH {
        if !raw.template.is_empty() {
            return Err(invalid(String::from("only foreach blocks can have a template")));
        }
        return Ok(Block::Component(Declaration {
            type_name: raw.type_name,
            label: raw.label,
            arguments,
        }));
    }

    let collection = arguments
        .shift_remove("collection")
        .ok_or_else(|| invalid(String::from("missing argument \"collection\"")))?;
    let var = match arguments.shift_remove("var") {
        Some(Expr::Literal(Value::String(var))) => var,
        Some(_) => return Err(invalid(String::from("argument \"var\" must be a literal string"))),
        None => return Err(invalid(String::from("missing argument \"var\""))),
    };
    let id = match arguments.shift_remove("id") {
        Some(Expr::Literal(Value::String(id))) => Some(id),
        None => None,
        Some(_) => return Err(invalid(String::from("argument \"id\" must be a literal string"))),
    };
    let mut flag = |name: &str| match arguments.shift_remove(name) {
        Some(Expr::Literal(Value::Bool(b))) => Ok(b),
        None => Ok(false),
        Some(_) => Err(invalid(format!("argument {name:?} must be a literal boolean"))),
    };
    let hash_string_id = flag("hash_string_id")?;
    let enable_metrics = flag("enable_metrics")?;
    if let Some(unknown) = arguments.keys().next() {
        return Err(invalid(format!("unknown argument {unknown:?}")));
    }

    let template = raw
        .template
        .into_iter()
        .map(convert_block)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block::ForEach(ForEachDeclaration {
        label: raw.label,
        arguments: ForEachArguments {
            collection,
            var,
            id,
            hash_string_id,
            enable_metrics,
        },
        template,
    }))
}

/// Checks that `s` is a valid identifier: letters, digits and underscores, not starting with a digit.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::{Block, ConfigError, Declaration, Loader};
    use crate::syntax::{Expr, parse};
    use crate::value::Value;

    #[test]
    fn components() {
        let blocks = Loader::parse_str(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "source"
            arguments = { value = 5 }

            [[component]]
            type = "local.value"
            label = "sink"
            expressions = { value = "local.value.source.value * 2" }
        "#})
        .load()
        .unwrap();

        let source = Declaration::new("local.value", "source").with_value("value", 5i64);
        let sink = Declaration::new("local.value", "sink")
            .with_expr("value", "local.value.source.value * 2")
            .unwrap();
        assert_eq!(blocks, vec![Block::from(source), Block::from(sink)]);
        assert_eq!(blocks[1].id(), "local.value.sink");
    }

    #[test]
    fn foreach() {
        let blocks = Loader::parse_str(indoc! {r#"
            [[component]]
            type = "foreach"
            label = "targets"
            arguments = { var = "item", hash_string_id = true }
            expressions = { collection = "[\"a\", \"b\"]" }

            [[component.template]]
            type = "local.log"
            label = "print"
            expressions = { message = "item" }
        "#})
        .load()
        .unwrap();

        let [Block::ForEach(foreach)] = blocks.as_slice() else {
            panic!("expected one foreach block, got {blocks:?}");
        };
        assert_eq!(blocks[0].id(), "foreach.targets");
        assert_eq!(foreach.arguments.var, "item");
        assert_eq!(foreach.arguments.id, None);
        assert!(foreach.arguments.hash_string_id);
        assert!(!foreach.arguments.enable_metrics);
        assert_eq!(foreach.arguments.collection, parse(r#"["a", "b"]"#).unwrap());
        assert_eq!(foreach.template.len(), 1);
        assert_eq!(foreach.template[0].id(), "local.log.print");
    }

    #[test]
    fn literal_arguments() {
        let blocks = Loader::parse_str(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "table"
            arguments.value = { list = [1, 2], name = "x" }
        "#})
        .load()
        .unwrap();
        let Block::Component(decl) = &blocks[0] else {
            panic!("expected a component")
        };
        let expected = Value::object([("list", Value::from(vec![1i64, 2])), ("name", Value::from("x"))]);
        assert_eq!(decl.arguments["value"], Expr::Literal(expected));
    }

    fn load_err(src: &str) -> ConfigError {
        Loader::parse_str(src).load().unwrap_err()
    }

    #[test]
    fn invalid_blocks() {
        let err = load_err(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "a"
            arguments = { value = 1 }
            expressions = { value = "2" }
        "#});
        assert!(
            err.to_string().contains("both in arguments and expressions"),
            "unexpected error: {err}"
        );

        let err = load_err(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "a.b"
        "#});
        assert!(matches!(err, ConfigError::InvalidBlock { .. }), "unexpected error: {err:?}");

        let err = load_err(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "a"
            expressions = { value = "1 +" }
        "#});
        assert!(matches!(err, ConfigError::InvalidExpression { .. }), "unexpected error: {err:?}");

        let err = load_err(indoc! {r#"
            [[component]]
            type = "foreach"
            label = "f"
            arguments = { var = "item" }
        "#});
        assert!(err.to_string().contains("collection"), "unexpected error: {err}");

        let err = load_err(indoc! {r#"
            [[component]]
            type = "local.value"
            label = "a"
            typo = 1
        "#});
        assert!(matches!(err, ConfigError::InvalidToml(_)), "unexpected error: {err:?}");
    }
}
