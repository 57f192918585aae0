use std::borrow::Cow;
use std::env::VarError;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::{ConfigError, InvalidSubstitutionError};
use super::{Block, parse_blocks};

/// Loads a TOML configuration, from a file or from a string.
///
/// The same loader is used for the pipeline (see [`load`](Self::load)) and for the
/// settings of the agent (see [`load_table`](Self::load_table)).
pub struct Loader {
    source: Source,
    overrides: Option<toml::Table>,
    substitute_env: bool,
}

enum Source {
    File(PathBuf),
    Str(String),
}

impl Loader {
    /// Creates a new `Loader` that will read `config_file` on load.
    pub fn parse_file<P: Into<PathBuf>>(config_file: P) -> Self {
        Self::new(Source::File(config_file.into()))
    }

    /// Creates a new `Loader` that will parse `content` on load.
    pub fn parse_str(content: impl Into<String>) -> Self {
        Self::new(Source::Str(content.into()))
    }

    fn new(source: Source) -> Self {
        Self {
            source,
            overrides: None,
            substitute_env: true,
        }
    }

    /// Overrides the content of the configuration by [merging](merge_override) it
    /// with another table.
    ///
    /// Multiple overrides can be set. The overrides are applied in order.
    pub fn with_override(mut self, config_override: toml::Table) -> Self {
        match &mut self.overrides {
            Some(existing) => merge_override(existing, config_override),
            None => self.overrides = Some(config_override),
        }
        self
    }

    /// Enables or disables the substitution of environment variables (enabled by default).
    ///
    /// Variable substitution is performed _before_ passing the content of the config
    /// file to the TOML parser.
    pub fn substitute_env_variables(mut self, substitute_env: bool) -> Self {
        self.substitute_env = substitute_env;
        self
    }

    /// Loads the configuration as a raw TOML table.
    pub fn load_table(self) -> Result<toml::Table, ConfigError> {
        let content = match self.source {
            Source::File(path) => match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(source) => return Err(ConfigError::Read { path, source }),
            },
            Source::Str(content) => content,
        };
        let content = if self.substitute_env {
            substitute_env(&content)?
        } else {
            Cow::Borrowed(content.as_str())
        };
        let mut table = toml::Table::from_str(&content)?;
        if let Some(overrides) = self.overrides {
            merge_override(&mut table, overrides);
        }
        Ok(table)
    }

    /// Loads the configuration as a pipeline.
    pub fn load(self) -> Result<Vec<Block>, ConfigError> {
        parse_blocks(self.load_table()?)
    }
}

/// Replaces the pattern `${VAR_NAME}` by the value of the `VAR_NAME` environment
/// variable.
///
/// The pattern can be escaped to prevent its replacement: `\${NOT_A_VAR}`.
/// If a variable does not exist or is invalid, returns an error.
pub fn substitute_env(input: &str) -> Result<Cow<'_, str>, InvalidSubstitutionError> {
    if !input.contains("${") {
        return Ok(Cow::Borrowed(input));
    }

    let mut res = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(begin) = rest.find("${") {
        if begin > 0 && rest.as_bytes()[begin - 1] == b'\\' {
            // escaped: drop the '\' and keep "${" verbatim
            res.push_str(&rest[..begin - 1]);
            res.push_str("${");
            rest = &rest[begin + 2..];
            continue;
        }
        res.push_str(&rest[..begin]);
        let after = &rest[begin + 2..];
        let end = after.find('}').ok_or(InvalidSubstitutionError::WrongSyntax)?;
        let name = &after[..end];
        if name.contains("${") {
            return Err(InvalidSubstitutionError::WrongSyntax);
        }
        match std::env::var(name) {
            Ok(value) => res.push_str(&value),
            Err(VarError::NotPresent) => return Err(InvalidSubstitutionError::Missing(name.to_owned())),
            Err(VarError::NotUnicode(_)) => return Err(InvalidSubstitutionError::InvalidValue(name.to_owned())),
        }
        rest = &after[end + 1..];
    }
    res.push_str(rest);
    Ok(Cow::Owned(res))
}

/// Merges two toml tables by overriding the content of `original`
/// with the content of `overrider`.
///
/// This function performs a **deep merge** of tables. Arrays are replaced.
pub fn merge_override(original: &mut toml::Table, overrider: toml::Table) {
    for (key, value) in overrider {
        match original.entry(key) {
            toml::map::Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
            toml::map::Entry::Occupied(mut occupied) => match (occupied.get_mut(), value) {
                (toml::Value::Table(existing), toml::Value::Table(table_override)) => {
                    merge_override(existing, table_override);
                }
                (_, value) => {
                    occupied.insert(value);
                }
            },
        }
    }
}
