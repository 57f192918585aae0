use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::syntax::ParseError;

/// Error returned by the [`Loader`](super::Loader).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("env var substitution failed")]
    Substitution(#[from] InvalidSubstitutionError),
    #[error("invalid TOML config")]
    InvalidToml(#[from] toml::de::Error),
    #[error("invalid declaration {block}: {message}")]
    InvalidBlock { block: String, message: String },
    #[error("invalid expression for argument {argument:?} of {block}")]
    InvalidExpression {
        block: String,
        argument: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSubstitutionError {
    /// The environment variable does not exist.
    #[error("the environment variable {0} does not exist")]
    Missing(String),
    /// The value of the variable is not valid UTF-8.
    #[error("value of env var {0} is not valid UTF-8")]
    InvalidValue(String),
    /// The substitution syntax has not been used properly.
    #[error("wrong use of the substitution syntax, it should be ${{ENV_VAR}}")]
    WrongSyntax,
}
