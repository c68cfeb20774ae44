//! Typed positional arguments for chat commands.
//!
//! Commands declare an ordered list of [`Arg`]s. Parsing never fails with an
//! error the caller must handle beyond replying: an [`ArgError`] renders as
//! the usage line followed by what went wrong.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("{usage}\n{message}")]
    Invalid { usage: String, message: String },
}

impl ArgError {
    pub fn message(&self) -> &str {
        match self {
            ArgError::Invalid { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Int,
    Float,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            ArgKind::String => "str",
            ArgKind::Int => "int",
            ArgKind::Float => "float",
        }
    }

    fn convert(self, token: &str) -> Option<Value> {
        match self {
            ArgKind::String => Some(Value::String(token.to_string())),
            ArgKind::Int => token.parse::<i64>().ok().map(Value::from),
            ArgKind::Float => token
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
        }
    }
}

/// One declared argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: String,
    pub kind: ArgKind,
    pub optional: bool,
    pub default: Option<Value>,
    /// Swallow every remaining token as a list of strings.
    pub remainder: bool,
    pub help: Option<String>,
    pub choices: Vec<String>,
}

impl Arg {
    fn new(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
            remainder: false,
            help: None,
            choices: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Float)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Value used when an optional argument is absent. Implies optional.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.optional = true;
        self.default = Some(value.into());
        self
    }

    pub fn remainder(mut self) -> Self {
        self.remainder = true;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    fn required(&self) -> bool {
        !self.optional && !self.remainder
    }

    fn convert(&self, token: &str) -> Result<Value, String> {
        let value = self.kind.convert(token).ok_or_else(|| {
            format!("argument {}: invalid {} value: '{}'", self.name, self.kind.name(), token)
        })?;
        if !self.choices.is_empty() && !self.choices.iter().any(|c| c == token) {
            let choices = self
                .choices
                .iter()
                .map(|c| format!("'{c}'"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!(
                "argument {}: invalid choice: '{}' (choose from {})",
                self.name, token, choices
            ));
        }
        Ok(value)
    }
}

/// Ordered argument list of one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Argspec {
    command: String,
    args: Vec<Arg>,
}

impl Argspec {
    pub fn new(command: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// `usage: !cmd name [count] [rest ...]`
    pub fn usage(&self) -> String {
        let mut usage = format!("usage: {}", self.command);
        for arg in &self.args {
            if arg.remainder {
                let _ = write!(usage, " [{} ...]", arg.name);
            } else if arg.optional {
                let _ = write!(usage, " [{}]", arg.name);
            } else {
                let _ = write!(usage, " {}", arg.name);
            }
        }
        usage
    }

    /// Usage plus one line per argument that has help text.
    pub fn help(&self) -> String {
        let mut text = self.usage();
        for arg in self.args.iter().filter(|a| a.help.is_some()) {
            let _ = write!(text, "\n  {}: {}", arg.name, arg.help.as_deref().unwrap_or_default());
        }
        text
    }

    fn fail(&self, message: String) -> ArgError {
        ArgError::Invalid {
            usage: self.usage(),
            message,
        }
    }

    /// Match `tokens` against the declared arguments.
    ///
    /// An optional argument only takes a token when enough tokens remain for
    /// every required argument after it.
    pub fn parse<S: AsRef<str>>(&self, tokens: &[S]) -> Result<ParsedArgs, ArgError> {
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();
        let mut next = 0;

        for (position, arg) in self.args.iter().enumerate() {
            let remaining = tokens.len() - next;
            if arg.remainder {
                let rest: Vec<Value> = tokens[next..]
                    .iter()
                    .map(|t| Value::String(t.as_ref().to_string()))
                    .collect();
                next = tokens.len();
                values.insert(arg.name.clone(), Value::Array(rest));
                continue;
            }

            let required_after = self.args[position + 1..]
                .iter()
                .filter(|a| a.required())
                .count();
            let take = if arg.optional {
                remaining > required_after
            } else {
                remaining > 0
            };

            if take {
                let value = arg.convert(tokens[next].as_ref()).map_err(|m| self.fail(m))?;
                values.insert(arg.name.clone(), value);
                next += 1;
            } else if arg.optional {
                values.insert(arg.name.clone(), arg.default.clone().unwrap_or(Value::Null));
            } else {
                missing.push(arg.name.as_str());
            }
        }

        if !missing.is_empty() {
            return Err(self.fail(format!(
                "the following arguments are required: {}",
                missing.join(", ")
            )));
        }
        if next < tokens.len() {
            let extra = tokens[next..]
                .iter()
                .map(|t| t.as_ref())
                .collect::<Vec<&str>>()
                .join(" ");
            return Err(self.fail(format!("unrecognized arguments: {extra}")));
        }
        Ok(ParsedArgs { values })
    }
}

/// Arguments parsed for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArgs {
    values: BTreeMap<String, Value>,
}

impl ParsedArgs {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    /// Decode argument `name`. `None` when absent or of another type.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.value(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Remainder argument joined back with spaces.
    pub fn joined(&self, name: &str) -> String {
        self.get::<Vec<String>>(name)
            .map(|words| words.join(" "))
            .unwrap_or_default()
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.values
    }
}
