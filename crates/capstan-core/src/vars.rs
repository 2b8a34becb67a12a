//! Variable namespace for step command and path substitution.

use crate::error::GraphError;
use regex::Regex;
use std::collections::BTreeMap;

/// Immutable set of substitution variables exposed to steps.
///
/// Supports `${NAME}` and `$NAME` references. A reference to an undefined
/// name is an error, never an empty substitution.
#[derive(Debug, Clone)]
pub struct VariableNamespace {
    vars: BTreeMap<String, String>,
    pattern: Regex,
}

impl VariableNamespace {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        let pattern = Regex::new(
            r"\$\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)\}|\$(?P<plain>[A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("substitution grammar is a valid regex");
        VariableNamespace { vars, pattern }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Copy with one additional variable (used for per-commit expansion).
    pub fn with(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.into(), value.into());
        VariableNamespace {
            vars,
            pattern: self.pattern.clone(),
        }
    }

    /// All variables, for injection into a step's environment.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Substitute every variable reference in `input`.
    pub fn substitute(&self, input: &str) -> Result<String, GraphError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in self.pattern.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            let Some(name) = caps.name("braced").or_else(|| caps.name("plain")) else {
                continue;
            };
            let value =
                self.vars
                    .get(name.as_str())
                    .ok_or_else(|| GraphError::UnknownVariable {
                        name: name.as_str().to_string(),
                    })?;
            out.push_str(&input[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }
}
