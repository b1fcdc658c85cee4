//! Environment variable expansion for config files.
//!
//! Supported forms:
//! - `$VAR` / `${VAR}`: required, an error is recorded when unset
//! - `${VAR:-fallback}`: fallback when unset or empty
//! - `${VAR-fallback}`: fallback only when unset
//! - `$$`: literal `$`

use regex::{Captures, Regex};
use std::sync::LazyLock;

static VAR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<mode>:?-) (?P<fallback>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("static pattern compiles")
});

/// Outcome of expanding a config document.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The expanded text.
    pub text: String,
    /// Every unresolved or rejected variable, in document order.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Expand variables using the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Expand variables using a caller-supplied lookup.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = VAR_REFERENCE
        .replace_all(input, |caps: &Captures| {
            if caps.name("escape").is_some() {
                return "$".to_string();
            }
            let original = &caps[0];
            let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
                return original.to_string();
            };
            let name = name.as_str();
            let fallback = caps.name("fallback").map(|m| m.as_str());
            let empty_uses_fallback = caps.name("mode").is_some_and(|m| m.as_str() == ":-");

            match lookup(name) {
                Some(value) if value.contains(['\n', '\r']) => {
                    errors.push(format!(
                        "environment variable '{name}' contains newlines, which is not allowed"
                    ));
                    original.to_string()
                }
                Some(value) if value.is_empty() && empty_uses_fallback => {
                    fallback.unwrap_or_default().to_string()
                }
                Some(value) => value,
                None => match fallback {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("environment variable '{name}' is not set"));
                        original.to_string()
                    }
                },
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
