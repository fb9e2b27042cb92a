use std::sync::OnceLock;

use regex::Regex;

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$([A-Za-z_]\w*)").expect("valid env var pattern"))
}

/// Expands a leading `~` to the user's home directory and replaces
/// every `$VAR` reference with the variable's value, or the empty
/// string when the variable is unset. Anything else passes through
/// unchanged. Performs no filesystem access.
pub fn resolve(path: &str) -> String {
    let mut result = path.to_string();

    if let Some(rest) = result.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            result = format!("{home}{rest}");
        }
    }

    env_var_pattern()
        .replace_all(&result, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
