//! Name handling shared by contexts, documents and stacks.
//!
//! Cloud resource names have tight length and charset limits, so every
//! derived name starts from one of these helpers.

/// Whether `value` is a non-empty identifier of ASCII letters, digits and underscores.
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lowercase a name and replace anything outside `[a-z0-9_]` with `_`.
///
/// Used to derive canonical storage keys, so `SandBox` and `sandbox`
/// address the same remote object.
pub fn sanitise(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Keep only lowercase ASCII letters and digits.
pub fn alphanumeric(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_lowercase()).collect()
}

/// Truncate to at most `max` characters.
pub fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
