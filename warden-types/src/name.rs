//! Plugin naming rules.
//!
//! Names are the stable identity of a plugin across versions and reloads,
//! so they are restricted to a conservative charset: lowercase ASCII
//! letters, digits, `.`, `-` and `_`, starting with a letter.

use crate::Error;

/// Longest accepted plugin name.
pub const MAX_PLUGIN_NAME_LEN: usize = 128;

/// Checks that `name` is a well-formed plugin name.
pub fn validate_plugin_name(name: &str) -> crate::Result<()> {
    let invalid = |reason: &str| Error::InvalidPluginName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name is empty"));
    };
    if name.len() > MAX_PLUGIN_NAME_LEN {
        return Err(invalid("name is too long"));
    }
    if !first.is_ascii_lowercase() {
        return Err(invalid("name must start with a lowercase letter"));
    }
    if let Some(bad) = name
        .chars()
        .find(|&c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')))
    {
        return Err(invalid(&format!("unexpected character '{bad}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_names() {
        assert!(validate_plugin_name("acme.status-board").is_ok());
        assert!(validate_plugin_name("a").is_ok());
        assert!(validate_plugin_name("memory_tools2").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            validate_plugin_name(""),
            Err(Error::InvalidPluginName { .. })
        ));
    }

    #[test]
    fn rejects_uppercase_and_spaces() {
        assert!(validate_plugin_name("Acme").is_err());
        assert!(validate_plugin_name("acme tools").is_err());
        assert!(validate_plugin_name("acme/tools").is_err());
    }

    #[test]
    fn rejects_leading_digit() {
        assert!(validate_plugin_name("9lives").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let name = "a".repeat(MAX_PLUGIN_NAME_LEN + 1);
        assert!(validate_plugin_name(&name).is_err());
        let name = "a".repeat(MAX_PLUGIN_NAME_LEN);
        assert!(validate_plugin_name(&name).is_ok());
    }

    #[test]
    fn error_message_names_the_plugin() {
        let err = validate_plugin_name("Bad Name").unwrap_err();
        assert!(err.to_string().contains("Bad Name"));
    }
}
