//! Console Commands
//!
//! Parses `sv_<name> <value>` lines typed into the developer console into
//! typed config mutations.

use thiserror::Error;

use crate::game::config_store::{kind_of, ConfigKind, ConfigValue};

/// A parsed console mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleCommand {
    /// Lower-cased key, one of the known `sv_*` keys.
    pub key: String,
    /// Parsed value of the key's kind.
    pub value: ConfigValue,
}

/// Console parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    /// Blank line.
    #[error("empty command")]
    Empty,
    /// Key without a value.
    #[error("{0}: value missing")]
    ValueMissing(String),
    /// Float key with an unparseable value.
    #[error("{key}: '{input}' is not a number")]
    BadNumber {
        /// Config key.
        key: String,
        /// Rejected text.
        input: String,
    },
    /// Int key with an unparseable value.
    #[error("{key}: '{input}' is not an integer")]
    BadInt {
        /// Config key.
        key: String,
        /// Rejected text.
        input: String,
    },
    /// Not a known tunable.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

impl ConsoleCommand {
    /// Parse one console line.
    ///
    /// The command word is case-insensitive; extra tokens after the value
    /// are ignored.
    pub fn parse(line: &str) -> Result<Self, ConsoleError> {
        let mut parts = line.split_whitespace();
        let key = parts.next().ok_or(ConsoleError::Empty)?.to_ascii_lowercase();

        let kind = kind_of(&key).ok_or_else(|| ConsoleError::UnknownCommand(key.clone()))?;
        let raw = parts.next().ok_or_else(|| ConsoleError::ValueMissing(key.clone()))?;

        let value = match kind {
            ConfigKind::Float => raw
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .map(ConfigValue::Float)
                .ok_or_else(|| ConsoleError::BadNumber { key: key.clone(), input: raw.to_string() })?,
            ConfigKind::Int => raw
                .parse::<i32>()
                .map(ConfigValue::Int)
                .map_err(|_| ConsoleError::BadInt { key: key.clone(), input: raw.to_string() })?,
        };

        Ok(Self { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_float() {
        let cmd = ConsoleCommand::parse("sv_gravity 30").unwrap();
        assert_eq!(cmd.key, "sv_gravity");
        assert_eq!(cmd.value, ConfigValue::Float(30.0));

        let cmd = ConsoleCommand::parse("  SV_Surf_Friction   0.25 ").unwrap();
        assert_eq!(cmd.key, "sv_surf_friction");
        assert_eq!(cmd.value, ConfigValue::Float(0.25));
    }

    #[test]
    fn test_parse_int() {
        let cmd = ConsoleCommand::parse("sv_autobhop 0").unwrap();
        assert_eq!(cmd.value, ConfigValue::Int(0));

        assert_eq!(
            ConsoleCommand::parse("sv_autobhop 0.5"),
            Err(ConsoleError::BadInt { key: "sv_autobhop".into(), input: "0.5".into() })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ConsoleCommand::parse("   "), Err(ConsoleError::Empty));
        assert_eq!(
            ConsoleCommand::parse("sv_maxspeed"),
            Err(ConsoleError::ValueMissing("sv_maxspeed".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("sv_maxspeed fast"),
            Err(ConsoleError::BadNumber { key: "sv_maxspeed".into(), input: "fast".into() })
        );
        assert_eq!(
            ConsoleCommand::parse("sv_maxspeed 7,5"),
            Err(ConsoleError::BadNumber { key: "sv_maxspeed".into(), input: "7,5".into() })
        );
        assert_eq!(
            ConsoleCommand::parse("noclip 1"),
            Err(ConsoleError::UnknownCommand("noclip".into()))
        );
    }

    #[test]
    fn test_rejects_non_finite() {
        assert!(matches!(
            ConsoleCommand::parse("sv_gravity inf"),
            Err(ConsoleError::BadNumber { .. })
        ));
        assert!(matches!(
            ConsoleCommand::parse("sv_gravity NaN"),
            Err(ConsoleError::BadNumber { .. })
        ));
    }
}
