//! Nicknames and operating modes

use crate::envelope::BROADCAST;
use crate::error::{MeshError, MeshResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Preset broadcast sent by the SOS action
pub const SOS_MESSAGE: &str = "🚨 EMERGENCY SOS — Needs immediate help!";

/// Longest accepted nickname, counted in characters
pub const MAX_NICKNAME_CHARS: usize = 24;

const ADJECTIVES: [&str; 8] = [
    "Swift", "Brave", "Calm", "Bright", "Steady", "Bold", "Quiet", "Keen",
];
const NOUNS: [&str; 8] = [
    "Falcon", "Otter", "Lynx", "Heron", "Badger", "Wolf", "Raven", "Fox",
];

/// Generate a random nickname such as `SwiftOtter42`
pub fn generate_nickname() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}{}{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())],
        rng.gen_range(10..100)
    )
}

/// Trim and check a user-supplied nickname
///
/// The literal broadcast destination is reserved on the wire.
/// Nicknames are limited to [`MAX_NICKNAME_CHARS`] characters.
pub fn validate_nickname(input: &str) -> MeshResult<String> {
    let nickname = input.trim();
    if nickname.is_empty() {
        return Err(MeshError::InvalidNickname("nickname is blank".into()));
    }
    let length = nickname.chars().count();
    if length > MAX_NICKNAME_CHARS {
        return Err(MeshError::InvalidNickname(format!(
            "nickname has {} characters, at most {} allowed",
            length, MAX_NICKNAME_CHARS
        )));
    }
    if nickname == BROADCAST {
        return Err(MeshError::InvalidNickname(format!("{} is reserved", BROADCAST)));
    }
    Ok(nickname.to_string())
}

/// Use the confirmed nickname, falling back to a generated one when blank
pub fn resolve_nickname(input: Option<&str>) -> MeshResult<String> {
    match input.map(str::trim) {
        Some(name) if !name.is_empty() => validate_nickname(name),
        _ => Ok(generate_nickname()),
    }
}

/// Operating mode chosen at onboarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshMode {
    #[default]
    Festival,
    Emergency,
}

impl MeshMode {
    /// One-tap messages offered in this mode
    pub fn quick_messages(&self) -> &'static [&'static str] {
        match self {
            MeshMode::Festival => &["📍 At the Main Stage"],
            MeshMode::Emergency => &[SOS_MESSAGE],
        }
    }
}

impl fmt::Display for MeshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshMode::Festival => write!(f, "festival"),
            MeshMode::Emergency => write!(f, "emergency"),
        }
    }
}

impl FromStr for MeshMode {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "festival" => Ok(MeshMode::Festival),
            "emergency" => Ok(MeshMode::Emergency),
            other => Err(MeshError::Other(anyhow::anyhow!("unknown mesh mode: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_nickname_is_valid() {
        for _ in 0..32 {
            let nickname = generate_nickname();
            assert_eq!(validate_nickname(&nickname).unwrap(), nickname);
        }
    }

    #[test]
    fn test_validate_trims_and_rejects() {
        assert_eq!(validate_nickname("  alice ").unwrap(), "alice");
        assert!(matches!(validate_nickname("   "), Err(MeshError::InvalidNickname(_))));
        assert!(matches!(validate_nickname(BROADCAST), Err(MeshError::InvalidNickname(_))));
    }

    #[test]
    fn test_nickname_length_limit_counts_chars() {
        let longest = "a".repeat(MAX_NICKNAME_CHARS);
        assert_eq!(validate_nickname(&longest).unwrap(), longest);
        assert!(matches!(
            validate_nickname(&"a".repeat(MAX_NICKNAME_CHARS + 1)),
            Err(MeshError::InvalidNickname(_))
        ));

        // Multi-byte characters count once each
        let accented = "é".repeat(MAX_NICKNAME_CHARS);
        assert!(accented.len() > MAX_NICKNAME_CHARS);
        assert!(validate_nickname(&accented).is_ok());

        // Surrounding whitespace is trimmed before counting
        assert!(validate_nickname(&format!("  {}  ", longest)).is_ok());
        assert!(resolve_nickname(Some(&"b".repeat(30))).is_err());
    }

    #[test]
    fn test_resolve_falls_back_when_blank() {
        assert_eq!(resolve_nickname(Some("bob")).unwrap(), "bob");
        assert!(!resolve_nickname(Some("  ")).unwrap().is_empty());
        assert!(!resolve_nickname(None).unwrap().is_empty());
    }

    #[test]
    fn test_mode_parsing_and_presets() {
        assert_eq!("Emergency".parse::<MeshMode>().unwrap(), MeshMode::Emergency);
        assert_eq!("festival".parse::<MeshMode>().unwrap(), MeshMode::Festival);
        assert!("party".parse::<MeshMode>().is_err());
        assert_eq!(MeshMode::Emergency.quick_messages(), &[SOS_MESSAGE]);
        assert_eq!(MeshMode::default(), MeshMode::Festival);
    }
}
