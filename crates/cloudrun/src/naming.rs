//! Cloud naming.
//!
//! Cloud names look like `<prefix>_<user>_<suffix>`, where the suffix is five
//! random digits. Concurrent runs by the same user on one host get distinct
//! names, so their workers never join each other's cloud.

use uuid::Uuid;

/// Maximum length for a cloud name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Number of random digits appended to a cloud name.
const SUFFIX_DIGITS: u32 = 5;

/// Generate a fresh cloud name for the current user.
pub fn generate_cloud_name(prefix: &str) -> String {
    cloud_name(prefix, &current_user(), random_suffix())
}

/// Build a cloud name from its parts.
pub fn cloud_name(prefix: &str, user: &str, suffix: u32) -> String {
    let raw = format!("{prefix}_{}_{suffix:05}", sanitize_name(user));
    raw.chars().take(MAX_NAME_LENGTH).collect()
}

/// Login name of the invoking user, or `unknown`.
fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Five random decimal digits, taken from the random bits of a v7 UUID.
fn random_suffix() -> u32 {
    let bytes = Uuid::now_v7().into_bytes();
    let tail = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    tail % 10u32.pow(SUFFIX_DIGITS)
}

/// Keep only characters that are safe inside a cloud name.
fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_removes_whitespace_and_punctuation() {
        assert_eq!(sanitize_name("jane doe"), "janedoe");
        assert_eq!(sanitize_name("build-bot_2"), "build-bot_2");
        assert_eq!(sanitize_name(" \t"), "unknown");
    }

    #[test]
    fn cloud_name_pads_suffix() {
        assert_eq!(cloud_name("H2O_runit", "ci", 42), "H2O_runit_ci_00042");
        assert_eq!(cloud_name("H2O_runit", "ci", 98765), "H2O_runit_ci_98765");
    }

    #[test]
    fn cloud_name_is_bounded() {
        let name = cloud_name("p", &"u".repeat(200), 1);
        assert_eq!(name.len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn random_suffix_has_five_digits() {
        for _ in 0..100 {
            assert!(random_suffix() < 100_000);
        }
    }

    #[test]
    fn generated_names_carry_prefix() {
        let name = generate_cloud_name("H2O_runit");
        assert!(name.starts_with("H2O_runit_"));
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
