/// Input validation for names, reasons and permission nodes
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Reason cannot be empty")]
    ReasonEmpty,

    #[error("Reason too long (max {max} characters, got {actual})")]
    ReasonTooLong { max: usize, actual: usize },

    #[error("Permission node cannot be empty")]
    PermissionEmpty,

    #[error("Permission node has invalid format: {0}")]
    PermissionInvalid(String),

    #[error("Rank id has invalid format (lowercase letters, digits, '_' and '-', max 32)")]
    RankIdInvalid,

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Server name too long (max 64 characters, got {0})")]
    ServerNameTooLong(usize),

    #[error("Duration must be positive")]
    DurationNotPositive,

    #[error("Invalid duration '{0}' (expected e.g. 30m, 1d12h or perm)")]
    DurationInvalid(String),

    #[error("Duration too long ({0}s)")]
    DurationTooLong(u64),
}

/// Validates a Minecraft player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    Ok(())
}

/// Validates a punishment reason
pub fn validate_reason(reason: &str) -> Result<(), ValidationError> {
    const MAX_REASON: usize = 256;

    if reason.trim().is_empty() {
        return Err(ValidationError::ReasonEmpty);
    }

    let len = reason.chars().count();
    if len > MAX_REASON {
        return Err(ValidationError::ReasonTooLong {
            max: MAX_REASON,
            actual: len,
        });
    }

    Ok(())
}

/// Validates a permission node as stored on a rank.
///
/// Rules:
/// - Optional leading `-` (negation)
/// - Dot-separated segments of `[a-z0-9_-]`
/// - `*` only as the whole node or as the last segment
pub fn validate_permission_node(node: &str) -> Result<(), ValidationError> {
    let body = node.strip_prefix('-').unwrap_or(node);
    if body.is_empty() {
        return Err(ValidationError::PermissionEmpty);
    }

    let invalid = || ValidationError::PermissionInvalid(node.to_string());
    if body.len() > 128 {
        return Err(invalid());
    }

    let segments: Vec<&str> = body.split('.').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "*" {
            if i != last {
                return Err(invalid());
            }
            continue;
        }
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Validates a node used in a permission query (no negation, no wildcard).
pub fn validate_permission_query(node: &str) -> Result<(), ValidationError> {
    if node.starts_with('-') || node.contains('*') {
        return Err(ValidationError::PermissionInvalid(node.to_string()));
    }
    validate_permission_node(&node.to_ascii_lowercase())
}

pub fn validate_rank_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= 32
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::RankIdInvalid)
    }
}

pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }

    if name.len() > 64 {
        return Err(ValidationError::ServerNameTooLong(name.len()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Player name validation tests
    #[test]
    fn test_valid_player_names() {
        assert!(validate_player_name("Steve").is_ok());
        assert!(validate_player_name("Player_123").is_ok());
        assert!(validate_player_name("1234567890123456").is_ok()); // exactly 16 chars
    }

    #[test]
    fn test_invalid_player_names() {
        assert_eq!(validate_player_name(""), Err(ValidationError::PlayerNameEmpty));
        assert_eq!(
            validate_player_name("12345678901234567"),
            Err(ValidationError::PlayerNameTooLong(17))
        );
        assert_eq!(
            validate_player_name("Player 123"),
            Err(ValidationError::PlayerNameInvalidChars)
        );
    }

    #[test]
    fn test_reasons() {
        assert!(validate_reason("x-ray").is_ok());
        assert_eq!(validate_reason("   "), Err(ValidationError::ReasonEmpty));
        assert_eq!(
            validate_reason(&"a".repeat(257)),
            Err(ValidationError::ReasonTooLong { max: 256, actual: 257 })
        );
    }

    #[test]
    fn test_permission_nodes() {
        assert!(validate_permission_node("essentials.fly").is_ok());
        assert!(validate_permission_node("-essentials.fly").is_ok());
        assert!(validate_permission_node("essentials.*").is_ok());
        assert!(validate_permission_node("*").is_ok());
        assert!(validate_permission_node("-*").is_ok());

        assert_eq!(validate_permission_node("-"), Err(ValidationError::PermissionEmpty));
        assert!(validate_permission_node("a.*.b").is_err());
        assert!(validate_permission_node("a..b").is_err());
        assert!(validate_permission_node("Essentials.Fly").is_err());
    }

    #[test]
    fn test_permission_queries() {
        assert!(validate_permission_query("Essentials.Fly").is_ok());
        assert!(validate_permission_query("essentials.*").is_err());
        assert!(validate_permission_query("-essentials.fly").is_err());
    }

    #[test]
    fn test_rank_ids() {
        assert!(validate_rank_id("vip-plus").is_ok());
        assert_eq!(validate_rank_id("VIP"), Err(ValidationError::RankIdInvalid));
        assert_eq!(validate_rank_id(""), Err(ValidationError::RankIdInvalid));
    }

    #[test]
    fn test_server_names() {
        assert!(validate_server_name("lobby-1").is_ok());
        assert_eq!(validate_server_name(""), Err(ValidationError::ServerNameEmpty));
        assert_eq!(
            validate_server_name(&"a".repeat(65)),
            Err(ValidationError::ServerNameTooLong(65))
        );
    }
}
