//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest accepted room identifier.
const MAX_ROOM_ID_LEN: usize = 128;

/// Validates that a room identifier is non-empty, at most 128 characters, and only uses
/// ASCII letters, digits, `-` and `_`.
///
/// # Examples
///
/// ```ignore
/// validate_room_id("65f1c0ffee")   // Ok
/// validate_room_id("")             // Err - empty
/// validate_room_id("room 1")       // Err - whitespace
/// ```
pub fn validate_room_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_ROOM_ID_LEN {
        let mut err = ValidationError::new("room_id_length");
        err.message = Some(
            format!(
                "Room ID must be between 1 and {MAX_ROOM_ID_LEN} characters (got {})",
                id.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("room_id_format");
        err.message = Some("Room ID may only contain letters, digits, '-' and '_'".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that a chat body contains something other than whitespace.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("Value must not be blank".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_id_valid() {
        assert!(validate_room_id("65f1c0ffee").is_ok());
        assert!(validate_room_id("team-room_2").is_ok());
        assert!(validate_room_id(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_validate_room_id_invalid_length() {
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_room_id_invalid_format() {
        assert!(validate_room_id("room 1").is_err());
        assert!(validate_room_id("room/1").is_err());
        assert!(validate_room_id("salle-é").is_err());
    }

    #[test]
    fn test_validate_not_blank() {
        assert!(validate_not_blank("hi").is_ok());
        assert!(validate_not_blank("  \n\t").is_err());
        assert!(validate_not_blank("").is_err());
    }
}
