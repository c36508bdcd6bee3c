//! UUID utilities
//!
//! Task identifiers are random (v4) UUIDs. Stores sometimes hand back ids
//! in the compact 32-hex form, so both forms are accepted by [`parse`].

use uuid::Uuid;

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse UUID from string (hyphenated or simple form)
pub fn parse(s: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(s.trim())
}

/// True if `s` parses as a canonical random identifier
pub fn is_valid(s: &str) -> bool {
    parse(s).is_ok()
}

/// Strip everything but ASCII alphanumerics (compact id form used in config rows)
pub fn compact(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}
