//! Snippet visibility levels stored in `snippets.visibility_level`

pub const PRIVATE: i32 = 0;
pub const INTERNAL: i32 = 10;
pub const PUBLIC: i32 = 20;

/// Level a snippet gets from the legacy `private` flag
pub fn from_private_flag(private: bool) -> i32 {
    if private {
        PRIVATE
    } else {
        INTERNAL
    }
}
