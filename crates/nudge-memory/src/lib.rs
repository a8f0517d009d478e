pub mod chat;
pub mod documents;
pub mod profile;

pub use chat::*;
pub use documents::*;
pub use profile::*;

use anyhow::{bail, Result};

/// Rejects user ids that could escape the data directory once used as a path segment.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let valid = !user_id.is_empty()
        && user_id.len() <= 128
        && user_id != "."
        && user_id != ".."
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        bail!("invalid user id: {user_id:?}");
    }
    Ok(())
}
