//! Project and version name validation
//!
//! Names end up in storage keys and URLs, so only a conservative
//! character set is accepted: ASCII letters, digits, `_`, `.` and `-`.

use crate::error::StorageError;

/// Check that `name` is a valid project or version name.
///
/// `kind` is only used to build the error message.
pub fn validate_name(kind: &str, name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::invalid(format!("{kind} name is empty")));
    }
    if name == "." || name == ".." {
        return Err(StorageError::invalid(format!("{kind} name {name:?} is reserved")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(StorageError::invalid(format!(
            "{kind} name {name:?} contains characters outside [0-9A-Za-z_.-]"
        )));
    }
    Ok(())
}

/// Validate both halves of a `(project, version)` identity.
pub fn validate_identity(project: &str, version: &str) -> Result<(), StorageError> {
    validate_name("project", project)?;
    validate_name("version", version)
}
