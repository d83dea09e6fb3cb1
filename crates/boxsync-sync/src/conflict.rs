//! Conflict copies
//!
//! When a local edit loses to a newer server version and
//! `conflicts.keep_local_copy` is set, the local file is moved aside next
//! to the original as
//! `stem (conflicted copy <device> YYYY-MM-DD <tag>).ext`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use boxsync_core::domain::newtypes::{DeviceId, RelativePath};
use boxsync_core::domain::DomainError;

/// Sibling path for the losing local version of `path`
///
/// The random tag keeps two conflicts of the same file on the same day
/// apart; callers still check the candidate against the filesystem.
///
/// # Errors
/// Returns `DomainError::InvalidPath` if the resulting name is not a
/// valid path component
pub fn conflict_copy(
    path: &RelativePath,
    device: &DeviceId,
    at: DateTime<Utc>,
) -> Result<RelativePath, DomainError> {
    let tag = Uuid::new_v4().simple().to_string();
    let label = format!(
        "conflicted copy {} {} {}",
        device.as_str(),
        at.format("%Y-%m-%d"),
        &tag[..8]
    );

    let name = path.file_name();
    let (stem, ext) = split_extension(name);
    path.with_file_name(&format!("{stem} ({label}){ext}"))
}

/// `("archive.tar", ".gz")`; dot files and names without a dot have no
/// extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => name.split_at(dot),
    }
}
