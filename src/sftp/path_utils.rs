//! Path helpers for SFTP operations
//!
//! Remote SFTP paths always use `/` (even Windows SSH servers present Unix
//! style paths). Local paths follow the platform.

use std::path::Path;

use super::error::SftpError;

pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Final component of a local path, used as the remote file name on upload.
pub fn local_file_name(local_path: &str) -> Result<String, SftpError> {
    Path::new(local_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| SftpError::InvalidPath(local_path.to_string()))
}

/// Only absolute paths without embedded NULs reach the server.
pub fn validate_remote_path(path: &str) -> Result<(), SftpError> {
    if !is_absolute_remote_path(path) || path.contains('\0') {
        return Err(SftpError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows"));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_local_file_name() {
        assert_eq!(local_file_name("/tmp/report.pdf").unwrap(), "report.pdf");
        assert!(local_file_name("/").is_err());
    }

    #[test]
    fn test_validate_remote_path() {
        assert!(validate_remote_path("/etc/hosts").is_ok());
        assert!(validate_remote_path("").is_err());
        assert!(validate_remote_path("etc/hosts").is_err());
        assert!(validate_remote_path("/a\0b").is_err());
    }
}
