use crate::common::error::{Error, Result};

/// Normalize a path to the server-relative form handed to the FTP layer:
/// no leading or trailing slash, no empty or `.` components. The empty
/// string names the remote root.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidPath(format!(
                    "path escapes the remote root: {}",
                    path
                )))
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Append a single child name to a normalized directory path.
pub fn join_path(dir: &str, name: &str) -> Result<String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidPath(format!("bad entry name: {}", name)));
    }
    if dir.is_empty() {
        Ok(name.to_string())
    } else {
        Ok(format!("{}/{}", dir, name))
    }
}

/// Parent of a normalized path; `None` for the remote root itself.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

/// Final component of a normalized path; empty for the remote root.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Mount-absolute rendering for logs and error messages.
pub fn display_path(path: &str) -> String {
    format!("/{}", path)
}
