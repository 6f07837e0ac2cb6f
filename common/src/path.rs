use crate::error::{Error, Result};

/// Split a slash path into its components. The root splits into nothing.
pub fn split_path(path: &str) -> Result<Vec<String>> {
    let mut components = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        match component {
            "." => continue,
            ".." => {
                return Err(Error::InvalidPath(format!(
                    "relative component in {}",
                    path
                )))
            }
            name => components.push(name.to_string()),
        }
    }
    Ok(components)
}

/// Split into (parent path, last component). The root has no last component.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let mut components = split_path(path)?;
    let name = components
        .pop()
        .ok_or_else(|| Error::InvalidPath(format!("{} has no parent", path)))?;
    Ok((format!("/{}", components.join("/")), name))
}

/// Join a child name onto a normalized parent path
pub fn join_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Filenames never carry a separator.
pub fn sanitize_filename(name: &str) -> String {
    name.replace('/', "-")
}
