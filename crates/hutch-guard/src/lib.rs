//! Input validation for hutch.
//!
//! Every identifier that arrives from outside the process (workspace names,
//! terminal ids, usernames, upload filenames, relative paths) passes through
//! this crate before it touches the filesystem or a shell. All validation is
//! pure (no side effects) and fully testable.
//!
//! There is exactly one routine per identifier class. No other code path may
//! decide independently what counts as a safe workspace name.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Maximum workspace name length.
pub const WORKSPACE_NAME_MAX_LEN: usize = 64;

/// Maximum terminal id length.
pub const TERMINAL_ID_MAX_LEN: usize = 64;

/// Maximum username length (Linux limit is 32).
pub const USERNAME_MAX_LEN: usize = 32;

/// Name of the protected workspace every tenant gets at account creation.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Reserved subdirectory inside a workspace for hutch metadata (plan file).
pub const WORKSPACE_META_DIR: &str = ".hutch";

/// A rejected identifier, with the reason phrased for the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workspace name {0:?} is invalid: {1}")]
    WorkspaceName(String, &'static str),

    #[error("terminal id {0:?} is invalid: {1}")]
    TerminalId(String, &'static str),

    #[error("username {0:?} is invalid: {1}")]
    Username(String, &'static str),

    #[error("path {0:?} is invalid: {1}")]
    Path(String, &'static str),
}

/// Validate a workspace name.
///
/// Rules:
/// - 1..=64 characters
/// - lowercase ascii letters, digits, `.`, `_`, `-`
/// - must start with a letter or digit (no leading dot, so the reserved
///   `.hutch` directory can never collide with a workspace)
/// - no path separators, no `..`, no control characters
pub fn validate_workspace_name(name: &str) -> Result<(), ValidationError> {
    let err = |reason| Err(ValidationError::WorkspaceName(name.to_string(), reason));

    if name.is_empty() {
        return err("empty");
    }
    if name.len() > WORKSPACE_NAME_MAX_LEN {
        return err("too long");
    }
    let first = name.chars().next().unwrap_or('\0');
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return err("must start with a lowercase letter or digit");
    }
    if name.contains("..") {
        return err("contains '..'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-')
    {
        return err("allowed characters are a-z, 0-9, '.', '_', '-'");
    }
    Ok(())
}

/// Validate a terminal id.
///
/// Terminal ids are allocated by the worker (uuid v4), but callers echo them
/// back, so they are untrusted on arrival.
pub fn validate_terminal_id(id: &str) -> Result<(), ValidationError> {
    let err = |reason| Err(ValidationError::TerminalId(id.to_string(), reason));

    if id.is_empty() {
        return err("empty");
    }
    if id.len() > TERMINAL_ID_MAX_LEN {
        return err("too long");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return err("allowed characters are a-z, A-Z, 0-9, '-'");
    }
    Ok(())
}

/// Validate a Linux username managed by hutch.
///
/// Rules:
/// - max 32 characters
/// - starts with a lowercase letter or underscore
/// - only lowercase ascii, digits, underscore, hyphen
pub fn validate_username(name: &str) -> Result<(), ValidationError> {
    let err = |reason| Err(ValidationError::Username(name.to_string(), reason));

    if name.is_empty() {
        return err("empty");
    }
    if name.len() > USERNAME_MAX_LEN {
        return err("too long");
    }
    let first = name.chars().next().unwrap_or('\0');
    if !(first.is_ascii_lowercase() || first == '_') {
        return err("must start with a lowercase letter or underscore");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return err("allowed characters are a-z, 0-9, '_', '-'");
    }
    Ok(())
}

/// Sanitize an arbitrary tenant key into a Linux username candidate.
///
/// Takes the local part of an email-like key, lowercases it, and maps every
/// disallowed character to `_`. The result always passes
/// [`validate_username`]; collision handling (numeric suffixes) is the
/// registry's job.
pub fn sanitize_username(tenant_key: &str) -> String {
    let local = tenant_key.split('@').next().unwrap_or(tenant_key);
    let mut result = String::with_capacity(USERNAME_MAX_LEN);

    for (i, c) in local.chars().enumerate() {
        if result.len() >= USERNAME_MAX_LEN {
            break;
        }
        let c = c.to_ascii_lowercase();
        if i == 0 {
            if c.is_ascii_lowercase() || c == '_' {
                result.push(c);
            } else if c.is_ascii_digit() {
                result.push('_');
                result.push(c);
            } else {
                result.push('_');
            }
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            result.push(c);
        } else {
            result.push('_');
        }
    }

    if result.is_empty() {
        result.push_str("user");
    }
    result
}

/// Sanitize an uploaded filename.
///
/// Removes control characters, maps path separators and shell-hostile
/// punctuation to `_`, and strips leading/trailing dots and spaces. Returns
/// `None` if nothing usable remains.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if sanitized.is_empty() {
        return None;
    }

    if sanitized.len() > 255 {
        return Some(sanitized[..255].to_string());
    }
    Some(sanitized.to_string())
}

/// Resolve `relative` under `root`, component by component.
///
/// Rejects any parent-directory (`..`) reference, absolute components, and
/// null bytes - even ones that would resolve back inside `root`, since they
/// indicate hostile input. The returned path is guaranteed to start with
/// `root` without consulting the filesystem.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf, ValidationError> {
    let err = |reason| Err(ValidationError::Path(relative.to_string(), reason));

    if relative.contains('\0') {
        return err("contains null byte");
    }

    let trimmed = relative.trim_start_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(root.to_path_buf());
    }

    let mut result = root.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(name) => result.push(name),
            Component::CurDir => continue,
            Component::ParentDir => return err("contains '..'"),
            Component::RootDir | Component::Prefix(_) => return err("absolute component"),
        }
    }

    if !result.starts_with(root) {
        return err("escapes root");
    }
    Ok(result)
}
