use std::path::Path;

use crate::TransferError;

/// File extensions a bridge accepts, compared case-insensitively.
///
/// An empty allow-list accepts every extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPolicy {
    allowed: Vec<String>,
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        Self::new(l4d2_bridge_protocol::constants::DEFAULT_ALLOWED_EXTENSIONS.iter().copied())
    }
}

impl ExtensionPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|s| s.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn allow_all() -> Self {
        Self {
            allowed: Vec::new(),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Rejects `file_name` unless its extension is on the list.
    pub fn check(&self, file_name: &str) -> Result<(), TransferError> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if self.allowed.iter().any(|a| *a == ext) {
            Ok(())
        } else {
            Err(TransferError::ExtensionRejected(if ext.is_empty() {
                file_name.to_string()
            } else {
                format!(".{ext}")
            }))
        }
    }
}

fn is_reserved(c: char) -> bool {
    c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
}

/// Reduces a peer-supplied name to a safe single path component.
///
/// Keeps only the last path segment, replaces control and reserved
/// characters with `_`, removes `..` sequences and trims dots and spaces.
/// Falls back to `unnamed`.
pub fn safe_filename(file_name: &str) -> String {
    let last = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let mut name: String = last
        .chars()
        .map(|c| if is_reserved(c) { '_' } else { c })
        .collect();
    while name.contains("..") {
        name = name.replace("..", "");
    }
    let name = name.trim_matches(|c| c == '.' || c == ' ');
    if name.is_empty() {
        "unnamed".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_accepts_vpk_only() {
        let p = ExtensionPolicy::default();
        assert!(p.check("map01.vpk").is_ok());
        assert!(p.check("MAP01.VPK").is_ok());
        assert!(matches!(
            p.check("evil.exe"),
            Err(TransferError::ExtensionRejected(e)) if e == ".exe"
        ));
        assert!(p.check("noext").is_err());
    }

    #[test]
    fn policy_normalizes_entries() {
        let p = ExtensionPolicy::new([".VPK", "zip", ""]);
        assert_eq!(p.allowed(), ["vpk", "zip"]);
        assert!(p.check("a.zip").is_ok());
    }

    #[test]
    fn empty_policy_accepts_all() {
        assert!(ExtensionPolicy::allow_all().check("anything.bin").is_ok());
    }

    #[test]
    fn safe_filename_strips_directories() {
        assert_eq!(safe_filename("../../etc/passwd"), "passwd");
        assert_eq!(safe_filename("C:\\maps\\c1m1.vpk"), "c1m1.vpk");
    }

    #[test]
    fn safe_filename_replaces_reserved_chars() {
        assert_eq!(safe_filename("a*b?c.vpk"), "a_b_c.vpk");
        assert_eq!(safe_filename("tab\there.vpk"), "tab_here.vpk");
    }

    #[test]
    fn safe_filename_removes_dot_runs() {
        assert_eq!(safe_filename("a....vpk"), "avpk");
        assert_eq!(safe_filename(" .hidden.vpk. "), "hidden.vpk");
    }

    #[test]
    fn safe_filename_fallback() {
        assert_eq!(safe_filename(""), "unnamed");
        assert_eq!(safe_filename(".."), "unnamed");
        assert_eq!(safe_filename("dir/"), "unnamed");
    }

    #[test]
    fn safe_filename_keeps_unicode() {
        assert_eq!(safe_filename("地图.vpk"), "地图.vpk");
    }
}
