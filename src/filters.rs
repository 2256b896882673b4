//! Include/exclude filtering (§4.G): glob patterns applied to the base name.
//!
//! Unlike the gitignore-style path matching this crate's lineage uses
//! elsewhere, §4.G calls for base-name glob matching, the same mechanism
//! this codebase's own subscription rules use for matching rule paths.

use std::path::Path;

use globset::{Glob, GlobMatcher};

#[derive(Debug, Clone)]
pub struct WatchFilters {
    exclude: Vec<GlobMatcher>,
    include: Vec<GlobMatcher>,
}

impl WatchFilters {
    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> anyhow::Result<Self> {
        let include = include_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let exclude = exclude_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(WatchFilters { include, exclude })
    }

    pub fn empty() -> Self {
        WatchFilters {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Exclude patterns are checked first and short-circuit. If any include
    /// patterns are configured, a name matching none of them is dropped.
    pub fn allows(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy(),
            None => return false,
        };

        if self.exclude.iter().any(|m| m.is_match(name.as_ref())) {
            return false;
        }

        if self.include.is_empty() {
            return true;
        }

        self.include.iter().any(|m| m.is_match(name.as_ref()))
    }
}

fn compile(pattern: &str) -> anyhow::Result<GlobMatcher> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filters_allow_everything() {
        let f = WatchFilters::empty();
        assert!(f.allows(Path::new("/a/b/c.txt")));
    }

    #[test]
    fn exclude_short_circuits_before_include() {
        let f = WatchFilters::new(&["*.txt".into()], &["*.tmp".into()]).unwrap();
        assert!(!f.allows(Path::new("/a/file.tmp")));
    }

    #[test]
    fn include_restricts_to_matching_names() {
        let f = WatchFilters::new(&["*.rs".into()], &[]).unwrap();
        assert!(f.allows(Path::new("/a/main.rs")));
        assert!(!f.allows(Path::new("/a/readme.md")));
    }

    #[test]
    fn matches_base_name_not_full_path() {
        let f = WatchFilters::new(&["secret.txt".into()], &[]).unwrap();
        assert!(f.allows(Path::new("/any/deep/path/secret.txt")));
        assert!(!f.allows(Path::new("/any/deep/secret.txt/not-matching")));
    }
}
