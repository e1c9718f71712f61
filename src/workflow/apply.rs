//! Applying a validated change set to the workspace.
//!
//! Patch entries are located by an ordered chain of matchers: exact substring,
//! then whitespace-insensitive, then permissive line-level. The whole change
//! set is planned in memory first and written only when every operation
//! succeeded, so a failed apply leaves the workspace untouched.

use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::types::ApplyResult;
use crate::agents::{ChangeSet, FileChange, FileOperation, PatchEntry};
use crate::util::blocking;
use crate::{sflog_debug, Result};

/// One strategy for locating a patch's search text.
pub trait PatchMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Byte range in `haystack` to replace, if `needle` is found.
    fn find(&self, haystack: &str, needle: &str) -> Option<Range<usize>>;
}

/// Plain substring match.
pub struct ExactMatcher;

impl PatchMatcher for ExactMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn find(&self, haystack: &str, needle: &str) -> Option<Range<usize>> {
        haystack
            .find(needle)
            .map(|start| start..start + needle.len())
    }
}

/// Token sequence match where any run of whitespace equals any other.
pub struct FuzzyMatcher;

impl PatchMatcher for FuzzyMatcher {
    fn name(&self) -> &'static str {
        "fuzzy"
    }

    fn find(&self, haystack: &str, needle: &str) -> Option<Range<usize>> {
        let tokens: Vec<String> = needle.split_whitespace().map(regex::escape).collect();
        if tokens.is_empty() {
            return None;
        }
        let re = Regex::new(&tokens.join(r"\s+")).ok()?;
        re.find(haystack).map(|m| m.range())
    }
}

/// Line-level match on trimmed, lowercased lines with trailing `;`/`,`
/// dropped. Blank lines on either side are ignored. The replaced range covers
/// whole lines.
pub struct PermissiveLineMatcher;

impl PermissiveLineMatcher {
    fn canonical(line: &str) -> String {
        line.trim()
            .trim_end_matches([';', ','])
            .trim_end()
            .to_lowercase()
    }
}

impl PatchMatcher for PermissiveLineMatcher {
    fn name(&self) -> &'static str {
        "permissive-line"
    }

    fn find(&self, haystack: &str, needle: &str) -> Option<Range<usize>> {
        let wanted: Vec<String> = needle
            .lines()
            .map(Self::canonical)
            .filter(|l| !l.is_empty())
            .collect();
        if wanted.is_empty() {
            return None;
        }

        // (byte range, canonical text) of each non-blank haystack line.
        let mut lines = Vec::new();
        let mut offset = 0;
        for raw in haystack.split_inclusive('\n') {
            let canonical = Self::canonical(raw);
            if !canonical.is_empty() {
                lines.push((offset..offset + raw.len(), canonical));
            }
            offset += raw.len();
        }

        lines
            .windows(wanted.len())
            .find(|window| window.iter().zip(&wanted).all(|((_, l), w)| l == w))
            .map(|window| {
                let start = window[0].0.start;
                let end = window[window.len() - 1].0.end;
                // Keep the final newline outside the replaced range.
                let end = if haystack[start..end].ends_with('\n') {
                    end - 1
                } else {
                    end
                };
                start..end
            })
    }
}

/// Ordered matcher strategies; the first hit wins.
#[derive(Clone)]
pub struct MatcherChain {
    matchers: Vec<Arc<dyn PatchMatcher>>,
}

impl MatcherChain {
    pub fn new(matchers: Vec<Arc<dyn PatchMatcher>>) -> Self {
        Self { matchers }
    }

    pub fn push(mut self, matcher: Arc<dyn PatchMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    pub fn find(&self, haystack: &str, needle: &str) -> Option<(&'static str, Range<usize>)> {
        self.matchers
            .iter()
            .find_map(|m| m.find(haystack, needle).map(|r| (m.name(), r)))
    }
}

impl Default for MatcherChain {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(ExactMatcher),
            Arc::new(FuzzyMatcher),
            Arc::new(PermissiveLineMatcher),
        ])
    }
}

impl std::fmt::Debug for MatcherChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MatcherChain").field(&self.names()).finish()
    }
}

/// Shortest shared text, ignoring whitespace, that counts as evidence a
/// present replacement came from this entry.
const MIN_ANCHOR_CHARS: usize = 3;

/// Text `search` and `replace` share at their start and end.
fn shared_anchor(search: &str, replace: &str) -> String {
    let search: Vec<char> = search.chars().collect();
    let replace: Vec<char> = replace.chars().collect();
    let prefix = search
        .iter()
        .zip(&replace)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = search[prefix..]
        .iter()
        .rev()
        .zip(replace[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    search[..prefix]
        .iter()
        .chain(&search[search.len() - suffix..])
        .collect()
}

/// True when finding `entry.replace` in a file shows the entry was applied:
/// the replacement either wraps the search text or carries some of its
/// surrounding context.
fn replacement_is_evidence(entry: &PatchEntry) -> bool {
    if entry.replace.trim().is_empty() {
        return false;
    }
    if entry.replace.contains(&entry.search) {
        return true;
    }
    let anchor = shared_anchor(&entry.search, &entry.replace);
    let visible: Vec<char> = anchor.chars().filter(|c| !c.is_whitespace()).collect();
    visible.len() >= MIN_ANCHOR_CHARS && visible.iter().any(|c| c.is_alphanumeric())
}

/// Apply `entries` to `content`. An entry whose search text is gone is
/// skipped only when its replacement is present and carries the search
/// context, so re-applying a change set is a no-op while a stray match of a
/// short replacement such as `}` still fails.
pub fn apply_patches(
    content: &str,
    entries: &[PatchEntry],
    chain: &MatcherChain,
) -> std::result::Result<String, String> {
    let mut current = content.to_string();
    for (i, entry) in entries.iter().enumerate() {
        let already_applied =
            replacement_is_evidence(entry) && current.contains(&entry.replace);
        if already_applied && entry.replace.contains(&entry.search) {
            continue;
        }
        match chain.find(&current, &entry.search) {
            Some((matcher, range)) => {
                sflog_debug!("patch {} matched via {}", i + 1, matcher);
                current.replace_range(range, &entry.replace);
            }
            None if already_applied => {
                sflog_debug!("patch {} already applied", i + 1);
            }
            None => return Err(format!("patch {} did not match", i + 1)),
        }
    }
    Ok(current)
}

/// Planned effect on one path.
enum Planned {
    Write(String),
    Remove,
}

fn plan_change(
    root: &Path,
    change: &FileChange,
    staged: &BTreeMap<PathBuf, Option<String>>,
    chain: &MatcherChain,
) -> std::result::Result<Option<Planned>, String> {
    let path = root.join(&change.path);
    // Earlier operations in the same change set take precedence over disk.
    let existing = match staged.get(&path) {
        Some(content) => content.clone(),
        None if path.is_file() => Some(
            std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", change.path, e))?,
        ),
        None => None,
    };

    let planned = match change.operation {
        FileOperation::Create | FileOperation::Update => {
            let content = change
                .content
                .clone()
                .ok_or_else(|| format!("{}: missing content", change.path))?;
            (existing.as_deref() != Some(content.as_str())).then_some(Planned::Write(content))
        }
        FileOperation::Patch => {
            let Some(current) = existing else {
                return Err(format!("{}: cannot patch a missing file", change.path));
            };
            let entries = change.patches.as_deref().unwrap_or_default();
            let patched =
                apply_patches(&current, entries, chain).map_err(|e| format!("{}: {}", change.path, e))?;
            (patched != current).then_some(Planned::Write(patched))
        }
        FileOperation::Delete => existing.map(|_| Planned::Remove),
    };
    Ok(planned)
}

/// Apply `change_set` under `root`. Nothing is written unless every
/// operation can be applied.
pub async fn apply_change_set(
    root: &Path,
    change_set: &ChangeSet,
    chain: &MatcherChain,
) -> Result<ApplyResult> {
    let root = root.to_path_buf();
    let change_set = change_set.clone();
    let chain = chain.clone();

    blocking(move || {
        let mut staged: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        let mut touched: Vec<(String, PathBuf)> = Vec::new();
        let mut unchanged = Vec::new();
        let mut errors = Vec::new();

        for change in &change_set.files {
            match plan_change(&root, change, &staged, &chain) {
                Ok(Some(planned)) => {
                    let path = root.join(&change.path);
                    let content = match planned {
                        Planned::Write(content) => Some(content),
                        Planned::Remove => None,
                    };
                    staged.insert(path.clone(), content);
                    touched.retain(|(p, _)| p != &change.path);
                    touched.push((change.path.clone(), path));
                }
                Ok(None) => unchanged.push(change.path.clone()),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Ok(ApplyResult {
                success: false,
                modified_files: Vec::new(),
                unchanged_files: unchanged,
                errors,
            });
        }

        let mut modified = Vec::new();
        for (rel, path) in touched {
            match staged.get(&path) {
                Some(Some(content)) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, content)?;
                }
                Some(None) => {
                    if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
                None => continue,
            }
            modified.push(rel);
        }
        unchanged.retain(|p| !modified.contains(p));

        Ok(ApplyResult {
            success: true,
            modified_files: modified,
            unchanged_files: unchanged,
            errors: Vec::new(),
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(search: &str, replace: &str) -> PatchEntry {
        PatchEntry {
            search: search.into(),
            replace: replace.into(),
        }
    }

    // ========== Matchers ==========

    #[test]
    fn test_exact_matcher() {
        assert_eq!(ExactMatcher.find("let a = 1;", "a = 1"), Some(4..9));
        assert_eq!(ExactMatcher.find("let a = 1;", "a=1"), None);
    }

    #[test]
    fn test_fuzzy_matcher_ignores_whitespace_runs() {
        let haystack = "fn main() {\n    let  a =\t1;\n}";
        let range = FuzzyMatcher.find(haystack, "let a = 1;").unwrap();
        assert_eq!(&haystack[range], "let  a =\t1;");
        assert_eq!(FuzzyMatcher.find(haystack, "   "), None);
    }

    #[test]
    fn test_permissive_line_matcher() {
        let haystack = "fn main() {\n    Foo::new(1);\n\n    bar(2),\n}\n";
        let range = PermissiveLineMatcher
            .find(haystack, "foo::new(1)\nBAR(2)")
            .unwrap();
        assert_eq!(&haystack[range], "    Foo::new(1);\n\n    bar(2),");
    }

    #[test]
    fn test_chain_order() {
        let chain = MatcherChain::default();
        assert_eq!(chain.names(), vec!["exact", "fuzzy", "permissive-line"]);
        assert_eq!(chain.find("a b", "a b").unwrap().0, "exact");
        assert_eq!(chain.find("a   b", "a b").unwrap().0, "fuzzy");
        assert_eq!(chain.find("A;\nB;", "a\nb").unwrap().0, "permissive-line");
        assert!(chain.find("abc", "xyz").is_none());
    }

    // ========== Patches ==========

    #[test]
    fn test_apply_patches_is_idempotent() {
        let chain = MatcherChain::default();
        let entries = vec![entry("fn a() {}", "fn a() {}\nfn b() {}")];
        let once = apply_patches("fn a() {}\n", &entries, &chain).unwrap();
        assert_eq!(once, "fn a() {}\nfn b() {}\n");
        let twice = apply_patches(&once, &entries, &chain).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_apply_patches_accepts_present_replacement() {
        let chain = MatcherChain::default();
        let entries = vec![entry("old_name()", "new_name()")];
        let out = apply_patches("new_name();\n", &entries, &chain).unwrap();
        assert_eq!(out, "new_name();\n");
    }

    #[test]
    fn test_apply_patches_rejects_stray_replacement() {
        let chain = MatcherChain::default();
        let content = "fn a() {\n    run();\n}\n";
        let entries = vec![entry("let retries = 3;", "}")];
        assert_eq!(
            apply_patches(content, &entries, &chain).unwrap_err(),
            "patch 1 did not match"
        );

        let entries = vec![entry("return Err(e);", "Ok(())")];
        assert!(apply_patches("fn b() -> R {\n    Ok(())\n}\n", &entries, &chain).is_err());
    }

    #[test]
    fn test_shared_anchor() {
        assert_eq!(shared_anchor("old_name()", "new_name()"), "_name()");
        assert_eq!(shared_anchor("let retries = 3;", "}"), "");
        assert!(!replacement_is_evidence(&entry("    41\n", "    42\n")));
        assert!(replacement_is_evidence(&entry("x = 1;\n    41", "x = 1;\n    42")));
    }

    #[test]
    fn test_apply_patches_fails_when_any_entry_misses() {
        let chain = MatcherChain::default();
        let entries = vec![entry("a", "b"), entry("zzz", "y")];
        let err = apply_patches("a\n", &entries, &chain).unwrap_err();
        assert_eq!(err, "patch 2 did not match");
    }

    // ========== Change sets ==========

    #[tokio::test]
    async fn test_apply_change_set_writes_and_reports() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\n").unwrap();

        let set = ChangeSet {
            files: vec![
                FileChange::create("src/new.rs", "fn n() {}\n"),
                FileChange::patch("lib.rs", "fn a() {}", "fn a() { b() }"),
                FileChange::delete("old.txt"),
                FileChange::delete("never-existed.txt"),
            ],
        };
        let result = apply_change_set(dir.path(), &set, &MatcherChain::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.modified_files, vec!["src/new.rs", "lib.rs", "old.txt"]);
        assert_eq!(result.unchanged_files, vec!["never-existed.txt"]);
        assert!(dir.path().join("src/new.rs").exists());
        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn a() { b() }\n"
        );
    }

    #[tokio::test]
    async fn test_reapplying_change_set_modifies_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\n").unwrap();
        let set = ChangeSet {
            files: vec![
                FileChange::create("src/new.rs", "fn n() {}\n"),
                FileChange::patch("lib.rs", "fn a() {}", "fn a() {}\nfn b() {}"),
            ],
        };
        let chain = MatcherChain::default();

        let first = apply_change_set(dir.path(), &set, &chain).await.unwrap();
        assert_eq!(first.modified_files.len(), 2);

        let second = apply_change_set(dir.path(), &set, &chain).await.unwrap();
        assert!(second.success);
        assert!(second.modified_files.is_empty());
        assert_eq!(second.unchanged_files.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_writes_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\n").unwrap();
        let set = ChangeSet {
            files: vec![
                FileChange::create("src/new.rs", "fn n() {}\n"),
                FileChange::patch("lib.rs", "fn missing() {}", "x"),
                FileChange::patch("absent.rs", "a", "b"),
            ],
        };
        let result = apply_change_set(dir.path(), &set, &MatcherChain::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
        assert!(result.modified_files.is_empty());
        assert!(!dir.path().join("src/new.rs").exists());
    }

    #[tokio::test]
    async fn test_later_operation_sees_earlier_one() {
        let dir = TempDir::new().unwrap();
        let set = ChangeSet {
            files: vec![
                FileChange::create("a.rs", "fn a() {}\n"),
                FileChange::patch("a.rs", "fn a() {}", "fn a() { 1 }"),
            ],
        };
        let result = apply_change_set(dir.path(), &set, &MatcherChain::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.modified_files, vec!["a.rs"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "fn a() { 1 }\n"
        );
    }
}
