//! Change-set scoping and light validation before anything touches disk.

use std::collections::HashSet;
use std::path::{Component, Path};

use super::types::{ValidationReport, ValidationWarning};
use crate::agents::{ChangeSet, FileChange, FileOperation};
use crate::sflog_debug;

/// Extensions whose brace balance is checked.
const BRACE_CHECKED: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "java", "kt", "c", "h", "cpp", "hpp", "cs", "go", "swift",
    "json",
];

/// Extensions where tabs are a hard error.
const TAB_FORBIDDEN: &[&str] = &["yaml", "yml"];

/// Strip `./` prefixes and duplicate separators. Leaves `..` in place so
/// validation can reject it.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn in_scope(path: &str, allowed: &[String]) -> bool {
    allowed.is_empty()
        || allowed.iter().any(|prefix| {
            let prefix = normalize_path(prefix);
            prefix.is_empty() || path == prefix || path.starts_with(&format!("{}/", prefix))
        })
}

/// Keep only operations under `allowed_paths` (empty = everything), with
/// paths normalized.
pub fn filter_to_scope(change_set: ChangeSet, allowed_paths: &[String]) -> ChangeSet {
    let files = change_set
        .files
        .into_iter()
        .filter_map(|mut change| {
            change.path = normalize_path(&change.path);
            if in_scope(&change.path, allowed_paths) {
                Some(change)
            } else {
                sflog_debug!("dropping out-of-scope change to {}", change.path);
                None
            }
        })
        .collect();
    ChangeSet { files }
}

fn extension(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}

/// Extensions where `'` and `` ` `` open ordinary strings rather than
/// character literals.
const QUOTE_STRINGS: &[&str] = &["ts", "tsx", "js", "jsx"];

/// Length of a character literal starting at `chars[i]` (`'{'`, `'\''`,
/// `'\u{7b}'`), or `None` when the quote is a lifetime or label.
fn char_literal_len(chars: &[char], i: usize) -> Option<usize> {
    match chars.get(i + 1)? {
        '\\' => {
            // Escapes are short; `'\u{10FFFF}'` is the longest.
            let close = (i + 3..chars.len().min(i + 12)).find(|&j| chars[j] == '\'')?;
            Some(close - i + 1)
        }
        '\'' | '\n' => None,
        _ => (chars.get(i + 2) == Some(&'\'')).then_some(3),
    }
}

/// Net brace balance outside strings, character literals and comments.
fn brace_balance(content: &str, ext: &str) -> i64 {
    let quote_strings = QUOTE_STRINGS.contains(&ext);
    let chars: Vec<char> = content.chars().collect();
    let mut depth = 0i64;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            '"' => i = skip_string(&chars, i, '"'),
            '`' if quote_strings || ext == "go" => i = skip_string(&chars, i, '`'),
            '\'' if quote_strings => i = skip_string(&chars, i, '\''),
            '\'' => {
                if let Some(len) = char_literal_len(&chars, i) {
                    i += len;
                    continue;
                }
            }
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    depth
}

/// Index of the closing `quote` of the string opened at `start`.
fn skip_string(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' => i += 2,
            c if c == quote => return i,
            _ => i += 1,
        }
    }
    i
}

fn check_content(path: &str, content: &str, errors: &mut Vec<String>) {
    let ext = extension(path);
    if BRACE_CHECKED.contains(&ext) {
        let balance = brace_balance(content, ext);
        if balance != 0 {
            errors.push(format!("{}: unbalanced braces ({:+})", path, balance));
        }
    }
    if TAB_FORBIDDEN.contains(&ext) && content.contains('\t') {
        errors.push(format!("{}: tab characters are not allowed in YAML", path));
    }
}

fn check_path(path: &str, forbidden_dirs: &[String], errors: &mut Vec<String>) -> bool {
    if path.is_empty() {
        errors.push("empty file path".to_string());
        return false;
    }
    let p = Path::new(path);
    if p.is_absolute() || path.starts_with('/') {
        errors.push(format!("{}: absolute paths are not allowed", path));
        return false;
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        errors.push(format!("{}: path traversal is not allowed", path));
        return false;
    }
    if let Some(dir) = p.components().find_map(|c| match c {
        Component::Normal(part) => forbidden_dirs
            .iter()
            .find(|d| part.to_str() == Some(d.as_str())),
        _ => None,
    }) {
        errors.push(format!("{}: writes under {} are forbidden", path, dir));
        return false;
    }
    true
}

fn warn(warnings: &mut Vec<ValidationWarning>, code: &str, path: &str, message: &str) {
    warnings.push(ValidationWarning {
        code: code.to_string(),
        path: path.to_string(),
        message: message.to_string(),
    });
}

fn check_change(
    change: &FileChange,
    forbidden_dirs: &[String],
    errors: &mut Vec<String>,
    warnings: &mut Vec<ValidationWarning>,
) {
    let path = change.path.as_str();
    if !check_path(path, forbidden_dirs, errors) {
        return;
    }

    match change.operation {
        FileOperation::Create | FileOperation::Update => match &change.content {
            None => errors.push(format!("{}: {} without content", path, change.operation)),
            Some(content) => {
                check_content(path, content, errors);
                if !content.is_empty() && !content.ends_with('\n') {
                    warn(warnings, "missing-trailing-newline", path, "file does not end with a newline");
                }
                if content.contains("\r\n") {
                    warn(warnings, "crlf-line-endings", path, "file uses CRLF line endings");
                }
            }
        },
        FileOperation::Patch => match change.patches.as_deref() {
            None | Some([]) => errors.push(format!("{}: patch without entries", path)),
            Some(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    if entry.search.is_empty() {
                        errors.push(format!("{}: patch {} has an empty search", path, i + 1));
                    } else if entry.search == entry.replace {
                        warn(warnings, "noop-patch", path, "patch replaces text with itself");
                    }
                    if TAB_FORBIDDEN.contains(&extension(path)) && entry.replace.contains('\t') {
                        errors.push(format!("{}: tab characters are not allowed in YAML", path));
                    }
                }
            }
        },
        FileOperation::Delete => {}
    }
}

/// Validate a scoped change set. Errors make it invalid; warnings do not.
pub fn validate_change_set(change_set: &ChangeSet, forbidden_dirs: &[String]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();

    for change in &change_set.files {
        if !seen.insert(change.path.as_str()) {
            warn(
                &mut warnings,
                "duplicate-path",
                &change.path,
                "path appears more than once in the change set",
            );
        }
        check_change(change, forbidden_dirs, &mut errors, &mut warnings);
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
