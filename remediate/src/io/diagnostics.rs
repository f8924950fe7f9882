//! Parse lint and compiler output into findings.
//!
//! Two line shapes are recognized:
//! - `path:line:col: message [Severity/rule]` (eslint `unix` formatter, gcc-style tools)
//! - `path(line,col): error TS1234: message` (tsc with `--pretty false`)

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Finding, Location, Severity};

static COLON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<path>[^:\s][^:]*?):(?P<line>\d+):(?P<col>\d+):\s*(?:(?P<sev>error|warning|info|note):\s*)?(?P<msg>.+?)(?:\s*\[(?P<tag>Error|Warning)/(?P<rule>[^\]]+)\])?\s*$",
    )
    .expect("colon diagnostic regex")
});

static PAREN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<path>.+?)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<sev>error|warning)\s+(?P<code>TS\d+):\s*(?P<msg>.+?)\s*$",
    )
    .expect("paren diagnostic regex")
});

/// Findings for every diagnostic line in `output`, with paths made relative to `root`.
///
/// Tools print paths either relative to their working directory or absolute;
/// absolute paths are matched against `root` as given, made absolute and
/// canonicalized, so a relative root such as `.` still yields repository paths.
pub fn parse_diagnostics(output: &str, root: &Path) -> Vec<Finding> {
    let root = RootPrefixes::new(root);
    output
        .lines()
        .filter_map(|line| parse_line(line.trim_end(), &root))
        .collect()
}

/// The spellings under which tool output may name the repository root.
struct RootPrefixes(Vec<PathBuf>);

impl RootPrefixes {
    fn new(root: &Path) -> Self {
        let mut prefixes = vec![root.to_path_buf()];
        let spellings = [std::path::absolute(root).ok(), root.canonicalize().ok()];
        for prefix in spellings.into_iter().flatten() {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        Self(prefixes)
    }

    fn relativize(&self, path: &Path) -> String {
        if path.is_absolute() {
            let canonical = path.canonicalize().ok();
            for candidate in std::iter::once(path).chain(canonical.as_deref()) {
                for prefix in &self.0 {
                    if let Ok(rel) = candidate.strip_prefix(prefix) {
                        return normalized(rel);
                    }
                }
            }
            return path.to_string_lossy().into_owned();
        }
        normalized(path)
    }
}

/// Relative `path` without `.` components, joined with `/`.
fn normalized(path: &Path) -> String {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_line(line: &str, root: &RootPrefixes) -> Option<Finding> {
    if let Some(caps) = PAREN_RE.captures(line) {
        return Some(Finding {
            kind: caps["code"].to_string(),
            description: caps["msg"].to_string(),
            location: Some(location(&caps["path"], &caps["line"], &caps["col"], root)),
            severity: severity(&caps["sev"]),
        });
    }
    let caps = COLON_RE.captures(line)?;
    let severity = caps
        .name("tag")
        .or_else(|| caps.name("sev"))
        .map_or(Severity::Error, |m| severity(m.as_str()));
    let kind = caps
        .name("rule")
        .map_or_else(|| "diagnostic".to_string(), |m| m.as_str().to_string());
    Some(Finding {
        kind,
        description: caps["msg"].to_string(),
        location: Some(location(&caps["path"], &caps["line"], &caps["col"], root)),
        severity,
    })
}

fn severity(raw: &str) -> Severity {
    match raw.to_ascii_lowercase().as_str() {
        "warning" => Severity::Warning,
        "info" | "note" => Severity::Info,
        _ => Severity::Error,
    }
}

fn location(path: &str, line: &str, col: &str, root: &RootPrefixes) -> Location {
    Location {
        path: root.relativize(Path::new(path)),
        line: line.parse().ok(),
        column: col.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eslint_unix_lines() {
        let output = "/repo/src/a.ts:3:10: Missing semicolon. [Error/semi]\n\
                      /repo/src/a.ts:7:1: Unexpected console statement. [Warning/no-console]\n\
                      \n\
                      2 problems\n";
        let findings = parse_diagnostics(output, Path::new("/repo"));
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].kind, "semi");
        assert_eq!(findings[0].description, "Missing semicolon.");
        assert_eq!(findings[0].severity, Severity::Error);
        let location = findings[0].location.as_ref().expect("location");
        assert_eq!(location.path, "src/a.ts");
        assert_eq!(location.line, Some(3));
        assert_eq!(location.column, Some(10));
        assert_eq!(findings[1].severity, Severity::Warning);
        assert_eq!(findings[1].kind, "no-console");
    }

    #[test]
    fn parses_tsc_lines() {
        let output = "src/a.ts(4,7): error TS2322: Type 'string' is not assignable to type 'number'.";
        let findings = parse_diagnostics(output, Path::new("/repo"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "TS2322");
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(
            findings[0].location.as_ref().and_then(|l| l.line),
            Some(4)
        );
    }

    #[test]
    fn parses_gcc_style_severity_prefix() {
        let findings = parse_diagnostics("lib/x.c:1:2: warning: unused variable", Path::new("/"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].description, "unused variable");
    }

    #[test]
    fn absolute_paths_resolve_against_a_relative_root() {
        let cwd = std::env::current_dir().expect("cwd");
        let output = format!(
            "{}:1:10: Missing semicolon. [Error/semi]",
            cwd.join("src/a.ts").display()
        );
        let findings = parse_diagnostics(&output, Path::new("."));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].location.as_ref().expect("location").path, "src/a.ts");
    }

    #[cfg(unix)]
    #[test]
    fn absolute_paths_resolve_through_symlinked_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let real = temp.path().join("real");
        std::fs::create_dir_all(real.join("src")).expect("mkdir");
        std::fs::write(real.join("src/a.ts"), "let a = 1\n").expect("write");
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let output = format!(
            "{}:1:10: Missing semicolon. [Error/semi]",
            real.canonicalize().expect("canonical").join("src/a.ts").display()
        );
        let findings = parse_diagnostics(&output, &link);
        assert_eq!(findings[0].location.as_ref().expect("location").path, "src/a.ts");
    }

    #[test]
    fn dot_prefixed_paths_are_normalized() {
        let findings = parse_diagnostics("./src/a.ts:2:1: Unexpected var. [Error/no-var]", Path::new("/repo"));
        assert_eq!(findings[0].location.as_ref().expect("location").path, "src/a.ts");
    }

    #[test]
    fn ignores_summary_noise() {
        let output = "✖ 2 problems (2 errors, 0 warnings)\nnpm WARN deprecated\n";
        assert!(parse_diagnostics(output, Path::new("/repo")).is_empty());
    }
}
