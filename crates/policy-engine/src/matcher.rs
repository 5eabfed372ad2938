use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};

/// Token that switches a path pattern to glob semantics.
const RECURSIVE_WILDCARD: &str = "**";

/// A pre-compiled file-access pattern.
///
/// * A pattern ending in `/` matches anything strictly below that directory.
/// * A pattern containing `**` is a glob; `*` also crosses separators, which
///   is the safer behaviour for block rules (blocks more).
/// * Anything else matches as a literal prefix of the absolute path string.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Directory { raw: String, dir: PathBuf },
    Glob { raw: String, matcher: GlobMatcher },
    Prefix { raw: String, prefix: String },
}

impl PathPattern {
    /// Compile a single pattern. Relative patterns resolve against the
    /// current working directory.
    pub fn compile(pattern: &str) -> Result<Self> {
        let raw = pattern.to_string();
        if pattern.contains(RECURSIVE_WILDCARD) {
            let matcher = Glob::new(pattern)
                .with_context(|| format!("invalid file-path glob: {pattern}"))?
                .compile_matcher();
            return Ok(Self::Glob { raw, matcher });
        }
        if pattern.ends_with('/') {
            let trimmed = pattern.trim_end_matches('/');
            let dir = if trimmed.is_empty() {
                PathBuf::from("/")
            } else {
                normalize_path(Path::new(trimmed))
            };
            return Ok(Self::Directory { raw, dir });
        }
        let prefix = normalize_path(Path::new(pattern))
            .to_string_lossy()
            .into_owned();
        Ok(Self::Prefix { raw, prefix })
    }

    /// Test an already-normalized absolute path.
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Self::Directory { dir, .. } => path != dir && path.starts_with(dir),
            Self::Glob { matcher, .. } => matcher.is_match(path),
            Self::Prefix { prefix, .. } => path.to_string_lossy().starts_with(prefix.as_str()),
        }
    }

    /// The pattern as written in the policy file (after placeholder expansion).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Directory { raw, .. } | Self::Glob { raw, .. } | Self::Prefix { raw, .. } => raw,
        }
    }
}

/// Compile a list of patterns, failing on the first invalid one.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<PathPattern>> {
    patterns.iter().map(|p| PathPattern::compile(p)).collect()
}

/// Make `path` absolute and resolve `.` / `..` lexically.
///
/// The file does not need to exist; symlinks are not followed.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => Path::new("/").join(path),
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Never climb above the root.
                if out.parent().is_some() {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// `domain` is allowed by `allowed` when it equals it or is a subdomain of it.
/// Comparison is case-insensitive and ignores a trailing root dot.
pub fn domain_matches(allowed: &str, domain: &str) -> bool {
    let allowed = allowed.trim().trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if allowed.is_empty() || domain.is_empty() {
        return false;
    }
    domain == allowed || domain.ends_with(&format!(".{allowed}"))
}

/// Whether the file's extension (lowercased, with dot) is in `extensions`.
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = format!(".{}", ext.to_string_lossy().to_ascii_lowercase());
    extensions.iter().any(|e| e.to_ascii_lowercase() == ext)
}

/// Final path component of a command, e.g. `sudo` for `/usr/bin/sudo`.
pub fn command_basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        PathPattern::compile(pattern)
            .unwrap()
            .matches(&normalize_path(Path::new(path)))
    }

    // ---- path patterns ----

    #[test]
    fn directory_pattern_matches_contents_only() {
        assert!(matches("/home/u/.ssh/", "/home/u/.ssh/id_rsa"));
        assert!(matches("/home/u/.ssh/", "/home/u/.ssh/keys/deploy"));
        assert!(!matches("/home/u/.ssh/", "/home/u/.ssh"));
        assert!(!matches("/home/u/.ssh/", "/home/u/.sshkeys/x"));
    }

    #[test]
    fn directory_pattern_sees_through_dot_dot() {
        assert!(!matches("/srv/data/", "/srv/data/../secret/x"));
        assert!(matches("/srv/secret/", "/srv/data/../secret/x"));
    }

    #[test]
    fn recursive_glob_pattern() {
        assert!(matches("/**/.env", "/home/u/project/.env"));
        assert!(matches("/**/.env.*", "/home/u/project/.env.local"));
        assert!(matches("/**/id_rsa", "/root/.ssh/id_rsa"));
        assert!(!matches("/**/.env", "/home/u/project/.envrc"));
    }

    #[test]
    fn literal_prefix_pattern() {
        assert!(matches("/etc/pass", "/etc/passwd"));
        assert!(matches("/etc/passwd", "/etc/passwd"));
        assert!(!matches("/etc/passwd", "/etc/shadow"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(PathPattern::compile("/**/[invalid").is_err());
    }

    #[test]
    fn root_directory_pattern() {
        assert!(matches("/", "/anything/at/all"));
    }

    #[test]
    fn normalize_never_climbs_above_root() {
        assert_eq!(normalize_path(Path::new("/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }

    // ---- domains ----

    #[test]
    fn domain_exact_and_subdomain() {
        assert!(domain_matches("mail.example.com", "mail.example.com"));
        assert!(domain_matches("mail.example.com", "sub.mail.example.com"));
        assert!(domain_matches("mail.example.com", "MAIL.Example.com."));
        assert!(!domain_matches("mail.example.com", "evil.com"));
        assert!(!domain_matches("mail.example.com", "evilmail.example.com"));
        assert!(!domain_matches("mail.example.com", "mail.example.com.evil.com"));
    }

    #[test]
    fn empty_domain_never_matches() {
        assert!(!domain_matches("", "example.com"));
        assert!(!domain_matches("example.com", ""));
    }

    // ---- extensions / basenames ----

    #[test]
    fn extension_check_is_case_insensitive() {
        let exts = vec![".pem".to_string(), ".key".to_string()];
        assert!(has_extension(Path::new("/x/server.PEM"), &exts));
        assert!(has_extension(Path::new("/x/tls.key"), &exts));
        assert!(!has_extension(Path::new("/x/notes.txt"), &exts));
        assert!(!has_extension(Path::new("/x/Makefile"), &exts));
    }

    #[test]
    fn basename_of_command() {
        assert_eq!(command_basename("/usr/bin/sudo"), "sudo");
        assert_eq!(command_basename("echo"), "echo");
    }
}
