//! Component lists for host path cleanup.
//!
//! Evaluators sometimes build paths with doubled slashes, trailing slashes
//! or `.`/`..` components. The result is a host path, so `..` is resolved
//! lexically here without asking the evaluator again.

use std::fmt;

/// How much cleanup a path needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cleanliness {
    Clean,
    /// Contains `.` components
    Dot,
    /// Contains `..` components
    DotDot,
}

/// A path split into its non-empty components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathList {
    absolute: bool,
    components: Vec<String>,
}

impl PathList {
    /// Split `path` on `/`. Empty components (from `//` or a trailing
    /// slash) are dropped.
    pub fn split(path: &str) -> Self {
        Self {
            absolute: path.starts_with('/'),
            components: path
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }

    pub fn cleanliness(&self) -> Cleanliness {
        self.components
            .iter()
            .map(|c| match c.as_str() {
                "." => Cleanliness::Dot,
                ".." => Cleanliness::DotDot,
                _ => Cleanliness::Clean,
            })
            .max()
            .unwrap_or(Cleanliness::Clean)
    }

    pub fn remove_dots(&mut self) {
        self.components.retain(|c| c != ".");
    }

    /// Resolve `..` against the preceding component. At the root `..`
    /// stays at the root; in a relative path a leading `..` is kept.
    pub fn clean_dotdots(&mut self) {
        let mut out: Vec<String> = Vec::with_capacity(self.components.len());
        for c in self.components.drain(..) {
            if c == ".." {
                match out.last() {
                    Some(prev) if prev != ".." => {
                        out.pop();
                    }
                    _ if self.absolute => {}
                    _ => out.push(c),
                }
            } else {
                out.push(c);
            }
        }
        self.components = out;
    }
}

impl fmt::Display for PathList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str(if self.absolute { "/" } else { "." });
        }
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 || self.absolute {
                f.write_str("/")?;
            }
            f.write_str(c)?;
        }
        Ok(())
    }
}

/// Clean a host path returned by an evaluator.
pub fn clean_host_path(path: &str) -> String {
    let mut list = PathList::split(path);
    match list.cleanliness() {
        Cleanliness::Clean => {}
        Cleanliness::Dot => list.remove_dots(),
        Cleanliness::DotDot => {
            list.remove_dots();
            list.clean_dotdots();
        }
    }
    list.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_paths_unchanged() {
        for p in ["/", "/usr", "/usr/lib/libc.so.6", "/a/b..c/.d"] {
            assert_eq!(clean_host_path(p), p);
        }
    }

    #[test]
    fn test_dot_and_dotdot() {
        assert_eq!(clean_host_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_host_path("/a/./b/."), "/a/b");
        assert_eq!(clean_host_path("/a/b/../../.."), "/");
        assert_eq!(clean_host_path("/../etc"), "/etc");
    }

    #[test]
    fn test_slashes() {
        assert_eq!(clean_host_path("/a//b"), "/a/b");
        assert_eq!(clean_host_path("/opt/target//usr/"), "/opt/target/usr");
        assert_eq!(clean_host_path("//"), "/");
    }

    #[test]
    fn test_cleanliness() {
        assert_eq!(PathList::split("/a/b").cleanliness(), Cleanliness::Clean);
        assert_eq!(PathList::split("/a/./b").cleanliness(), Cleanliness::Dot);
        assert_eq!(PathList::split("/a/./../b").cleanliness(), Cleanliness::DotDot);
    }

    #[test]
    fn test_relative_paths_stay_relative() {
        assert_eq!(clean_host_path("a/../../b"), "../b");
        assert_eq!(clean_host_path("./x"), "x");
        assert_eq!(clean_host_path("a/.."), ".");
        assert!(!PathList::split("a/b").is_absolute());
    }
}
