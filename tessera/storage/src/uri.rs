use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};

/// A storage location. Backends interpret the path; the engine only joins
/// segments and takes file names.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uri(String);

impl Uri {
    pub fn new<S: Into<String>>(s: S) -> Self {
        let mut s = s.into();
        while s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        Uri(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, segment: &str) -> Uri {
        Uri(format!("{}/{}", self.0, segment))
    }

    /// The final path segment, e.g. the fragment or file name.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Uri::new(s)
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Uri::new(s)
    }
}

impl From<&Path> for Uri {
    fn from(p: &Path) -> Self {
        Uri::new(p.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_file_name() {
        let base = Uri::new("/tmp/arrays/");
        let frag = base.join("a").join("__12_0");
        assert_eq!("/tmp/arrays/a/__12_0", frag.as_str());
        assert_eq!("__12_0", frag.file_name());
    }
}
