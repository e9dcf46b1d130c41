//! Path parsing.
//!
//! Paths handed to the engine are absolute: a leading `/` is required, and
//! empty components (`//`) make the whole path invalid. A single trailing
//! separator is tolerated. The root path parses to an empty component
//! sequence.

use crate::error::{FsError, FsResult};
use crate::fs::dir::MAX_NAME_LEN;

/// An absolute path parsed into its components. Borrows the input.
#[derive(Debug)]
pub struct Path<'a> {
    components: Vec<&'a [u8]>,
}

impl<'a> Path<'a> {
    /// Parses `path`, failing with [`FsError::Invalid`] on a relative
    /// path, an empty component, or an over-long name.
    pub fn parse(path: &'a str) -> FsResult<Self> {
        let bytes = path.as_bytes();
        if bytes.first() != Some(&b'/') {
            return Err(FsError::Invalid);
        }

        let mut components = Vec::new();
        let mut parts = bytes[1..].split(|&b| b == b'/').peekable();
        while let Some(part) = parts.next() {
            if part.is_empty() {
                // A single trailing separator is fine, anything else is not.
                if parts.peek().is_none() {
                    break;
                }
                return Err(FsError::Invalid);
            }
            if part.len() > MAX_NAME_LEN {
                return Err(FsError::Invalid);
            }
            components.push(part);
        }

        Ok(Self { components })
    }

    pub fn components(&self) -> &[&'a [u8]] {
        &self.components
    }

    /// Components of the parent directory.
    pub fn parent(&self) -> &[&'a [u8]] {
        let n = self.components.len();
        &self.components[..n.saturating_sub(1)]
    }

    /// The final component, absent for the root.
    pub fn base(&self) -> Option<&'a [u8]> {
        self.components.last().copied()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_is_empty() {
        let p = Path::parse("/").unwrap();
        assert!(p.is_root());
        assert!(p.base().is_none());
    }

    #[test]
    fn components_split() {
        let p = Path::parse("/home/test.txt").unwrap();
        assert_eq!(p.components(), &[b"home".as_slice(), b"test.txt".as_slice()]);
        assert_eq!(p.base(), Some(b"test.txt".as_slice()));
        assert_eq!(p.parent(), &[b"home".as_slice()]);
    }

    #[test]
    fn trailing_separator_tolerated() {
        let p = Path::parse("/home/").unwrap();
        assert_eq!(p.components(), &[b"home".as_slice()]);
    }

    #[test]
    fn relative_rejected() {
        assert_eq!(Path::parse("home").unwrap_err(), FsError::Invalid);
        assert_eq!(Path::parse("").unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn empty_component_rejected() {
        assert_eq!(Path::parse("//").unwrap_err(), FsError::Invalid);
        assert_eq!(Path::parse("/a//b").unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn long_name_rejected() {
        let long = format!("/{}", "x".repeat(256));
        assert_eq!(Path::parse(&long).unwrap_err(), FsError::Invalid);
        let ok = format!("/{}", "x".repeat(255));
        assert!(Path::parse(&ok).is_ok());
    }
}
