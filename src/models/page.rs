use std::fmt;

use crate::error::{BufferError, Result};

/// Opaque, durable reference to the document a term occurs in.
///
/// Compared and hashed by its string form, so the ordering of facts that
/// differ only in their target is plain lexicographic order of the references.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRef(String);

impl PageRef {
    /// Parse a page reference. Blank references are rejected; anything else
    /// is kept byte for byte.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(BufferError::InvalidFact(
                "can't have a null page".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the string form, used by size estimation
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PageRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_blank() {
        assert!(matches!(
            PageRef::parse(""),
            Err(BufferError::InvalidFact(_))
        ));
        assert!(matches!(
            PageRef::parse("   "),
            Err(BufferError::InvalidFact(_))
        ));
    }

    #[test]
    fn test_parse_keeps_reference_opaque() {
        let page = PageRef::parse("CHK@abc/index.html").unwrap();
        assert_eq!(page.len(), 18);
        assert_eq!(page.to_string(), "CHK@abc/index.html");

        let padded = PageRef::parse(" CHK@abc/index.html ").unwrap();
        assert_eq!(padded.as_str(), " CHK@abc/index.html ");
        assert_eq!(padded.len(), 20);
        assert_ne!(padded, page);
    }

    #[test]
    fn test_ordering_by_string_form() {
        let a = PageRef::parse("USK@a/site/1").unwrap();
        let b = PageRef::parse("USK@b/site/1").unwrap();
        assert!(a < b);
    }
}
