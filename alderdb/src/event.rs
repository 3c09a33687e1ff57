//! Subtree event stream, the seam towards external shredders.
//!
//! Bulk insertion and subtree copies consume a flat event stream instead
//! of a foreign document model; anything able to produce these events can
//! feed the store.

use crate::{Error, QName, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SubtreeEvent {
    StartElement {
        name: QName,
        attributes: Vec<(QName, String)>,
        namespaces: Vec<QName>,
    },
    Text(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: String,
    },
    EndElement,
}

/// Comments must not contain a double hyphen.
pub(crate) fn validate_comment(value: &str) -> Result<()> {
    if value.contains("--") {
        return Err(Error::InvalidContent("comment must not contain '--'"));
    }
    Ok(())
}

/// Processing-instruction data must not contain the closing delimiter.
pub(crate) fn validate_pi(target: &str, data: &str) -> Result<()> {
    if target.is_empty() {
        return Err(Error::InvalidContent(
            "processing instruction needs a target",
        ));
    }
    if data.contains("?>") {
        return Err(Error::InvalidContent(
            "processing instruction must not contain '?>'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_validation() {
        assert!(validate_comment("fine - really").is_ok());
        assert!(validate_comment("not -- fine").is_err());
    }

    #[test]
    fn pi_validation() {
        assert!(validate_pi("target", "data").is_ok());
        assert!(validate_pi("", "data").is_err());
        assert!(validate_pi("target", "bad ?> data").is_err());
    }
}
