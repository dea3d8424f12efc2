//! Plain-text document model.
//!
//! Positions are counted in `char`s, not bytes, so a step produced by one
//! client means the same thing on every replica regardless of encoding.

use serde::{Deserialize, Serialize};

use crate::{Document, Step, StepError, Tie};

/// An immutable plain-text document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDoc {
    text: String,
}

impl TextDoc {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Byte offset of a char position. `pos == len()` maps to the end.
    fn byte_offset(&self, pos: usize) -> Result<usize, StepError> {
        if pos == 0 {
            return Ok(0);
        }
        match self.text.char_indices().nth(pos) {
            Some((offset, _)) => Ok(offset),
            None if pos == self.len() => Ok(self.text.len()),
            None => Err(StepError::OutOfRange {
                pos,
                len: self.len(),
            }),
        }
    }
}

impl Document for TextDoc {
    fn empty() -> Self {
        Self::default()
    }
}

/// Insert or delete text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum TextStep {
    Insert { pos: usize, text: String },
    Delete { from: usize, to: usize },
}

impl TextStep {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self::Delete { from, to }
    }
}

/// Map a position through a deletion of `from..to`.
fn map_through_delete(pos: usize, from: usize, to: usize) -> usize {
    if pos <= from {
        pos
    } else if pos >= to {
        pos - (to - from)
    } else {
        from
    }
}

impl Step for TextStep {
    type Doc = TextDoc;

    fn apply(&self, doc: &TextDoc) -> Result<TextDoc, StepError> {
        match self {
            Self::Insert { pos, text } => {
                let offset = doc.byte_offset(*pos)?;
                let mut next = String::with_capacity(doc.text.len() + text.len());
                next.push_str(&doc.text[..offset]);
                next.push_str(text);
                next.push_str(&doc.text[offset..]);
                Ok(TextDoc::new(next))
            }
            Self::Delete { from, to } => {
                if from > to {
                    return Err(StepError::InvalidRange {
                        from: *from,
                        to: *to,
                    });
                }
                let start = doc.byte_offset(*from)?;
                let end = doc.byte_offset(*to)?;
                let mut next = String::with_capacity(doc.text.len() - (end - start));
                next.push_str(&doc.text[..start]);
                next.push_str(&doc.text[end..]);
                Ok(TextDoc::new(next))
            }
        }
    }

    fn invert(&self, doc: &TextDoc) -> Result<Self, StepError> {
        match self {
            Self::Insert { pos, text } => {
                if *pos > doc.len() {
                    return Err(StepError::OutOfRange {
                        pos: *pos,
                        len: doc.len(),
                    });
                }
                Ok(Self::delete(*pos, pos + text.chars().count()))
            }
            Self::Delete { from, to } => {
                if from > to {
                    return Err(StepError::InvalidRange {
                        from: *from,
                        to: *to,
                    });
                }
                let start = doc.byte_offset(*from)?;
                let end = doc.byte_offset(*to)?;
                Ok(Self::insert(*from, &doc.text[start..end]))
            }
        }
    }

    fn rebase(&self, over: &Self, tie: Tie) -> Option<Self> {
        match (self, over) {
            (Self::Insert { pos, text }, Self::Insert { pos: other, text: inserted }) => {
                let shift = *other < *pos || (*other == *pos && tie == Tie::After);
                let pos = if shift {
                    pos + inserted.chars().count()
                } else {
                    *pos
                };
                Some(Self::insert(pos, text.clone()))
            }
            (Self::Insert { pos, text }, Self::Delete { from, to }) => {
                if *pos > *from && *pos < *to {
                    // The insertion point was deleted.
                    return None;
                }
                Some(Self::insert(map_through_delete(*pos, *from, *to), text.clone()))
            }
            (Self::Delete { from, to }, Self::Insert { pos, text }) => {
                let len = text.chars().count();
                if *pos <= *from {
                    Some(Self::delete(from + len, to + len))
                } else if *pos >= *to {
                    Some(self.clone())
                } else {
                    // Deleting around fresh content would silently drop it.
                    None
                }
            }
            (Self::Delete { from, to }, Self::Delete { from: other_from, to: other_to }) => {
                Some(Self::delete(
                    map_through_delete(*from, *other_from, *other_to),
                    map_through_delete(*to, *other_from, *other_to),
                ))
            }
        }
    }
}
