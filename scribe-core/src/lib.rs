//! # scribe-core: Document and step value types
//!
//! The synchronization layer never looks inside a document. It only needs:
//!
//! - an immutable [`Document`] snapshot with a well-known initial value,
//! - a [`Step`] that applies to a document, can be inverted, and can be
//!   rebased over a step that was applied concurrently.
//!
//! ```text
//!        doc_v ──── a ────► doc_v+a
//!          │                   │
//!          r            r.rebase(a, Before)
//!          ▼                   ▼
//!     doc_v+r ── a.rebase(r, After) ──► same document
//! ```
//!
//! The rebase rule must be deterministic and must converge as drawn above:
//! applying `r` then `a'` yields the same document as applying `a` then `r'`.
//! [`rebase_steps`] lifts the pairwise rule to a sequence of steps, which is
//! what both the server (incoming batch over its log) and the client (pending
//! steps over pulled steps) use.
//!
//! [`text`] provides a plain-text model implementing both traits.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod text;

pub use text::{TextDoc, TextStep};

/// Errors raised when a step cannot be applied to a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("position {pos} is outside the document (length {len})")]
    OutOfRange { pos: usize, len: usize },
    #[error("invalid range {from}..{to}")]
    InvalidRange { from: usize, to: usize },
    #[error("step rejected: {0}")]
    Rejected(String),
}

/// Which side a step lands on when it collides with the step it is rebased over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// The rebased step keeps its position; the other step's content ends up after it.
    Before,
    /// The rebased step is pushed past the other step's content.
    After,
}

/// An immutable document snapshot.
pub trait Document:
    Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The document every instance starts from (version 0).
    fn empty() -> Self;
}

/// A serializable edit operation.
pub trait Step:
    Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Doc: Document;

    /// Apply the step, producing a new document.
    fn apply(&self, doc: &Self::Doc) -> Result<Self::Doc, StepError>;

    /// The step that undoes `self`. `doc` is the document `self` applies to.
    fn invert(&self, doc: &Self::Doc) -> Result<Self, StepError>;

    /// Re-derive `self` so that it applies after `over`, where both steps
    /// were created against the same document.
    ///
    /// Returns `None` when the positions `self` refers to no longer exist.
    fn rebase(&self, over: &Self, tie: Tie) -> Option<Self>;
}

/// Rebase a sequence of steps over a single concurrent step.
///
/// `steps[0]` is based on the same document as `over`; every following step
/// is based on the document produced by its predecessors. `over` is carried
/// through the sequence so each step is rebased over the version of `over`
/// that matches its own base. `over` keeps priority on ties.
pub fn rebase_steps<S: Step>(steps: &[S], over: &S) -> Option<Vec<S>> {
    let mut carried = over.clone();
    let mut rebased = Vec::with_capacity(steps.len());
    for step in steps {
        let next = step.rebase(&carried, Tie::After)?;
        carried = carried.rebase(step, Tie::Before)?;
        rebased.push(next);
    }
    Some(rebased)
}

/// Rebase a sequence of steps over several steps applied in order.
pub fn rebase_steps_over<'a, S, I>(steps: &[S], overs: I) -> Option<Vec<S>>
where
    S: Step + 'a,
    I: IntoIterator<Item = &'a S>,
{
    let mut current = steps.to_vec();
    for over in overs {
        match rebase_steps(&current, over) {
            Some(next) => current = next,
            None => {
                log::debug!("Rebase over {over:?} is not possible");
                return None;
            }
        }
    }
    Some(current)
}

/// Apply steps in order.
pub fn apply_steps<'a, S, I>(doc: &S::Doc, steps: I) -> Result<S::Doc, StepError>
where
    S: Step + 'a,
    I: IntoIterator<Item = &'a S>,
{
    let mut current = doc.clone();
    for step in steps {
        current = step.apply(&current)?;
    }
    Ok(current)
}
