//! Errors surfaced at the allocation boundary.
//!
//! Everything below that boundary is an invariant violation and asserts
//! fatally; the hosted runtime only ever sees heap exhaustion.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("heap exhausted: {live_regions} regions live at the configured cap")]
    Exhausted { live_regions: usize },
}
