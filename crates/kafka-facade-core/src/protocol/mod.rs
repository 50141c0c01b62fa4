//! Wire protocol plumbing: framing, correlation and response rewriting.

pub mod codec;
pub mod correlator;
pub mod rewrite;

pub use codec::{response_correlation_id, Frame, FrameCodec, RequestHeaderInfo};
pub use correlator::{PendingRequest, RequestLedger};
pub use rewrite::{CompositeRewriter, RewriteOutcome, Rewriter};
