//! gate-core: the fingerprint/cache/replay engine behind inference-gate.
//!
//! The engine is HTTP-framework-agnostic: the listener hands each request to
//! [`Router::handle`] as a [`CanonicalRequest`] and translates the returned
//! [`GateResponse`] back into its own response type. Upstream access goes
//! through the [`Upstream`] trait so record-and-replay mode, replay-only
//! mode, and tests all share one code path.

pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod record;
pub mod replay;
pub mod request;
pub mod response;
pub mod router;
pub mod store;
pub mod upstream;

pub use entry::{Body, CacheStats, Entry, EntryMeta, EntrySummary, StoredBody};
pub use error::StoreError;
pub use fingerprint::{fingerprint, Fingerprint};
pub use request::CanonicalRequest;
pub use response::{GateBody, GateResponse};
pub use router::{GateMode, Router};
pub use store::Store;
pub use upstream::{Upstream, UpstreamBody, UpstreamError, UpstreamResponse};
