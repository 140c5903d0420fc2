//! Session, decoding, batch and packaging engine for the ImageFX endpoint.
//!
//! Data flows one way: an [`AuthCookies`](fxbatch_contracts::cookies::AuthCookies)
//! store builds a [`SessionClient`], the [`BatchRunner`] drives it prompt by
//! prompt and decodes each response with a [`ResponseDecoder`], and the
//! resulting [`BatchReport`](fxbatch_contracts::runs::BatchReport) is handed
//! to the [`ResultPackager`].

pub mod batch;
pub mod decoder;
pub mod error;
pub mod packager;
pub mod session;

pub use batch::{BatchRunner, CancellationToken, Disposition, RetryPolicy};
pub use decoder::{ImageFxDecoder, ResponseDecoder};
pub use error::{PackagingError, TransportError, TransportErrorKind};
pub use packager::{Archive, ArchiveEntry, FailureManifest, ResultPackager};
pub use session::{GenerationTransport, RawResponse, SessionClient, SessionConfig};
