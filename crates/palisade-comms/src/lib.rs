//! Manager communication core.
//!
//! Everything between the in-memory message lanes and the manager's HTTP
//! API lives here:
//!
//! - [`HttpTransport`]: one-shot requests, streaming downloads, and the
//!   authentication helpers. Total functions -- transport failures come
//!   back as synthetic 500 responses.
//! - [`TokenHolder`] + [`SessionManager`]: bearer-token lifecycle with
//!   proactive refresh ahead of the `exp` claim and single-flight
//!   re-authentication on 401/403.
//! - [`request_loop`]: the retrying long-request kernel shared by the
//!   command-poll, stateful and stateless pipelines.
//! - [`BatchDrain`]: the adapter that drains message lanes into framed,
//!   size-bounded request bodies and pops exactly what was sent.

pub mod batching;
pub mod groups;
pub mod http;
pub mod request_loop;
pub mod session;
pub mod token;

pub use batching::BatchDrain;
pub use http::{HttpMethod, HttpPerformer, HttpRequestParams, HttpResponse, HttpTransport, TransportError};
pub use session::{Authenticator, SessionManager, UuidKeyAuthenticator};
pub use token::TokenHolder;
