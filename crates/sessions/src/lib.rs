//! Session plumbing: key derivation, the CAS-guarded session store, the
//! identity service, and idle-lifecycle evaluation.

pub mod identity;
pub mod lifecycle;
pub mod session_key;
pub mod store;

pub use identity::{ContactHint, IdentityService, MemoryIdentityStore};
pub use lifecycle::{LifecycleManager, LifecycleTransition};
pub use session_key::{derive_session_key, parse_session_key, SessionKeyParts};
pub use store::{LocalSessionStore, SessionStore};
