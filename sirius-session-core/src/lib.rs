pub mod binding;
pub mod fingerprint;

pub use binding::{BindingCache, ChainBinding, DigestChainCache};
pub use fingerprint::{SessionFingerprint, digest_chain, message_digest, session_prefix_hash};
