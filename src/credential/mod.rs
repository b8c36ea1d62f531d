//! 上游凭据（API Key）与凭据池。

pub mod pool;
pub mod types;

pub use pool::CredentialPool;
pub use types::Credential;
