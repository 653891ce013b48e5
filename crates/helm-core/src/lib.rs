pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tokens;
pub mod tools;

pub use errors::ProviderError;
pub use provider::{CredentialResolver, EventStream, Provider};
pub use stream::StreamEvent;
