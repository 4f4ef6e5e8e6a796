pub mod authenticator;
pub mod metadata;
pub mod resolver;

pub use authenticator::{ClientAuthParams, ClientAuthenticator};
pub use metadata::{ClientMetadata, TokenEndpointAuthMethod};
pub use resolver::ClientResolver;
