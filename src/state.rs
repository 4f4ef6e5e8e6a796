use std::sync::Arc;

use crate::services::consent::ConsentProvider;
use crate::services::dpop::DpopPolicy;
use crate::services::oauth::OAuthService;
use crate::services::tokens::AccessTokenVerifier;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub oauth: Arc<OAuthService>,
    pub consent: Arc<dyn ConsentProvider>,
    /// Resource-side verification key for the middleware.
    pub access_tokens: Arc<AccessTokenVerifier>,
    pub storage: Arc<dyn Storage>,
    pub dpop_policy: DpopPolicy,
    /// Public base URL, used to reconstruct `htu` for resource requests.
    pub public_url: String,
}
