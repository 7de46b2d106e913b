use std::sync::Arc;

use application::{CredentialService, RealtimeGateway, TokenService};

#[derive(Clone)]
pub struct AppState {
    pub credential_service: Arc<CredentialService>,
    pub token_service: Arc<TokenService>,
    pub gateway: Arc<RealtimeGateway>,
}

impl AppState {
    pub fn new(
        credential_service: Arc<CredentialService>,
        token_service: Arc<TokenService>,
        gateway: Arc<RealtimeGateway>,
    ) -> Self {
        Self {
            credential_service,
            token_service,
            gateway,
        }
    }
}
