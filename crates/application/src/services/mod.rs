mod credential_service;

pub use credential_service::{
    ConfirmEmailRequest, CredentialService, CredentialServiceDependencies, LoginRequest,
    RegisterUserRequest,
};
