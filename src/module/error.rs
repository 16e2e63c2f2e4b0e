use thiserror::Error;

/// Bootstrap failures. All of them abort startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("required module(s) not found: {}", .missing.join(", "))]
    ModuleNotFound { missing: Vec<String> },

    #[error("module '{module}' has no eligible provider")]
    NoProvider { module: String },

    #[error("module '{module}' has more than one eligible provider: {}", .providers.join(", "))]
    DuplicateProvider {
        module: String,
        providers: Vec<String>,
    },

    #[error("cycle dependency between providers: {}", .providers.join(", "))]
    CycleDependency { providers: Vec<String> },

    #[error("module '{module}' did not register required service(s): {}", .services.join(", "))]
    ServiceMissing {
        module: String,
        services: Vec<String>,
    },

    #[error("service '{service}' is not registered")]
    ServiceNotRegistered { service: String },

    #[error("service '{service}' is registered with a different type")]
    ServiceTypeMismatch { service: String },
}
