use eip_core::error::EipError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("eip: {0}")]
    Eip(#[from] EipError),

    #[error(
        "startup order {order} is used by both route '{first}' and route '{second}'"
    )]
    StartupOrderClash {
        order: u32,
        first: String,
        second: String,
    },

    #[error("route already registered: {0}")]
    DuplicateRoute(String),

    #[error("route not found: {0}")]
    UnknownRoute(String),

    #[error("component already registered for scheme: {0}")]
    DuplicateComponent(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid route definition: route={route_id}, reason={reason}")]
    InvalidDefinition { route_id: String, reason: String },

    #[error("mock assertion failed: endpoint={uri}, reason={reason}")]
    MockAssertion { uri: String, reason: String },
}

impl RuntimeError {
    pub fn invalid_definition(route_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            route_id: route_id.into(),
            reason: reason.into(),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
