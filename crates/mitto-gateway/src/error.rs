use mitto_store::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Manager(#[from] mitto_manager::ManagerError),
    #[error(transparent)]
    Runtime(#[from] mitto_runtime::RuntimeError),
    #[error(transparent)]
    Store(#[from] mitto_store::StoreError),
}

impl GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Manager(mitto_manager::ManagerError::UnknownWorkspace(_)) => {
                ErrorKind::InvalidArgument
            }
            GatewayError::Manager(mitto_manager::ManagerError::Store(e)) => e.kind(),
            GatewayError::Manager(mitto_manager::ManagerError::Runtime(e)) => e.kind(),
            GatewayError::Manager(mitto_manager::ManagerError::Acp(e)) => acp_kind(e),
            GatewayError::Runtime(e) => e.kind(),
            GatewayError::Store(e) => e.kind(),
        }
    }

    /// Short machine-readable code sent in an `error` message's `code` field.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::QueueEmpty => "queue_empty",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::AgentProtocol => "agent_protocol",
            ErrorKind::PermissionTimeout => "permission_timeout",
            ErrorKind::IoError => "io_error",
            ErrorKind::StoreCorrupt => "store_corrupt",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

fn acp_kind(e: &mitto_runtime::AcpError) -> ErrorKind {
    match e {
        mitto_runtime::AcpError::Unavailable(_) => ErrorKind::AgentUnavailable,
        mitto_runtime::AcpError::Protocol(_) => ErrorKind::AgentProtocol,
        mitto_runtime::AcpError::Cancelled => ErrorKind::Cancelled,
    }
}
