use warp::http::StatusCode;

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(err) => write!(f, "IO error: {}", err),
            ConfigError::TomlError(msg) => write!(f, "TOML error: {}", msg),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Errors from the persistent shell child and its file-based command IPC.
#[derive(Debug)]
pub enum ShellError {
    SpawnFailed(String),
    NotAlive,
    IpcReadError(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::SpawnFailed(msg) => write!(f, "Failed to spawn shell: {}", msg),
            ShellError::NotAlive => write!(f, "Shell process is not alive"),
            ShellError::IpcReadError(msg) => write!(f, "Failed to read command result: {}", msg),
            ShellError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ShellError {}

impl From<std::io::Error> for ShellError {
    fn from(err: std::io::Error) -> Self {
        ShellError::IoError(err)
    }
}

/// Errors surfaced by session-scoped command execution.
#[derive(Debug)]
pub enum CommandError {
    /// The per-command deadline fired before the completion marker arrived.
    Timeout(u64),
    ExecutionError(String),
    NotFound(String),
    /// The shell child exited while commands were still pending.
    ShellTerminated(Option<i32>),
    SessionTerminated(String),
    Shell(ShellError),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Timeout(ms) => write!(f, "Command timed out after {}ms", ms),
            CommandError::ExecutionError(msg) => write!(f, "Command execution failed: {}", msg),
            CommandError::NotFound(cmd) => write!(f, "Command not found: {}", cmd),
            CommandError::ShellTerminated(Some(code)) => {
                write!(f, "shell terminated unexpectedly with exit code {}", code)
            }
            CommandError::ShellTerminated(None) => write!(f, "shell terminated unexpectedly"),
            CommandError::SessionTerminated(id) => write!(f, "Session {} is terminated", id),
            CommandError::Shell(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<ShellError> for CommandError {
    fn from(err: ShellError) -> Self {
        CommandError::Shell(err)
    }
}

/// Filesystem operation errors, classified from `std::io::Error`.
#[derive(Debug)]
pub enum FileError {
    NotFound(String),
    PermissionDenied(String),
    AlreadyExists(String),
    IsDirectory(String),
    NotDirectory(String),
    NoSpace(String),
    Other(String),
}

impl FileError {
    /// Maps an IO error for `path` onto the taxonomy.
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return FileError::NoSpace(path.to_string());
        }
        if err.raw_os_error() == Some(libc::EISDIR) {
            return FileError::IsDirectory(path.to_string());
        }
        if err.raw_os_error() == Some(libc::ENOTDIR) {
            return FileError::NotDirectory(path.to_string());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => FileError::PermissionDenied(path.to_string()),
            std::io::ErrorKind::AlreadyExists => FileError::AlreadyExists(path.to_string()),
            _ => FileError::Other(format!("{}: {}", path, err)),
        }
    }
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileError::NotFound(p) => write!(f, "File not found: {}", p),
            FileError::PermissionDenied(p) => write!(f, "Permission denied: {}", p),
            FileError::AlreadyExists(p) => write!(f, "File already exists: {}", p),
            FileError::IsDirectory(p) => write!(f, "Path is a directory: {}", p),
            FileError::NotDirectory(p) => write!(f, "Path is not a directory: {}", p),
            FileError::NoSpace(p) => write!(f, "No space left on device: {}", p),
            FileError::Other(msg) => write!(f, "Filesystem error: {}", msg),
        }
    }
}

impl std::error::Error for FileError {}

/// Background process registry errors.
#[derive(Debug)]
pub enum ProcessError {
    NotFound(String),
    IdInUse(String),
    SpawnFailed(String),
    Other(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::NotFound(id) => write!(f, "Process not found: {}", id),
            ProcessError::IdInUse(id) => write!(f, "Process id already in use: {}", id),
            ProcessError::SpawnFailed(msg) => write!(f, "Failed to spawn process: {}", msg),
            ProcessError::Other(msg) => write!(f, "Process error: {}", msg),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Port exposure and proxying errors.
#[derive(Debug)]
pub enum PortError {
    AlreadyExposed(u16),
    NotExposed(u16),
    InvalidPort(u16),
    Reserved(u16),
    ServiceNotResponding(u16, String),
    InUse(u16),
    CustomDomainRequired(String),
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::AlreadyExposed(p) => write!(f, "Port {} is already exposed", p),
            PortError::NotExposed(p) => write!(f, "Port {} is not exposed", p),
            PortError::InvalidPort(p) => write!(f, "Invalid port: {}", p),
            PortError::Reserved(p) => write!(f, "Port {} is reserved", p),
            PortError::ServiceNotResponding(p, msg) => {
                write!(f, "Service on port {} is not responding: {}", p, msg)
            }
            PortError::InUse(p) => write!(f, "Port {} is in use", p),
            PortError::CustomDomainRequired(host) => {
                write!(f, "Port exposure requires a custom domain (got {})", host)
            }
        }
    }
}

impl std::error::Error for PortError {}

/// Git clone operation errors, classified from git's stderr.
#[derive(Debug)]
pub enum GitError {
    RepositoryNotFound(String),
    AuthFailed(String),
    BranchNotFound(String),
    NetworkError(String),
    CloneFailed(String),
    CheckoutFailed(String),
    InvalidUrl(String),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::RepositoryNotFound(url) => write!(f, "Repository not found: {}", url),
            GitError::AuthFailed(url) => write!(f, "Authentication failed for {}", url),
            GitError::BranchNotFound(branch) => write!(f, "Branch not found: {}", branch),
            GitError::NetworkError(msg) => write!(f, "Git network error: {}", msg),
            GitError::CloneFailed(msg) => write!(f, "Git clone failed: {}", msg),
            GitError::CheckoutFailed(msg) => write!(f, "Git checkout failed: {}", msg),
            GitError::InvalidUrl(url) => write!(f, "Invalid git URL: {}", url),
        }
    }
}

impl std::error::Error for GitError {}

/// Interpreter context and kernel errors.
///
/// User code raising inside the kernel is not an error here; it rides back
/// inside a 200 payload so callers can tell "your code threw" apart from
/// "the platform failed".
#[derive(Debug)]
pub enum InterpreterError {
    InvalidLanguage(String),
    ContextNotFound(String),
    /// Kernel still booting. Retryable.
    NotReady(String),
    InvalidResponse(String),
    KernelDied(String),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpreterError::InvalidLanguage(lang) => write!(f, "Unsupported language: {}", lang),
            InterpreterError::ContextNotFound(id) => write!(f, "Context not found: {}", id),
            InterpreterError::NotReady(id) => write!(f, "Interpreter {} is not ready", id),
            InterpreterError::InvalidResponse(msg) => {
                write!(f, "Invalid JSON response from kernel: {}", msg)
            }
            InterpreterError::KernelDied(id) => write!(f, "Interpreter kernel {} exited", id),
        }
    }
}

impl std::error::Error for InterpreterError {}

/// Container lifecycle errors.
#[derive(Debug)]
pub enum LifecycleError {
    ContainerNotReady(String),
    ServiceUnavailable(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::ContainerNotReady(id) => write!(f, "Container {} is not ready", id),
            LifecycleError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Wire-level error: the stable code + HTTP status carried by every error
/// response body.
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub status: StatusCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::new("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new("INVALID_REQUEST", StatusCode::BAD_REQUEST, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 4xx responses are expected outcomes and must not be error-logged;
    /// 5xx are not and must be.
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<ShellError> for ApiError {
    fn from(err: ShellError) -> Self {
        let message = err.to_string();
        match err {
            ShellError::SpawnFailed(_) => {
                ApiError::new("SHELL_SPAWN_FAILED", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ShellError::NotAlive => {
                ApiError::new("SHELL_NOT_ALIVE", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ShellError::IpcReadError(_) | ShellError::IoError(_) => {
                ApiError::new("IPC_READ_ERROR", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        let message = err.to_string();
        match err {
            CommandError::Timeout(_) => {
                ApiError::new("COMMAND_TIMEOUT", StatusCode::GATEWAY_TIMEOUT, message)
            }
            CommandError::ExecutionError(_) => {
                ApiError::new("COMMAND_EXECUTION_ERROR", StatusCode::BAD_REQUEST, message)
            }
            CommandError::NotFound(_) => {
                ApiError::new("COMMAND_NOT_FOUND", StatusCode::NOT_FOUND, message)
            }
            CommandError::ShellTerminated(_) => ApiError::new(
                "SHELL_TERMINATED_UNEXPECTEDLY",
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
            ),
            CommandError::SessionTerminated(_) => {
                ApiError::new("SESSION_TERMINATED", StatusCode::GONE, message)
            }
            CommandError::Shell(shell) => ApiError::from(shell),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        let message = err.to_string();
        match err {
            FileError::NotFound(p) => {
                ApiError::new("FILE_NOT_FOUND", StatusCode::NOT_FOUND, message)
                    .with_details(serde_json::json!({ "path": p }))
            }
            FileError::PermissionDenied(p) => {
                ApiError::new("PERMISSION_DENIED", StatusCode::FORBIDDEN, message)
                    .with_details(serde_json::json!({ "path": p }))
            }
            FileError::AlreadyExists(p) => {
                ApiError::new("FILE_EXISTS", StatusCode::CONFLICT, message)
                    .with_details(serde_json::json!({ "path": p }))
            }
            FileError::IsDirectory(p) => {
                ApiError::new("IS_DIRECTORY", StatusCode::BAD_REQUEST, message)
                    .with_details(serde_json::json!({ "path": p }))
            }
            FileError::NotDirectory(p) => {
                ApiError::new("NOT_DIRECTORY", StatusCode::BAD_REQUEST, message)
                    .with_details(serde_json::json!({ "path": p }))
            }
            FileError::NoSpace(_) => {
                ApiError::new("NO_SPACE", StatusCode::INSUFFICIENT_STORAGE, message)
            }
            FileError::Other(_) => {
                ApiError::new("FILESYSTEM_ERROR", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        let message = err.to_string();
        match err {
            ProcessError::NotFound(_) => {
                ApiError::new("PROCESS_NOT_FOUND", StatusCode::NOT_FOUND, message)
            }
            ProcessError::IdInUse(_) => {
                ApiError::new("PROCESS_ID_IN_USE", StatusCode::CONFLICT, message)
            }
            ProcessError::SpawnFailed(_) => {
                ApiError::new("PROCESS_SPAWN_FAILED", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ProcessError::Other(_) => {
                ApiError::new("PROCESS_ERROR", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl From<PortError> for ApiError {
    fn from(err: PortError) -> Self {
        let message = err.to_string();
        match err {
            PortError::AlreadyExposed(p) => {
                ApiError::new("PORT_ALREADY_EXPOSED", StatusCode::CONFLICT, message)
                    .with_details(serde_json::json!({ "port": p }))
            }
            PortError::NotExposed(p) => {
                ApiError::new("PORT_NOT_EXPOSED", StatusCode::NOT_FOUND, message)
                    .with_details(serde_json::json!({ "port": p }))
            }
            PortError::InvalidPort(p) => {
                ApiError::new("INVALID_PORT", StatusCode::BAD_REQUEST, message)
                    .with_details(serde_json::json!({ "port": p }))
            }
            PortError::Reserved(p) => ApiError::new("PORT_RESERVED", StatusCode::BAD_REQUEST, message)
                .with_details(serde_json::json!({ "port": p })),
            PortError::ServiceNotResponding(p, _) => {
                ApiError::new("SERVICE_NOT_RESPONDING", StatusCode::SERVICE_UNAVAILABLE, message)
                    .with_details(serde_json::json!({ "port": p }))
            }
            PortError::InUse(p) => ApiError::new("PORT_IN_USE", StatusCode::CONFLICT, message)
                .with_details(serde_json::json!({ "port": p })),
            PortError::CustomDomainRequired(_) => {
                ApiError::new("CUSTOM_DOMAIN_REQUIRED", StatusCode::BAD_REQUEST, message)
            }
        }
    }
}

impl From<GitError> for ApiError {
    fn from(err: GitError) -> Self {
        let message = err.to_string();
        match err {
            GitError::RepositoryNotFound(url) => {
                ApiError::new("GIT_REPOSITORY_NOT_FOUND", StatusCode::NOT_FOUND, message)
                    .with_details(serde_json::json!({ "repository": url }))
            }
            GitError::AuthFailed(url) => {
                ApiError::new("GIT_AUTH_FAILED", StatusCode::UNAUTHORIZED, message)
                    .with_details(serde_json::json!({ "repository": url }))
            }
            GitError::BranchNotFound(branch) => {
                ApiError::new("GIT_BRANCH_NOT_FOUND", StatusCode::NOT_FOUND, message)
                    .with_details(serde_json::json!({ "branch": branch }))
            }
            GitError::NetworkError(_) => {
                ApiError::new("GIT_NETWORK_ERROR", StatusCode::BAD_GATEWAY, message)
            }
            GitError::CloneFailed(_) => {
                ApiError::new("GIT_CLONE_FAILED", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            GitError::CheckoutFailed(_) => {
                ApiError::new("GIT_CHECKOUT_FAILED", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            GitError::InvalidUrl(_) => {
                ApiError::new("INVALID_GIT_URL", StatusCode::BAD_REQUEST, message)
            }
        }
    }
}

impl From<InterpreterError> for ApiError {
    fn from(err: InterpreterError) -> Self {
        let message = err.to_string();
        match err {
            InterpreterError::InvalidLanguage(_) => {
                ApiError::new("INVALID_LANGUAGE", StatusCode::BAD_REQUEST, message)
            }
            InterpreterError::ContextNotFound(_) => {
                ApiError::new("CONTEXT_NOT_FOUND", StatusCode::NOT_FOUND, message)
            }
            InterpreterError::NotReady(_) | InterpreterError::KernelDied(_) => {
                ApiError::new("INTERPRETER_NOT_READY", StatusCode::SERVICE_UNAVAILABLE, message)
            }
            InterpreterError::InvalidResponse(_) => {
                ApiError::new("INVALID_JSON_RESPONSE", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::ContainerNotReady(_) => {
                ApiError::new("CONTAINER_NOT_READY", StatusCode::SERVICE_UNAVAILABLE, message)
            }
            LifecycleError::ServiceUnavailable(_) => {
                ApiError::new("SERVICE_UNAVAILABLE", StatusCode::SERVICE_UNAVAILABLE, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_error_maps_io_kinds() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            FileError::from_io("/tmp/x", &not_found),
            FileError::NotFound(_)
        ));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            FileError::from_io("/tmp/x", &denied),
            FileError::PermissionDenied(_)
        ));

        let enospc = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(matches!(
            FileError::from_io("/tmp/x", &enospc),
            FileError::NoSpace(_)
        ));
    }

    #[test]
    fn api_error_codes_and_statuses() {
        let err: ApiError = CommandError::Timeout(30_000).into();
        assert_eq!(err.code, "COMMAND_TIMEOUT");
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(err.is_server_error());

        let err: ApiError = CommandError::SessionTerminated("s1".to_string()).into();
        assert_eq!(err.code, "SESSION_TERMINATED");
        assert_eq!(err.status, StatusCode::GONE);
        assert!(!err.is_server_error());

        let err: ApiError = PortError::NotExposed(9999).into();
        assert_eq!(err.code, "PORT_NOT_EXPOSED");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.details, Some(serde_json::json!({ "port": 9999 })));
    }

    #[test]
    fn shell_termination_message_carries_exit_code() {
        let err: ApiError = CommandError::ShellTerminated(Some(137)).into();
        assert!(err.message.contains("shell terminated unexpectedly"));
        assert!(err.message.contains("137"));
    }
}
