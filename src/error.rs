//! Error handling framework.
//!
//! One error enum per subsystem, all convertible into [`CacheScopeError`].
//! Callers that only need to decide "log and carry on" vs "give up" should use
//! [`CacheScopeError::is_recoverable`] and [`CacheScopeError::recovery_hint`].

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum CacheScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl CacheScopeError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            CacheScopeError::Config(_) => false,
            CacheScopeError::Sampler(e) => e.is_recoverable(),
            CacheScopeError::Store(e) => e.is_recoverable(),
            CacheScopeError::Catalog(_) => true,
            CacheScopeError::Notify(e) => e.is_recoverable(),
            CacheScopeError::Io(_) => true,
            CacheScopeError::Internal(_) => false,
            CacheScopeError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CacheScopeError::Config(_) => "config",
            CacheScopeError::Sampler(_) => "sampler",
            CacheScopeError::Store(_) => "store",
            CacheScopeError::Catalog(_) => "catalog",
            CacheScopeError::Notify(_) => "notify",
            CacheScopeError::Io(_) => "io",
            CacheScopeError::Internal(_) => "internal",
            CacheScopeError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CacheScopeError::Config(_) => RecoveryHint::FixConfiguration,
            CacheScopeError::Sampler(e) => e.recovery_hint(),
            CacheScopeError::Store(e) => e.recovery_hint(),
            CacheScopeError::Catalog(_) => RecoveryHint::Skip,
            CacheScopeError::Notify(e) => e.recovery_hint(),
            CacheScopeError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the peer
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Surface to the caller as-is; the request itself was wrong
    RejectRequest,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigError::ValidationFailed {
            message: errors.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Sampler Errors
// ----------------------------------------------------------------------------

/// Errors from the interface rate sampler
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to enumerate interfaces under '{source_name}': {message}")]
    EnumerationFailed { source_name: String, message: String },

    #[error("Failed to read counters for '{interface}': {message}")]
    ReadFailed { interface: String, message: String },

    #[error("Interface '{interface}' disappeared")]
    Vanished { interface: String },

    #[error("Sampler storage failure: {0}")]
    Store(#[from] StoreError),
}

impl SamplerError {
    pub fn read_failed(interface: impl Into<String>, message: impl ToString) -> Self {
        SamplerError::ReadFailed {
            interface: interface.into(),
            message: message.to_string(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            SamplerError::Store(e) => e.is_recoverable(),
            _ => true,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SamplerError::ReadFailed { .. } | SamplerError::Vanished { .. } => RecoveryHint::Skip,
            SamplerError::EnumerationFailed { .. } => RecoveryHint::RetryWithBackoff,
            SamplerError::Store(e) => e.recovery_hint(),
        }
    }
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the storage layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conflict on {entity} '{key}'")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("Invalid {entity}: {message}")]
    InvalidInput { entity: &'static str, message: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn conflict(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::Conflict { entity, key: key.into() }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound { entity, key: key.into() }
    }

    pub fn invalid(entity: &'static str, message: impl Into<String>) -> Self {
        StoreError::InvalidInput { entity, message: message.into() }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StoreError::Unavailable { .. } => RecoveryHint::RetryWithBackoff,
            _ => RecoveryHint::RejectRequest,
        }
    }
}

// ----------------------------------------------------------------------------
// Catalog Errors
// ----------------------------------------------------------------------------

/// Errors from catalog metadata providers
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Metadata lookup for key {key} failed: {message}")]
    LookupFailed { key: u32, message: String },

    #[error("Malformed metadata response for key {key}: {message}")]
    MalformedResponse { key: u32, message: String },

    #[error("Failed to load metadata mirror from '{path}': {message}")]
    MirrorLoad { path: PathBuf, message: String },
}

// ----------------------------------------------------------------------------
// Notification Errors
// ----------------------------------------------------------------------------

/// Errors from the change notification channel
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to bind refresh hub on '{address}': {message}")]
    BindFailed { address: String, message: String },

    #[error("Failed to connect to '{url}': {message}")]
    ConnectFailed { url: String, message: String },

    #[error("Refresh channel closed")]
    Closed,
}

impl NotifyError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NotifyError::BindFailed { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            NotifyError::BindFailed { .. } => RecoveryHint::FixConfiguration,
            NotifyError::ConnectFailed { .. } => RecoveryHint::Reconnect,
            NotifyError::Closed => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine-level operations
pub type CacheScopeResult<T> = Result<T, CacheScopeError>;

/// Result type for sampler operations
pub type SamplerResult<T> = Result<T, SamplerError>;

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Result type for notification operations
pub type NotifyResult<T> = Result<T, NotifyError>;
