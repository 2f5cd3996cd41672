//! RPC Error Types
//!
//! Maps application errors to JSON-RPC error codes. The 4xxx range mirrors
//! the HTTP 4xx class (caller mistakes), 5xxx the engine's own faults.

use cmdexec_core::error::AppError;
use jsonrpsee::types::ErrorObjectOwned;
use thiserror::Error;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const FORBIDDEN: i32 = 4003;
    pub const POLICY_REJECTED: i32 = 4005;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const STORE_ERROR: i32 = 5001;
    pub const SYSTEM_ERROR: i32 = 5002;
}

/// Server lifecycle errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind JSON-RPC server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to register method: {0}")]
    Register(String),
}

/// Convert AppError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: AppError) -> ErrorObjectOwned {
    let code = match &err {
        AppError::Validation(_) | AppError::Domain(_) | AppError::Serialization(_) => {
            code::VALIDATION_ERROR
        }
        AppError::NotFound(_) => code::NOT_FOUND,
        AppError::Conflict(_) | AppError::InvalidState(_) => code::CONFLICT,
        AppError::Forbidden(_) => code::FORBIDDEN,
        AppError::PolicyRejected(_) => code::POLICY_REJECTED,
        AppError::Store(_) => code::STORE_ERROR,
        AppError::Io(_) | AppError::Execution(_) => code::SYSTEM_ERROR,
        AppError::Config(_) | AppError::Internal(_) => code::INTERNAL_ERROR,
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_use_4xxx_codes() {
        let cases = [
            (AppError::Validation("x".into()), code::VALIDATION_ERROR),
            (AppError::NotFound("x".into()), code::NOT_FOUND),
            (AppError::InvalidState("x".into()), code::CONFLICT),
            (AppError::Forbidden("x".into()), code::FORBIDDEN),
            (AppError::PolicyRejected("rm not allowed".into()), code::POLICY_REJECTED),
        ];
        for (err, expected) in cases {
            assert!(err.is_client_error());
            assert_eq!(to_rpc_error(err).code(), expected);
        }
    }

    #[test]
    fn test_engine_faults_use_5xxx_codes() {
        assert_eq!(to_rpc_error(AppError::Store("locked".into())).code(), code::STORE_ERROR);
        assert_eq!(to_rpc_error(AppError::Internal("bug".into())).code(), code::INTERNAL_ERROR);

        let err = to_rpc_error(AppError::PolicyRejected("command 'rm' is not allowed".into()));
        assert!(err.message().contains("command 'rm' is not allowed"));
    }
}
