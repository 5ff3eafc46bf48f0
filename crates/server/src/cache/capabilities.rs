//! Static server capabilities.

use super::CacheLimits;
use crate::proto::build::bazel::semver::SemVer;
use crate::proto::reapi::{
    ActionCacheUpdateCapabilities, CacheCapabilities, ExecutionCapabilities,
    ServerCapabilities, compressor, digest_function, symlink_absolute_path_strategy,
};

/// Lowest REAPI version served.
pub const LOW_API_VERSION: (i32, i32) = (2, 0);
/// Highest REAPI version served.
pub const HIGH_API_VERSION: (i32, i32) = (2, 3);

fn semver((major, minor): (i32, i32)) -> SemVer {
    SemVer {
        major,
        minor,
        patch: 0,
        prerelease: String::new(),
    }
}

/// Build the capabilities advertised by this server.
///
/// Only SHA-256 and identity encoding are supported; remote execution is
/// never offered.
pub fn server_capabilities(limits: &CacheLimits) -> ServerCapabilities {
    let sha256 = digest_function::Value::Sha256 as i32;
    ServerCapabilities {
        cache_capabilities: Some(CacheCapabilities {
            digest_functions: vec![sha256],
            action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                update_enabled: limits.ac_update_enabled,
            }),
            cache_priority_capabilities: None,
            max_batch_total_size_bytes: i64::try_from(limits.max_batch_total_size)
                .unwrap_or(i64::MAX),
            symlink_absolute_path_strategy: symlink_absolute_path_strategy::Value::Allowed
                as i32,
            supported_compressors: Vec::new(),
            supported_batch_update_compressors: Vec::new(),
        }),
        execution_capabilities: Some(ExecutionCapabilities {
            digest_function: sha256,
            exec_enabled: false,
            execution_priority_capabilities: None,
            supported_node_properties: Vec::new(),
            digest_functions: vec![sha256],
        }),
        deprecated_api_version: None,
        low_api_version: Some(semver(LOW_API_VERSION)),
        high_api_version: Some(semver(HIGH_API_VERSION)),
    }
}

/// Reject requests that name a digest function other than SHA-256.
///
/// `UNKNOWN` means the client relies on the server default.
pub fn check_digest_function(value: i32) -> crate::error::CacheResult<()> {
    match digest_function::Value::try_from(value) {
        Ok(digest_function::Value::Unknown | digest_function::Value::Sha256) => Ok(()),
        _ => Err(crate::error::CacheError::InvalidArgument(format!(
            "unsupported digest function {value}"
        ))),
    }
}

/// Whether a compressor value means "no compression".
pub fn is_identity(compressor: i32) -> bool {
    compressor == compressor::Value::Identity as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::ServerConfig;

    #[test]
    fn test_capabilities_reflect_limits() {
        let mut config = ServerConfig::default();
        config.ac_update_enabled = false;
        config.max_batch_total_size = 1234;
        let caps = server_capabilities(&CacheLimits::from(&config));

        let cache = caps.cache_capabilities.unwrap();
        assert_eq!(cache.digest_functions, vec![digest_function::Value::Sha256 as i32]);
        assert!(!cache.action_cache_update_capabilities.unwrap().update_enabled);
        assert_eq!(cache.max_batch_total_size_bytes, 1234);
        assert!(cache.supported_compressors.is_empty());
        assert_eq!(
            cache.symlink_absolute_path_strategy,
            symlink_absolute_path_strategy::Value::Allowed as i32
        );
        assert!(!caps.execution_capabilities.unwrap().exec_enabled);
        assert_eq!(caps.high_api_version.unwrap().minor, 3);
    }

    #[test]
    fn test_digest_function_check() {
        assert!(check_digest_function(0).is_ok());
        assert!(check_digest_function(digest_function::Value::Sha256 as i32).is_ok());
        assert!(check_digest_function(digest_function::Value::Blake3 as i32).is_err());
        assert!(check_digest_function(999).is_err());
    }
}
