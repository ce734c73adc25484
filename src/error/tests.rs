//! Error Tests
//!
//! ## Test Scopes
//! - **HTTP mapping**: status codes per error kind.
//! - **Relayed errors**: bodies rebuilt into typed errors after forwarding.

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::error::{ClusterError, ErrorBody};

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            ClusterError::unreachable("n1", "refused").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ClusterError::ShardUnavailable {
                collection: "db/users".into(),
                shard: 2
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ClusterError::DocumentExists("k".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ClusterError::DocumentNotFound("k".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_request_errors_survive_forwarding() {
        let original = ClusterError::DocumentExists("user-1".into());
        let body = ErrorBody {
            error: original.kind().to_string(),
            message: "user-1".to_string(),
        };

        match ClusterError::from_body(body) {
            ClusterError::DocumentExists(key) => assert_eq!(key, "user-1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kinds_become_unreachable() {
        let body = ErrorBody {
            error: "shard_unavailable".to_string(),
            message: "no owner".to_string(),
        };
        assert!(matches!(
            ClusterError::from_body(body),
            ClusterError::NodeUnreachable { .. }
        ));
    }
}
