//! LocalStack endpoint discovery.

use anyhow::{Context, Result};
use http::Uri;
use std::env;

/// Build the LocalStack edge endpoint when `LOCALSTACK_HOSTNAME` is set.
///
/// `EDGE_PORT` overrides the default port of `4566`.
///
/// Ref: https://docs.localstack.cloud/references/configuration/
pub(crate) fn get_endpoint_uri() -> Result<Option<Uri>> {
    let Ok(host) = env::var("LOCALSTACK_HOSTNAME") else {
        return Ok(None);
    };
    let port = env::var("EDGE_PORT").unwrap_or_else(|_| "4566".to_string());
    let uri = format!("http://{host}:{port}");
    uri.parse::<Uri>()
        .map(Some)
        .with_context(|| format!("Failed to parse LocalStack URI: {uri}"))
}


#[cfg(test)]
mod test {
    use super::test_utils::with_vars;
    use super::*;

    use serial_test::serial;

    fn endpoint(host: Option<&str>, port: Option<&str>) -> Result<Option<Uri>> {
        with_vars(
            &[("LOCALSTACK_HOSTNAME", host), ("EDGE_PORT", port)],
            get_endpoint_uri,
        )
    }

    #[test]
    #[serial]
    fn test_no_localstack() {
        assert_eq!(endpoint(None, None).unwrap(), None);
    }

    #[test]
    #[serial]
    fn test_default_edge_port() {
        assert_eq!(
            endpoint(Some("localstack"), None).unwrap(),
            Some(Uri::from_static("http://localstack:4566"))
        );
    }

    #[test]
    #[serial]
    fn test_custom_edge_port() {
        assert_eq!(
            endpoint(Some("localhost"), Some("4510")).unwrap(),
            Some(Uri::from_static("http://localhost:4510"))
        );
    }

    #[test]
    #[serial]
    fn test_bad_uri() {
        let e = endpoint(Some("bad:host"), Some("not-a-port")).unwrap_err();
        assert!(e.to_string().contains("http://bad:host:not-a-port"));
    }
}
