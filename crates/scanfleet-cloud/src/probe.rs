//! Engine readiness probe.
//!
//! A freshly launched instance reaches the provider's running state well
//! before the engine software on it can accept work. Scan-manager client
//! implementations use this probe to answer `ping_engine` for real
//! deployments; the launch sequence keeps probing until the engine
//! responds or the readiness timeout expires.

use std::time::Duration;

use tracing::debug;

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The engine answered 2xx.
    Ready,
    /// The engine answered, but not 2xx; software still starting.
    NotReady,
    /// Connection refused, reset, or timed out.
    Failed,
}

impl ProbeResult {
    pub fn is_ready(self) -> bool {
        self == ProbeResult::Ready
    }
}

/// Probe the engine software at `uri` (e.g. `http://10.0.0.5:8088/status`)
/// with a single GET, bounded by `timeout`.
pub async fn probe_engine(uri: &str, timeout: Duration) -> ProbeResult {
    let Some((address, path)) = split_uri(uri) else {
        debug!(%uri, "engine probe skipped: unparseable uri");
        return ProbeResult::Failed;
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "engine probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "engine probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path.as_str())
            .header("host", address.as_str())
            .header("user-agent", "scanfleet-cloud/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, %uri, "engine probe request build failed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Ready
                } else {
                    debug!(status = %resp.status(), %uri, "engine probe non-2xx");
                    ProbeResult::NotReady
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "engine probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "engine probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Split `http://host:port/path` into (`host:port`, `/path`).
fn split_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("http://")?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some((address, path)) => Some((address.to_string(), format!("/{path}"))),
        None => Some((rest.to_string(), "/".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uri_with_path() {
        assert_eq!(
            split_uri("http://10.0.0.5:8088/api/status"),
            Some(("10.0.0.5:8088".to_string(), "/api/status".to_string()))
        );
    }

    #[test]
    fn split_uri_without_path_defaults_to_root() {
        assert_eq!(
            split_uri("http://10.0.0.5:8088"),
            Some(("10.0.0.5:8088".to_string(), "/".to_string()))
        );
    }

    #[test]
    fn split_uri_rejects_other_schemes() {
        assert_eq!(split_uri("ftp://10.0.0.5"), None);
        assert_eq!(split_uri("http://"), None);
    }

    #[tokio::test]
    async fn probe_against_closed_port_fails() {
        // Port 1 won't be listening.
        let result = probe_engine("http://127.0.0.1:1/status", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn probe_unparseable_uri_fails() {
        let result = probe_engine("not-a-uri", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
