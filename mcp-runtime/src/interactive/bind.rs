use std::net::{IpAddr, SocketAddr};

use cloudkit_core::{BindAttempt, BindError};
use tokio::net::TcpListener;

/// Bind the first free port from an ordered candidate list.
///
/// Every candidate is tried in order regardless of the failure kind; the first
/// success wins and no later candidate is touched. Returns the listener with
/// its actual port (resolves `0` to the ephemeral port the OS picked).
pub async fn bind_first_available(
    host: IpAddr,
    ports: &[u16],
) -> Result<(TcpListener, u16), BindError> {
    let mut attempts = Vec::with_capacity(ports.len());
    for &port in ports {
        let addr = SocketAddr::new(host, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                if !attempts.is_empty() {
                    tracing::info!(
                        port = bound,
                        skipped = ?attempts.iter().map(|a: &BindAttempt| a.port).collect::<Vec<_>>(),
                        "bound interactive listener on fallback port"
                    );
                }
                return Ok((listener, bound));
            }
            Err(err) => {
                tracing::debug!(port, error = %err, "interactive port unavailable");
                attempts.push(BindAttempt {
                    port,
                    reason: err.to_string(),
                });
            }
        }
    }
    Err(BindError { attempts })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn occupied() -> (TcpListener, u16) {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn free_port() -> u16 {
        let (listener, port) = occupied().await;
        drop(listener);
        port
    }

    #[tokio::test]
    async fn fails_only_after_trying_every_candidate_in_order() {
        let (_a, p0) = occupied().await;
        let (_b, p1) = occupied().await;
        let (_c, p2) = occupied().await;

        let err = bind_first_available(LOCALHOST, &[p0, p1, p2])
            .await
            .expect_err("all candidates are occupied");
        assert_eq!(err.attempted_ports(), vec![p0, p1, p2]);
    }

    #[tokio::test]
    async fn stops_at_first_free_candidate() {
        let (_a, p0) = occupied().await;
        let p1 = free_port().await;
        let (_c, p2) = occupied().await;

        let (listener, port) = bind_first_available(LOCALHOST, &[p0, p1, p2])
            .await
            .expect("second candidate is free");
        assert_eq!(port, p1);
        assert_eq!(listener.local_addr().unwrap().port(), p1);
    }

    #[tokio::test]
    async fn zero_candidate_resolves_to_ephemeral_port() {
        let (_listener, port) = bind_first_available(LOCALHOST, &[0]).await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_bind_error() {
        let err = bind_first_available(LOCALHOST, &[]).await.unwrap_err();
        assert!(err.attempts.is_empty());
    }
}
