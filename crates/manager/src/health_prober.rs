use std::time::Duration;

use serde::Deserialize;
use tokio::{sync::broadcast, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Ok,
    Loading(Option<String>),
    Error(String),
    Unknown,
}

#[derive(Deserialize)]
struct HealthErrorBody {
    error: HealthErrorMessage,
}

#[derive(Deserialize)]
struct HealthErrorMessage {
    message: Option<String>,
}

/// Polls a child's health endpoint on a schedule, publishing each result to
/// subscribers. Dropping the prober (or calling `stop`) ends the poll loop.
pub struct HealthProber {
    cancel: CancellationToken,
    tx: broadcast::Sender<HealthStatus>,
}

impl HealthProber {
    /// Start polling `http://127.0.0.1:<port><health_path>` every `interval`,
    /// after an initial `delay`.
    pub fn spawn(client: reqwest::Client, port: u16, health_path: String, interval_period: Duration, delay: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(32);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();
        let sender = tx.clone();
        let url = format!("http://127.0.0.1:{port}{health_path}");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_child.cancelled() => return,
            }

            let mut ticker = interval(interval_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_child.cancelled() => return,
                }

                let status = poll_once(&client, &url).await;
                debug!(url = %url, ?status, "health poll result");
                let _ = sender.send(status);
            }
        });

        Self { cancel, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthStatus> {
        self.tx.subscribe()
    }

    /// Cancel all pending polls. Existing subscribers simply stop receiving
    /// new values; no explicit "clear subscribers" step is needed since the
    /// sender is dropped along with the prober.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn poll_once(client: &reqwest::Client, url: &str) -> HealthStatus {
    match client.get(url).send().await {
        Ok(resp) if resp.status().as_u16() == 200 => HealthStatus::Ok,
        Ok(resp) if resp.status().as_u16() == 503 => {
            let message = resp
                .json::<HealthErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error.message);
            HealthStatus::Loading(message)
        }
        Ok(resp) => HealthStatus::Error(format!("HTTP {}", resp.status().as_u16())),
        Err(_) => HealthStatus::Error("network".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    #[test]
    fn health_status_equality_ignores_nothing() {
        assert_eq!(HealthStatus::Loading(Some("warming up".into())), HealthStatus::Loading(Some("warming up".into())));
        assert_ne!(HealthStatus::Loading(None), HealthStatus::Loading(Some("x".into())));
    }

    /// A synthetic test-only HTTP server that replies to every connection
    /// with a fixed status line and body, once per accepted connection.
    async fn spawn_fixed_response_server(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn poll_once_maps_200_to_ok() {
        let port = spawn_fixed_response_server("HTTP/1.1 200 OK", "{}").await;
        let status = poll_once(&reqwest::Client::new(), &format!("http://127.0.0.1:{port}/health")).await;
        assert_eq!(status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn poll_once_maps_503_to_loading_with_message() {
        let port = spawn_fixed_response_server(
            "HTTP/1.1 503 Service Unavailable",
            r#"{"error":{"message":"loading weights"}}"#,
        )
        .await;
        let status = poll_once(&reqwest::Client::new(), &format!("http://127.0.0.1:{port}/health")).await;
        assert_eq!(status, HealthStatus::Loading(Some("loading weights".to_string())));
    }

    #[tokio::test]
    async fn poll_once_maps_other_status_to_error() {
        let port = spawn_fixed_response_server("HTTP/1.1 500 Internal Server Error", "oops").await;
        let status = poll_once(&reqwest::Client::new(), &format!("http://127.0.0.1:{port}/health")).await;
        assert_eq!(status, HealthStatus::Error("HTTP 500".to_string()));
    }

    #[tokio::test]
    async fn poll_once_maps_connection_refused_to_network_error() {
        let status = poll_once(&reqwest::Client::new(), "http://127.0.0.1:1/health").await;
        assert_eq!(status, HealthStatus::Error("network".to_string()));
    }

    #[tokio::test]
    async fn spawn_publishes_results_to_subscribers() {
        let port = spawn_fixed_response_server("HTTP/1.1 200 OK", "{}").await;
        let prober = HealthProber::spawn(
            reqwest::Client::new(),
            port,
            "/health".to_string(),
            Duration::from_millis(20),
            Duration::from_millis(1),
        );
        let mut rx = prober.subscribe();

        let status = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(status, HealthStatus::Ok);

        prober.stop();
    }
}
