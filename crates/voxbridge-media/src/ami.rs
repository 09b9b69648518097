//! Asterisk Manager Interface client.
//!
//! Line-oriented text protocol over TCP with a login/action/response
//! pattern, correlated by a per-request ActionID. Only the actions the
//! bridge needs are implemented: Login, Redirect, Logoff. Requests are
//! serialized — a single in-flight action at a time — and a dropped
//! connection is re-established automatically before a Redirect.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::MediaError;

struct Transport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// AMI channel-control client.
pub struct AmiClient {
    host: String,
    port: u16,
    username: String,
    secret: String,
    timeout: Duration,

    // One lock covers connect, write and read: AMI responses carry no
    // framing beyond the blank line, so interleaved requests would
    // corrupt correlation.
    transport: Mutex<Option<Transport>>,
}

impl AmiClient {
    #[must_use]
    pub fn new(host: String, port: u16, username: String, secret: String) -> Self {
        Self {
            host,
            port,
            username,
            secret,
            timeout: Duration::from_secs(5),
            transport: Mutex::new(None),
        }
    }

    /// Open the TCP connection and authenticate.
    pub async fn connect(&self) -> Result<(), MediaError> {
        let mut guard = self.transport.lock().await;
        self.connect_locked(&mut guard).await
    }

    async fn connect_locked(
        &self,
        guard: &mut Option<Transport>,
    ) -> Result<(), MediaError> {
        tracing::info!(host = %self.host, port = self.port, user = %self.username, "Connecting to AMI");

        let stream = tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| MediaError::Timeout("AMI connect"))??;

        let (read_half, write_half) = stream.into_split();
        let mut transport = Transport {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // The manager greets with a banner line before any action.
        let mut banner = String::new();
        tokio::time::timeout(self.timeout, transport.reader.read_line(&mut banner))
            .await
            .map_err(|_| MediaError::Timeout("AMI banner"))??;
        tracing::info!(banner = %banner.trim(), "AMI banner received");

        let action_id = uuid::Uuid::new_v4().to_string();
        let login = format!(
            "Action: Login\r\nActionID: {action_id}\r\nUsername: {}\r\nSecret: {}\r\n\r\n",
            self.username, self.secret
        );
        let response = Self::send_action(&mut transport, &login, self.timeout).await?;

        if !is_success(&response) {
            let message = extract_field(&response, "Message").unwrap_or_default();
            return Err(MediaError::Ami(format!("login rejected: {message}")));
        }

        tracing::info!("AMI authenticated");
        *guard = Some(transport);
        Ok(())
    }

    /// Redirect a channel to a dialplan context/extension.
    ///
    /// Reconnects first if the connection has dropped (e.g. an
    /// Asterisk restart between calls).
    pub async fn redirect(
        &self,
        channel: &str,
        context: &str,
        exten: &str,
        priority: u32,
    ) -> Result<bool, MediaError> {
        let mut guard = self.transport.lock().await;

        if guard.is_none() {
            tracing::warn!("AMI disconnected, reconnecting before Redirect");
            self.connect_locked(&mut guard).await?;
        }

        let action_id = uuid::Uuid::new_v4().to_string();
        let action = format!(
            "Action: Redirect\r\nActionID: {action_id}\r\nChannel: {channel}\r\n\
             Context: {context}\r\nExten: {exten}\r\nPriority: {priority}\r\n\r\n"
        );

        tracing::info!(
            action_id = %action_id,
            channel = %channel,
            target = format_args!("{context},{exten},{priority}"),
            "AMI Redirect"
        );

        let transport = guard.as_mut().ok_or_else(|| {
            MediaError::Ami("not connected".to_string())
        })?;

        let response = match Self::send_action(transport, &action, self.timeout).await {
            Ok(response) => response,
            Err(e) => {
                // Connection is unusable; drop it so the next call
                // reconnects from scratch.
                *guard = None;
                return Err(e);
            }
        };

        let success = is_success(&response);
        if success {
            tracing::info!(action_id = %action_id, "Redirect accepted");
        } else {
            let message = extract_field(&response, "Message").unwrap_or_default();
            tracing::error!(action_id = %action_id, message = %message, "Redirect rejected");
        }
        Ok(success)
    }

    /// Log off gracefully and close the connection.
    pub async fn close(&self) {
        let mut guard = self.transport.lock().await;
        if let Some(mut transport) = guard.take() {
            let action_id = uuid::Uuid::new_v4().to_string();
            let logoff = format!("Action: Logoff\r\nActionID: {action_id}\r\n\r\n");
            let _ = Self::send_action(&mut transport, &logoff, self.timeout).await;
            let _ = transport.writer.shutdown().await;
            tracing::info!("AMI disconnected");
        }
    }

    #[must_use]
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Write one action and read the response block.
    async fn send_action(
        transport: &mut Transport,
        action: &str,
        timeout: Duration,
    ) -> Result<String, MediaError> {
        transport.writer.write_all(action.as_bytes()).await?;
        transport.writer.flush().await?;

        // Responses are "Key: Value" lines terminated by a blank line.
        let mut response = String::new();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(timeout, transport.reader.read_line(&mut line))
                .await
                .map_err(|_| MediaError::Timeout("AMI response"))??;
            if read == 0 {
                return Err(MediaError::Ami("connection closed mid-response".to_string()));
            }
            if line.trim_end().is_empty() {
                break;
            }
            response.push_str(&line);
        }
        Ok(response)
    }
}

fn is_success(response: &str) -> bool {
    extract_field(response, "Response").is_some_and(|v| v.eq_ignore_ascii_case("Success"))
}

fn extract_field(response: &str, key: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS: &str = "Response: Success\r\nActionID: abc\r\nMessage: Authentication accepted\r\n";
    const FAILURE: &str = "Response: Error\r\nActionID: abc\r\nMessage: Authentication failed\r\n";

    #[test]
    fn success_detection() {
        assert!(is_success(SUCCESS));
        assert!(!is_success(FAILURE));
        assert!(!is_success(""));
    }

    #[test]
    fn field_extraction() {
        assert_eq!(
            extract_field(SUCCESS, "Message").as_deref(),
            Some("Authentication accepted")
        );
        assert_eq!(extract_field(SUCCESS, "ActionID").as_deref(), Some("abc"));
        assert_eq!(extract_field(SUCCESS, "Channel"), None);
    }

    #[tokio::test]
    async fn redirect_against_scripted_manager() {
        // Minimal in-process AMI: banner, accept login, accept redirect.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            write_half
                .write_all(b"Asterisk Call Manager/6.0.0\r\n")
                .await
                .unwrap();

            for expected in ["Login", "Redirect"] {
                let mut block = String::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    if line.trim_end().is_empty() {
                        break;
                    }
                    block.push_str(&line);
                }
                assert!(block.contains(&format!("Action: {expected}")));
                let action_id = extract_field(&block, "ActionID").unwrap();
                let reply = format!("Response: Success\r\nActionID: {action_id}\r\n\r\n");
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let client = AmiClient::new(
            addr.ip().to_string(),
            addr.port(),
            "bridge".to_string(),
            "secret".to_string(),
        );
        client.connect().await.unwrap();
        assert!(client.is_connected().await);

        let accepted = client
            .redirect("PJSIP/1004-00000001", "ivr-fallback", "s", 1)
            .await
            .unwrap();
        assert!(accepted);

        server.await.unwrap();
    }
}
