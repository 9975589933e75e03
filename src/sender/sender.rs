use super::connection::{Connection, ConnectionManager};
use crate::message::{Message, PipelineMessage};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_SUBMISSION_ATTEMPTS: u32 = 5;

/// Writes processed payloads to the intake connection and forwards
/// successfully-written messages to the auditor. Delivery is at-least-once
/// up to TCP's acknowledgement; under sustained failure messages are
/// dropped rather than blocking the pipeline.
pub struct Sender {
    input: mpsc::Receiver<PipelineMessage>,
    output: mpsc::Sender<PipelineMessage>,
    conn_manager: Arc<ConnectionManager>,
    conn: Option<Connection>,
}

impl Sender {
    pub fn new(
        input: mpsc::Receiver<PipelineMessage>,
        output: mpsc::Sender<PipelineMessage>,
        conn_manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            input,
            output,
            conn_manager,
            conn: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(item) = self.input.recv().await {
            match item {
                PipelineMessage::Stop => {
                    let _ = self.output.send(PipelineMessage::Stop).await;
                    break;
                }
                PipelineMessage::Log(msg) => self.wire_message(msg).await,
            }
        }
        if let Some(conn) = self.conn.take() {
            self.conn_manager.release(conn).await;
        }
    }

    async fn wire_message(&mut self, msg: Message) {
        let mut retries = MAX_SUBMISSION_ATTEMPTS;

        while retries > 0 {
            if self.conn.is_none() {
                match self.conn_manager.acquire().await {
                    Ok(conn) => self.conn = Some(conn),
                    Err(e) => {
                        warn!(error = %e, "no intake connection, dropping message");
                        return;
                    }
                }
            }
            let Some(conn) = self.conn.as_mut() else {
                return;
            };

            match conn.write_all(&msg.content).await {
                Ok(()) => {
                    let _ = self.output.send(PipelineMessage::Log(msg)).await;
                    return;
                }
                Err(e) => {
                    if is_expected_close(&e) {
                        // Idle connections are routinely closed server-side.
                        debug!(error = %e, "intake connection closed, reconnecting");
                    } else {
                        warn!(error = %e, "message submission error");
                    }
                    retries -= 1;
                    if let Some(conn) = self.conn.take() {
                        self.conn_manager.release(conn).await;
                    }
                }
            }
        }

        warn!(
            attempts = MAX_SUBMISSION_ATTEMPTS,
            "message submission retries exhausted, dropping message"
        );
    }
}

fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn make_message(content: &[u8]) -> PipelineMessage {
        PipelineMessage::Log(Message::new(content.to_vec()))
    }

    async fn read_line(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = socket.read(&mut byte).await.unwrap();
            if n == 0 || byte[0] == b'\n' {
                return line;
            }
            line.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_messages_reach_the_intake_and_the_auditor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_line(&mut socket).await
        });

        let manager = Arc::new(ConnectionManager::new("127.0.0.1", port, true).unwrap());
        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);
        tokio::spawn(Sender::new(in_rx, out_tx, manager).run());

        in_tx.send(make_message(b"k payload\n")).await.unwrap();

        assert_eq!(server.await.unwrap(), b"k payload");
        match out_rx.recv().await {
            Some(PipelineMessage::Log(msg)) => assert_eq!(msg.content, b"k payload\n"),
            other => panic!("expected the sent message at the auditor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // First connection: read one message, then close it.
            let (mut socket, _) = listener.accept().await.unwrap();
            let first = read_line(&mut socket).await;
            drop(socket);

            // The sender must come back with a fresh connection.
            let (mut socket, _) = listener.accept().await.unwrap();
            let second = read_line(&mut socket).await;
            (first, second)
        });

        let manager = Arc::new(ConnectionManager::new("127.0.0.1", port, true).unwrap());
        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);
        tokio::spawn(Sender::new(in_rx, out_tx, manager).run());

        in_tx.send(make_message(b"first\n")).await.unwrap();
        match out_rx.recv().await {
            Some(PipelineMessage::Log(msg)) => assert_eq!(msg.content, b"first\n"),
            other => panic!("expected first message, got {other:?}"),
        }

        // Let the close watcher observe the server-side close before the
        // next submission.
        tokio::time::sleep(Duration::from_millis(200)).await;

        in_tx.send(make_message(b"second\n")).await.unwrap();
        match out_rx.recv().await {
            Some(PipelineMessage::Log(msg)) => assert_eq!(msg.content, b"second\n"),
            other => panic!("expected second message, got {other:?}"),
        }

        let (first, second) = server.await.unwrap();
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[tokio::test]
    async fn test_stop_is_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = Arc::new(ConnectionManager::new("127.0.0.1", port, true).unwrap());
        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);
        tokio::spawn(Sender::new(in_rx, out_tx, manager).run());

        in_tx.send(PipelineMessage::Stop).await.unwrap();
        assert!(matches!(out_rx.recv().await, Some(PipelineMessage::Stop)));
        drop(listener);
    }
}
