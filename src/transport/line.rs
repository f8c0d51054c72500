//! Line-oriented single-session transport.
//!
//! Frames are UTF-8 JSON envelopes delimited by newlines:
//!
//! - stdin: receives request envelopes from the client
//! - stdout: carries response envelopes, nothing else
//! - stderr: diagnostic output (never protocol messages)
//!
//! The session is strictly sequential: one request is read, fully
//! dispatched, and answered before the next read. A malformed frame is
//! answered with a protocol error and ends the session; the process keeps
//! running.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dispatch::Dispatcher;
use crate::protocol::{parse_envelope, ResponseEnvelope};
use crate::registry::RequestContext;
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle};

/// A line-delimited envelope transport over any async reader/writer pair.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
}

impl LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Creates a transport over the process's stdin/stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: tokio::io::stdout(),
        }
    }
}

impl Default for LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    fn default() -> Self {
        Self::stdio()
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a transport over an arbitrary reader/writer pair.
    pub const fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Writes a response envelope, newline-terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_envelope(&mut self, envelope: &ResponseEnvelope) -> io::Result<()> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Frames must not contain embedded newlines.
        debug_assert!(
            !json.contains('\n'),
            "serialised envelope must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// A strictly sequential request/response session over a line transport.
pub struct LineSession<R, W> {
    transport: LineTransport<R, W>,
    dispatcher: Arc<Dispatcher>,
    coordinator: ShutdownCoordinator,
    grace: Duration,
    max_request_bytes: usize,
}

impl<R, W> LineSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a session.
    #[must_use]
    pub fn new(
        transport: LineTransport<R, W>,
        dispatcher: Arc<Dispatcher>,
        coordinator: ShutdownCoordinator,
        grace: Duration,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            coordinator,
            grace,
            max_request_bytes,
        }
    }

    /// Runs the session until EOF, a protocol error, or shutdown.
    ///
    /// While a dispatch is outstanding it runs to completion; if the
    /// shutdown signal arrives mid-dispatch the session still waits up to
    /// the grace deadline before abandoning the request.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(mut self) -> io::Result<()> {
        let handle = self.coordinator.handle();

        loop {
            let line = tokio::select! {
                () = handle.triggered() => break,
                line = self.transport.read_line() => match line? {
                    Some(line) => line,
                    None => break, // EOF, client closed the session
                },
            };

            if line.trim().is_empty() {
                continue;
            }

            if line.len() > self.max_request_bytes {
                self.transport
                    .write_envelope(&ResponseEnvelope::protocol_error(
                        None,
                        "request exceeds the configured size limit",
                    ))
                    .await?;
                break;
            }

            let envelope = match parse_envelope(&line) {
                Ok(envelope) => envelope,
                Err(violation) => {
                    tracing::warn!(error = %violation, "malformed frame, ending session");
                    self.transport
                        .write_envelope(&ResponseEnvelope::protocol_error(
                            violation.id.clone(),
                            violation.message,
                        ))
                        .await?;
                    break;
                }
            };

            let context = RequestContext::new(envelope.id.clone(), handle.cancellation());
            let guard = handle.begin(&envelope.id);

            let response = tokio::select! {
                response = self.dispatcher.dispatch(envelope, context) => Some(response),
                () = deadline_elapsed(&handle, self.grace) => None,
            };
            drop(guard);

            match response {
                Some(response) => self.transport.write_envelope(&response).await?,
                None => {
                    tracing::warn!(
                        "grace deadline elapsed with a dispatch outstanding, ending session"
                    );
                    break;
                }
            }

            if handle.is_triggered() {
                break;
            }
        }

        tracing::info!("line session ended");
        Ok(())
    }
}

/// Resolves once the shutdown signal has been raised *and* the grace
/// deadline has passed.
async fn deadline_elapsed(handle: &ShutdownHandle, grace: Duration) {
    handle.triggered().await;
    tokio::time::sleep(grace).await;
}
