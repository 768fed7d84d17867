//! Worker side of the protocol - runs inside the subprocess.
//!
//! The master side (spawning, correlation) is in supervisor.rs and bridge.rs.
//!
//! Flow:
//! 1. Write the alive token to stdout
//! 2. Decode framed requests from stdin
//! 3. Run the handler for each request on its own task
//! 4. Write each framed response as soon as it is ready
//!
//! Responses go out in completion order, not request order.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::wire::{Envelope, EnvelopeBuilder, FrameEncoder, FrameReader, PROCESS_ALIVE};

/// Request handler run by the worker.
///
/// `response` already carries the request id; fill in data, query fields or
/// an error. Builder errors are turned into an error response.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Envelope, response: &mut EnvelopeBuilder);
}

pub struct WorkerConfig {
    /// Requests handled concurrently. Reading stdin pauses at the limit.
    pub max_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

/// Serve requests over the process's own stdin/stdout until stdin closes or
/// SIGINT arrives.
pub async fn run_worker<H: RequestHandler>(handler: Arc<H>, config: WorkerConfig) -> io::Result<()> {
    tokio::select! {
        biased;

        Ok(()) = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, exiting");
            Ok(())
        }
        result = serve(handler, config, tokio::io::stdin(), tokio::io::stdout()) => result,
    }
}

/// Serve requests over an arbitrary reader/writer pair.
pub async fn serve<H, R, W>(
    handler: Arc<H>,
    config: WorkerConfig,
    input: R,
    mut output: W,
) -> io::Result<()>
where
    H: RequestHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    output.write_all(PROCESS_ALIVE.as_bytes()).await?;
    output.flush().await?;
    tracing::debug!("Handshake sent");

    let writer = Arc::new(Mutex::new(FramedWrite::new(output, FrameEncoder)));
    let mut reader = FramedRead::new(input, FrameReader::new());
    let limit = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            frame = reader.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Failed to read request stream");
                        break;
                    }
                    None => {
                        tracing::debug!("Request stream closed");
                        break;
                    }
                };
                let request = match Envelope::from_frame(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(error = %e, frame_len = frame.len(), "Skipping malformed request");
                        continue;
                    }
                };
                let permit = Arc::clone(&limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| io::Error::other(e.to_string()))?;
                let handler = Arc::clone(&handler);
                let writer = Arc::clone(&writer);
                in_flight.spawn(async move {
                    let _permit = permit;
                    respond(handler, request, writer).await;
                });
            }

            Some(joined) = in_flight.join_next() => log_join(joined),
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    tracing::info!("Worker exiting");
    Ok(())
}

async fn respond<H, W>(handler: Arc<H>, request: Envelope, writer: Arc<Mutex<FramedWrite<W, FrameEncoder>>>)
where
    H: RequestHandler,
    W: AsyncWrite + Unpin,
{
    let id = request.id().clone();
    tracing::trace!(%id, "Handling request");

    let mut builder = EnvelopeBuilder::new(id.clone());
    handler.handle(request, &mut builder).await;
    let response = match builder.finish() {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(%id, error = %e, "Handler built an invalid response");
            Envelope::error_reply(id.clone(), e.to_wire())
        }
    };

    let mut w = writer.lock().await;
    if let Err(e) = w.send(response).await {
        tracing::error!(%id, error = %e, "Failed to write response");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Request task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    struct Echo;

    #[async_trait::async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Envelope, response: &mut EnvelopeBuilder) {
            if let Some(ms) = request.query_field("sleep_ms").and_then(|v| v.as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if request.query_field("bad").is_some() {
                response.set_query_field("", true);
            }
            response.set_payload(request.data().unwrap_or_default());
        }
    }

    fn request(id: &str, data: &str, sleep_ms: Option<u64>) -> Envelope {
        let mut builder = EnvelopeBuilder::new(id.into());
        builder.set_payload(data);
        if let Some(ms) = sleep_ms {
            builder.set_query_field("sleep_ms", ms);
        }
        builder.finish().unwrap()
    }

    #[tokio::test]
    async fn handshake_then_responses_in_completion_order() {
        let (mut to_worker, worker_in) = duplex(4096);
        let (worker_out, mut from_worker) = duplex(4096);
        let server = tokio::spawn(serve(Arc::new(Echo), WorkerConfig::default(), worker_in, worker_out));

        let mut token = vec![0u8; PROCESS_ALIVE.len()];
        from_worker.read_exact(&mut token).await.unwrap();
        assert_eq!(token, PROCESS_ALIVE.as_bytes());

        let mut encoder = FramedWrite::new(&mut to_worker, FrameEncoder);
        encoder.send(request("a", "slow", Some(100))).await.unwrap();
        encoder.send(request("b", "fast", None)).await.unwrap();
        drop(encoder);

        let mut responses = FramedRead::new(from_worker, FrameReader::new());
        let first = Envelope::from_frame(&responses.next().await.unwrap().unwrap()).unwrap();
        let second = Envelope::from_frame(&responses.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id().as_str(), "b");
        assert_eq!(first.data(), Some("fast"));
        assert_eq!(second.id().as_str(), "a");
        assert_eq!(second.data(), Some("slow"));

        drop(to_worker);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_is_skipped() {
        let (mut to_worker, worker_in) = duplex(4096);
        let (worker_out, from_worker) = duplex(4096);
        let server = tokio::spawn(serve(Arc::new(Echo), WorkerConfig::default(), worker_in, worker_out));

        to_worker.write_all(b"not json\n#msg-end").await.unwrap();
        let mut encoder = FramedWrite::new(&mut to_worker, FrameEncoder);
        encoder.send(request("ok", "still here", None)).await.unwrap();
        drop(encoder);
        drop(to_worker);

        let mut bytes = Vec::new();
        let mut from_worker = from_worker;
        from_worker.read_to_end(&mut bytes).await.unwrap();
        server.await.unwrap().unwrap();

        let text = String::from_utf8(bytes).unwrap();
        let body = text.strip_prefix(PROCESS_ALIVE).unwrap();
        let mut frames = Vec::new();
        FrameReader::new().read(body, |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(Envelope::from_frame(&frames[0]).unwrap().data(), Some("still here"));
    }

    #[tokio::test]
    async fn invalid_response_becomes_error_reply() {
        let (mut to_worker, worker_in) = duplex(4096);
        let (worker_out, from_worker) = duplex(4096);
        let server = tokio::spawn(serve(Arc::new(Echo), WorkerConfig::default(), worker_in, worker_out));

        let mut builder = EnvelopeBuilder::new("x".into());
        builder.set_query_field("bad", true);
        let mut encoder = FramedWrite::new(&mut to_worker, FrameEncoder);
        encoder.send(builder.finish().unwrap()).await.unwrap();
        drop(encoder);
        drop(to_worker);

        let mut bytes = Vec::new();
        let mut from_worker = from_worker;
        from_worker.read_to_end(&mut bytes).await.unwrap();
        server.await.unwrap().unwrap();

        let mut frames = Vec::new();
        FrameReader::new().read(&bytes[PROCESS_ALIVE.len()..], |f| frames.push(f));
        let reply = Envelope::from_frame(&frames[0]).unwrap();
        assert_eq!(reply.id().as_str(), "x");
        assert_eq!(reply.error().unwrap()["code"], "invalid_request");
    }
}
