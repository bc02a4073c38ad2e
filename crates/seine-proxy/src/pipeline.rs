//! The one-way capture path: sanitize, buffer, fan out, persist.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use seine::{sanitize, LogRecord, LogRing, SessionMeta, SessionStore};

/// One session-store operation, queued in arrival order.
enum SessionOp {
  Append(LogRecord),
  Start {
    name: Option<String>,
    route_key: Option<String>,
    reply: oneshot::Sender<seine::Result<SessionMeta>>,
  },
  Stop {
    reply: oneshot::Sender<seine::Result<Option<SessionMeta>>>,
  },
}

/// Glue between the proxy servers and the capture core.
///
/// Publishing never blocks on disk: records are handed to a single writer
/// task over an unbounded queue. Session `start` and `stop` travel through
/// the same queue, so all three operations hit the store strictly in
/// arrival order — a record published while session A is current can never
/// land in a session started afterwards. Append failures are logged and
/// never affect the exchange or the live subscribers.
#[derive(Clone)]
pub struct CapturePipeline {
  ring: LogRing,
  store: Arc<SessionStore>,
  ops: mpsc::UnboundedSender<SessionOp>,
}

impl CapturePipeline {
  /// Spawns the detached session-writer task; call inside a runtime.
  pub fn new(ring: LogRing, store: Arc<SessionStore>) -> CapturePipeline {
    let (ops, mut rx) = mpsc::unbounded_channel::<SessionOp>();
    let writer_store = store.clone();
    tokio::spawn(async move {
      while let Some(op) = rx.recv().await {
        match op {
          SessionOp::Append(record) => {
            if let Err(err) = writer_store.append(&record).await {
              tracing::error!("session append failed for {}: {}", record.id, err);
            }
          }
          SessionOp::Start {
            name,
            route_key,
            reply,
          } => {
            reply.send(writer_store.start(name, route_key).await).ok();
          }
          SessionOp::Stop { reply } => {
            reply.send(writer_store.stop().await).ok();
          }
        }
      }
    });
    CapturePipeline { ring, store, ops }
  }

  pub fn ring(&self) -> &LogRing {
    &self.ring
  }

  pub fn store(&self) -> &Arc<SessionStore> {
    &self.store
  }

  /// Sanitize and publish a finished record: ring + subscribers first,
  /// then the detached best-effort session append.
  pub fn publish(&self, record: LogRecord) {
    let clean = sanitize(&record);
    self.ring.push(clean.clone());
    self.ops.send(SessionOp::Append(clean)).ok();
  }

  /// Start a session, ordered behind every record already published.
  pub async fn start_session(
    &self,
    name: Option<String>,
    route_key: Option<String>,
  ) -> seine::Result<SessionMeta> {
    let (reply, rx) = oneshot::channel();
    self
      .ops
      .send(SessionOp::Start {
        name,
        route_key,
        reply,
      })
      .map_err(|_| writer_gone())?;
    rx.await.map_err(|_| writer_gone())?
  }

  /// Stop the current session, ordered behind every record already
  /// published into it.
  pub async fn stop_session(&self) -> seine::Result<Option<SessionMeta>> {
    let (reply, rx) = oneshot::channel();
    self
      .ops
      .send(SessionOp::Stop { reply })
      .map_err(|_| writer_gone())?;
    rx.await.map_err(|_| writer_gone())?
  }
}

fn writer_gone() -> seine::Error {
  seine::Error::Other("session writer task is gone".to_string())
}
