//! In-memory fakes so `tci-dispatch`/`tci-publish`/`tci-stream` ordering and
//! poison-pill behavior can be scenario-tested without a live Kafka broker.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tci_bus::{BusProducer, BusPublishError};
use tci_schemas::AckHandle;
use tci_stream::{StreamMessage, StreamTransport};

pub const ENV_DB_URL: &str = "TCI_DATABASE_URL";

/// Connect using `TCI_DATABASE_URL` and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;
    let pool = tci_db::connect(&url).await?;
    tci_db::migrate(&pool).await?;
    Ok(pool)
}

/// Channel-backed fake source stream. Messages are pre-loaded with
/// `push`; `recv` returns them in FIFO order, assigning sequential offsets.
/// `store_offset`/`pause`/`resume` just record calls for assertions.
pub struct FakeStreamTransport {
    inner: Mutex<FakeStreamInner>,
}

struct FakeStreamInner {
    queue: VecDeque<Vec<u8>>,
    next_offset: i64,
    stored_offsets: Vec<AckHandle>,
    paused: bool,
    pause_calls: u32,
    resume_calls: u32,
}

impl Default for FakeStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStreamTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeStreamInner {
                queue: VecDeque::new(),
                next_offset: 0,
                stored_offsets: Vec::new(),
                paused: false,
                pause_calls: 0,
                resume_calls: 0,
            }),
        }
    }

    pub fn push(&self, raw_bytes: Vec<u8>) {
        self.inner.lock().expect("fake stream mutex poisoned").queue.push_back(raw_bytes);
    }

    pub fn stored_offsets(&self) -> Vec<AckHandle> {
        self.inner.lock().expect("fake stream mutex poisoned").stored_offsets.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("fake stream mutex poisoned").paused
    }

    pub fn pause_calls(&self) -> u32 {
        self.inner.lock().expect("fake stream mutex poisoned").pause_calls
    }
}

#[async_trait]
impl StreamTransport for FakeStreamTransport {
    async fn recv(&self) -> Result<StreamMessage> {
        loop {
            {
                let mut inner = self.inner.lock().expect("fake stream mutex poisoned");
                if let Some(raw_bytes) = inner.queue.pop_front() {
                    let offset = inner.next_offset;
                    inner.next_offset += 1;
                    return Ok(StreamMessage {
                        raw_bytes,
                        offset,
                        ack_handle: AckHandle { partition: 0, offset },
                    });
                }
            }
            // Queue empty: a real test drives `push` from another task, so
            // yield rather than busy-spin.
            tokio::task::yield_now().await;
        }
    }

    fn store_offset(&self, handle: AckHandle) -> Result<()> {
        self.inner.lock().expect("fake stream mutex poisoned").stored_offsets.push(handle);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("fake stream mutex poisoned");
        inner.paused = true;
        inner.pause_calls += 1;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("fake stream mutex poisoned");
        inner.paused = false;
        inner.resume_calls += 1;
        Ok(())
    }
}

/// Scripted outcome for the Nth call to [`FakeBusProducer::publish`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    PoisonPill(String),
    SystemFailureTimeout,
}

/// Channel-backed fake downstream bus. Records every publish attempt in
/// order (for asserting per-portfolio ordering) and plays back a scripted
/// sequence of outcomes, defaulting to `Succeed` once the script is
/// exhausted.
pub struct FakeBusProducer {
    state: Mutex<FakeBusState>,
}

struct FakeBusState {
    published: Vec<(String, Vec<u8>)>,
    script: VecDeque<ScriptedOutcome>,
}

impl Default for FakeBusProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBusProducer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeBusState {
                published: Vec::new(),
                script: VecDeque::new(),
            }),
        }
    }

    pub fn with_script(script: Vec<ScriptedOutcome>) -> Self {
        Self {
            state: Mutex::new(FakeBusState {
                published: Vec::new(),
                script: script.into(),
            }),
        }
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().expect("fake bus mutex poisoned").published.clone()
    }
}

impl BusProducer for FakeBusProducer {
    fn publish(
        &self,
        partition_key: &str,
        payload: &[u8],
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusPublishError>> + Send + '_>> {
        let mut state = self.state.lock().expect("fake bus mutex poisoned");
        state.published.push((partition_key.to_string(), payload.to_vec()));
        let outcome = state.script.pop_front().unwrap_or(ScriptedOutcome::Succeed);
        drop(state);

        Box::pin(async move {
            match outcome {
                ScriptedOutcome::Succeed => Ok(()),
                ScriptedOutcome::PoisonPill(reason) => Err(BusPublishError::SchemaIncompatible(reason)),
                ScriptedOutcome::SystemFailureTimeout => Err(BusPublishError::Timeout),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_stream_assigns_sequential_offsets() {
        let stream = FakeStreamTransport::new();
        stream.push(b"a".to_vec());
        stream.push(b"b".to_vec());

        let m1 = stream.recv().await.unwrap();
        let m2 = stream.recv().await.unwrap();
        assert_eq!(m1.offset, 0);
        assert_eq!(m2.offset, 1);
    }

    #[tokio::test]
    async fn fake_bus_plays_back_script_then_defaults_to_success() {
        let producer = FakeBusProducer::with_script(vec![ScriptedOutcome::SystemFailureTimeout]);
        let first = producer.publish("p1", b"x", Duration::from_secs(1)).await;
        assert!(matches!(first, Err(BusPublishError::Timeout)));

        let second = producer.publish("p1", b"y", Duration::from_secs(1)).await;
        assert!(second.is_ok());

        assert_eq!(producer.published().len(), 2);
    }
}
