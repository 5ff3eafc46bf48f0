use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use larder_storage::error::{StorageError, StorageResult};
use larder_storage::traits::{
    ByteStream, ObjectMeta, ObjectStream, StorageBackend, StreamingUpload,
};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Misbehaviour injected by [`FaultyBackend`].
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Streams stop after this many bytes.
    ShortRead(usize),
    /// Streams append an extra byte.
    LongRead,
    /// Every operation fails with a transient error.
    Unavailable,
}

/// Wraps a real backend, injecting faults and counting calls.
#[allow(dead_code)]
pub struct FaultyBackend {
    inner: Arc<dyn StorageBackend>,
    fault: Mutex<Fault>,
    pub head_calls: AtomicUsize,
    pub put_stream_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FaultyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault: Mutex::new(Fault::None),
            head_calls: AtomicUsize::new(0),
            put_stream_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    fn fault(&self) -> Fault {
        *self.fault.lock().unwrap()
    }

    fn check(&self) -> StorageResult<()> {
        if self.fault() == Fault::Unavailable {
            return Err(StorageError::Unavailable("injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        self.check()?;
        let data = self.inner.get(key).await?;
        let data = data.slice(offset as usize..);
        let data = match self.fault() {
            Fault::ShortRead(n) => data.slice(..n.min(data.len())),
            Fault::LongRead => {
                let mut longer = data.to_vec();
                longer.push(b'!');
                Bytes::from(longer)
            }
            _ => data,
        };
        let stream = futures::stream::once(async move { Ok(data) });
        Ok(stream.boxed())
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.check()?;
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.put_stream_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn list_stream(&self, prefix: &str) -> StorageResult<ObjectStream> {
        self.check()?;
        self.inner.list_stream(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
