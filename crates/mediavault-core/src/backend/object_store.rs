use super::{EntryIter, FileEntry, StagedFile, StorageBackend};
use crate::error::{Error, RemoteErrorKind, Result};
use crate::scanner::walk::TEMP_MARKER;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub modified: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub next_token: Option<String>,
}

/// Minimal object-store API. Every call carries its own timeout; a call that
/// cannot finish within it fails with `RemoteErrorKind::Timeout`.
pub trait ObjectClient: Send + Sync {
    fn list(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ListPage>;

    fn head(&self, bucket: &str, key: &str, timeout: Duration) -> Result<Option<ObjectMeta>>;

    fn get(&self, bucket: &str, key: &str, timeout: Duration) -> Result<Box<dyn Read + Send>>;

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        modified: i64,
        timeout: Duration,
    ) -> Result<()>;

    /// Server-side copy to `to`, then delete `from`.
    fn rename(&self, bucket: &str, from: &str, to: &str, timeout: Duration) -> Result<()>;

    fn delete(&self, bucket: &str, key: &str, timeout: Duration) -> Result<()>;
}

/// A bucket (plus optional key prefix) as a storage location.
pub struct ObjectStoreBackend {
    bucket: String,
    prefix: String,
    client: Arc<dyn ObjectClient>,
    timeout: Duration,
}

impl ObjectStoreBackend {
    /// `root` is `bucket` or `bucket/prefix`.
    pub fn new(root: &str, client: Arc<dyn ObjectClient>, timeout: Duration) -> Self {
        let root = root.trim_matches('/');
        let (bucket, prefix) = match root.split_once('/') {
            Some((bucket, prefix)) => (bucket.to_string(), format!("{}/", prefix.trim_matches('/'))),
            None => (root.to_string(), String::new()),
        };
        Self {
            bucket,
            prefix,
            client,
            timeout,
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn relative<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str()).filter(|rel| !rel.is_empty())
    }
}

/// Lazily walks the listing one page at a time.
struct Pages<'a> {
    backend: &'a ObjectStoreBackend,
    buffer: VecDeque<ObjectMeta>,
    token: Option<String>,
    done: bool,
}

impl Iterator for Pages<'_> {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(object) = self.buffer.pop_front() {
                let Some(rel) = self.backend.relative(&object.key) else {
                    continue;
                };
                if object.size == 0 || object.key.ends_with('/') {
                    continue;
                }
                return Some(Ok(FileEntry {
                    path: rel.to_string(),
                    size: object.size,
                    mtime: object.modified,
                }));
            }
            if self.done {
                return None;
            }
            match self.backend.client.list(
                &self.backend.bucket,
                &self.backend.prefix,
                self.token.as_deref(),
                self.backend.timeout,
            ) {
                Ok(page) => {
                    self.buffer.extend(page.objects);
                    self.token = page.next_token;
                    self.done = self.token.is_none();
                }
                Err(e) => {
                    // Without the continuation token the listing cannot resume.
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl StorageBackend for ObjectStoreBackend {
    fn scan(&self) -> Result<EntryIter<'_>> {
        Ok(Box::new(Pages {
            backend: self,
            buffer: VecDeque::new(),
            token: None,
            done: false,
        }))
    }

    fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        Ok(self
            .client
            .head(&self.bucket, &self.key(path), self.timeout)?
            .map(|meta| FileEntry {
                path: path.to_string(),
                size: meta.size,
                mtime: meta.modified,
            }))
    }

    fn transfer_out(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.client.get(&self.bucket, &self.key(path), self.timeout)
    }

    fn transfer_in(&self, path: &str, reader: &mut dyn Read, mtime: i64) -> Result<StagedFile> {
        let staged = StagedFile {
            temp_path: format!(
                "{}{}{}",
                path,
                TEMP_MARKER,
                STAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            final_path: path.to_string(),
        };
        self.client.put(
            &self.bucket,
            &self.key(&staged.temp_path),
            reader,
            mtime,
            self.timeout,
        )?;
        debug!("Staged s3://{}/{}", self.bucket, self.key(&staged.temp_path));
        Ok(staged)
    }

    fn promote(&self, staged: &StagedFile) -> Result<()> {
        self.client.rename(
            &self.bucket,
            &self.key(&staged.temp_path),
            &self.key(&staged.final_path),
            self.timeout,
        )
    }

    fn discard(&self, staged: &StagedFile) -> Result<()> {
        match self
            .client
            .delete(&self.bucket, &self.key(&staged.temp_path), self.timeout)
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        match self.client.delete(&self.bucket, &self.key(path), self.timeout) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: i64,
}

/// In-process object store with paging, simulated latency and fault
/// injection. Used for tests and for wiring object-store locations before a
/// real client is plugged in.
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    faults: Mutex<VecDeque<RemoteErrorKind>>,
    rewrites: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    page_size: usize,
    latency: Duration,
    calls: AtomicU64,
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(VecDeque::new()),
            rewrites: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every call takes this long; calls whose timeout is shorter fail.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call (of any kind) fail with `kind`. Queued faults are
    /// consumed in order.
    pub fn fail_next(&self, kind: RemoteErrorKind) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(kind);
    }

    /// Replace an object's bytes just before its next `get`, as a writer
    /// racing a reader would. Listings taken earlier keep the old size.
    pub fn rewrite_on_next_get(&self, bucket: &str, key: &str, data: &[u8]) {
        self.rewrites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8], modified: i64) {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn contents(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn enter(&self, op: &str, key: &str, timeout: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(kind) = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(Error::remote(kind, format!("{} {}: injected fault", op, key)));
        }
        if self.latency > timeout {
            return Err(Error::remote(
                RemoteErrorKind::Timeout,
                format!("{} {}: no response within {:?}", op, key, timeout),
            ));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(())
    }

    fn not_found(op: &str, key: &str) -> Error {
        Error::remote(RemoteErrorKind::NotFound, format!("{} {}: no such key", op, key))
    }
}

impl ObjectClient for MemoryObjectClient {
    fn list(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ListPage> {
        self.enter("list", prefix, timeout)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut page: Vec<ObjectMeta> = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| token.map_or(true, |t| k.as_str() > t))
            .take(self.page_size + 1)
            .map(|((_, k), o)| ObjectMeta {
                key: k.clone(),
                size: o.data.len() as u64,
                modified: o.modified,
            })
            .collect();
        let next_token = if page.len() > self.page_size {
            page.truncate(self.page_size);
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            objects: page,
            next_token,
        })
    }

    fn head(&self, bucket: &str, key: &str, timeout: Duration) -> Result<Option<ObjectMeta>> {
        self.enter("head", key, timeout)?;
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| ObjectMeta {
                key: key.to_string(),
                size: o.data.len() as u64,
                modified: o.modified,
            }))
    }

    fn get(&self, bucket: &str, key: &str, timeout: Duration) -> Result<Box<dyn Read + Send>> {
        self.enter("get", key, timeout)?;
        let rewrite = self
            .rewrites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(bucket.to_string(), key.to_string()));
        if let Some(data) = rewrite {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(object) = objects.get_mut(&(bucket.to_string(), key.to_string())) {
                object.data = data;
            }
        }
        let data = self
            .contents(bucket, key)
            .ok_or_else(|| Self::not_found("get", key))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        modified: i64,
        timeout: Duration,
    ) -> Result<()> {
        self.enter("put", key, timeout)?;
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        self.insert(bucket, key, &data, modified);
        Ok(())
    }

    fn rename(&self, bucket: &str, from: &str, to: &str, timeout: Duration) -> Result<()> {
        self.enter("rename", from, timeout)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let object = objects
            .remove(&(bucket.to_string(), from.to_string()))
            .ok_or_else(|| Self::not_found("rename", from))?;
        objects.insert((bucket.to_string(), to.to_string()), object);
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str, timeout: Duration) -> Result<()> {
        self.enter("delete", key, timeout)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found("delete", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(client: Arc<MemoryObjectClient>) -> ObjectStoreBackend {
        ObjectStoreBackend::new("media/archive", client, Duration::from_secs(5))
    }

    #[test]
    fn test_scan_pages_through_listing() {
        let client = Arc::new(MemoryObjectClient::new().with_page_size(2));
        for i in 0..5 {
            client.insert("media", &format!("archive/{}.jpg", i), b"img", 100 + i);
        }
        client.insert("media", "other/skip.jpg", b"img", 1);

        let backend = backend(Arc::clone(&client));
        let paths: Vec<String> = backend.scan().unwrap().map(|e| e.unwrap().path).collect();
        assert_eq!(paths, vec!["0.jpg", "1.jpg", "2.jpg", "3.jpg", "4.jpg"]);
    }

    #[test]
    fn test_listing_failure_ends_scan_with_error() {
        let client = Arc::new(MemoryObjectClient::new().with_page_size(1));
        client.insert("media", "archive/a.jpg", b"a", 1);
        client.insert("media", "archive/b.jpg", b"b", 1);
        let backend = backend(Arc::clone(&client));

        let mut entries = backend.scan().unwrap();
        assert!(entries.next().unwrap().is_ok());
        client.fail_next(RemoteErrorKind::Transient);
        assert!(entries.next().unwrap().unwrap_err().is_transient());
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_call_timeout() {
        let client = Arc::new(MemoryObjectClient::new().with_latency(Duration::from_millis(50)));
        client.insert("media", "archive/a.jpg", b"a", 1);
        let backend =
            ObjectStoreBackend::new("media/archive", client, Duration::from_millis(10));
        let err = backend.stat("a.jpg").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_stage_then_promote() {
        let client = Arc::new(MemoryObjectClient::new());
        let backend = backend(Arc::clone(&client));
        let mut body: &[u8] = b"bytes";
        let staged = backend.transfer_in("x/y.png", &mut body, 42).unwrap();
        assert!(backend.stat("x/y.png").unwrap().is_none());
        backend.promote(&staged).unwrap();
        assert_eq!(client.contents("media", "archive/x/y.png").unwrap(), b"bytes");
        assert_eq!(backend.stat("x/y.png").unwrap().unwrap().mtime, 42);
    }
}
