//! Helper for virtual files that broadcast data to every fid currently
//! reading them, rather than serving a fixed stream of bytes from storage.
//!
//! A [`Filesystem`](crate::srv::Filesystem) implementor uses this for files
//! like a control or event log: `ropen` registers the fid with
//! [`Pending::pushfid`], `rread` awaits [`Pending::read`] for that fid, and
//! `write`/`print` from anywhere (another fid, a background task) queues
//! data for delivery to every registered reader. `freefid`/`rclunk` should
//! call [`Pending::clunk`] to drop the fid's queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

struct Reader {
    queue: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

/// Per-file broadcast state, shared by every fid open on that file.
#[derive(Default)]
pub struct Pending {
    readers: Mutex<HashMap<u32, Reader>>,
}

impl Pending {
    pub fn new() -> Self {
        Pending { readers: Mutex::new(HashMap::new()) }
    }

    /// Register `fid` as a pending reader. Call this from `ropen`/`rcreate`
    /// on the virtual file.
    pub async fn pushfid(&self, fid: u32) {
        self.readers
            .lock()
            .await
            .insert(fid, Reader { queue: VecDeque::new(), notify: Arc::new(Notify::new()) });
    }

    /// Queue `dat` for delivery to every currently registered fid, waking
    /// any reader blocked in [`read`](Self::read).
    pub async fn write(&self, dat: &[u8]) {
        let mut readers = self.readers.lock().await;
        for reader in readers.values_mut() {
            reader.queue.push_back(dat.to_vec());
            reader.notify.notify_waiters();
        }
    }

    /// Block until data is queued for `fid`, then return and consume it.
    /// Call this from `rread` on the virtual file. Returns an empty buffer
    /// if `fid` is not (or is no longer) registered.
    pub async fn read(&self, fid: u32) -> Vec<u8> {
        loop {
            // Grab the notify handle and register interest in it before
            // checking the queue, so a write() racing with this read() is
            // never missed between the check and the await below.
            let notify = match self.readers.lock().await.get(&fid) {
                Some(reader) => reader.notify.clone(),
                None => return Vec::new(),
            };
            let notified = notify.notified();

            {
                let mut readers = self.readers.lock().await;
                match readers.get_mut(&fid) {
                    Some(reader) => {
                        if let Some(front) = reader.queue.pop_front() {
                            return front;
                        }
                    }
                    None => return Vec::new(),
                }
            }

            notified.await;
        }
    }

    /// Drop `fid`'s queue. Call this from `rclunk`/`freefid` on the virtual
    /// file; returns `true` if other fids are still pending on this file.
    pub async fn clunk(&self, fid: u32) -> bool {
        let mut readers = self.readers.lock().await;
        readers.remove(&fid);
        !readers.is_empty()
    }
}
