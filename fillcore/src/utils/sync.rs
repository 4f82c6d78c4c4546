// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

// Shared handles passed between the engine, the scheduler and the flusher.
pub(crate) use std::sync::Arc;
pub(crate) use parking_lot::Mutex;

// A call to this function will compile only if T is Send + Sync.
#[cfg(test)]
pub fn is_sync_send<T: Send + Sync>() {}

#[test]
fn test_is_sync_send() {
  is_sync_send::<u32>();
  is_sync_send::<Mutex<u32>>();
  is_sync_send::<Arc<Mutex<u32>>>();
}
