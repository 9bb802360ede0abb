use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

/// One key/value pair copied out of a map
pub type MapEntry = (Vec<u8>, Vec<u8>);

/// Snapshot iteration and in-place update of a fixed-width key/value map
pub trait MapView: Send + Sync {
    fn key_size(&self) -> usize;

    fn value_size(&self) -> usize;

    /// Copy every entry currently in the map. Entries deleted while iterating
    /// are skipped.
    fn entries(&self) -> io::Result<Vec<MapEntry>>;

    /// Overwrite the value of a key that must already exist.
    fn update_existing(&self, key: &[u8], value: &[u8]) -> io::Result<()>;
}

/// In-process map with the same contract as a kernel hash map
#[derive(Debug)]
pub struct MemoryMap {
    key_size: usize,
    value_size: usize,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMap {
    pub fn new(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert `value` under `key`, zero padding both to the map widths.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        let key = pad(key, self.key_size);
        let value = pad(value, self.value_size);
        self.lock().insert(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().get(&pad(key, self.key_size)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn pad(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(width, 0);
    out
}

impl MapView for MemoryMap {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn entries(&self) -> io::Result<Vec<MapEntry>> {
        Ok(self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn update_existing(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(slot) => {
                *slot = pad(value, self.value_size);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}
