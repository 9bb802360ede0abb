use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::{debug, warn};

use super::sys;
use super::view::{MapEntry, MapView};
use crate::error::ReceiverError;
use crate::manager::ManagedHandle;

/// Map kinds the receiver distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    PerfEventArray,
    RingBuf,
    Hash,
    Array,
    HashOfMaps,
    Other(u32),
}

impl MapKind {
    pub fn from_type(map_type: u32) -> Self {
        match map_type {
            sys::BPF_MAP_TYPE_PERF_EVENT_ARRAY => MapKind::PerfEventArray,
            sys::BPF_MAP_TYPE_RINGBUF => MapKind::RingBuf,
            sys::BPF_MAP_TYPE_HASH | sys::BPF_MAP_TYPE_LRU_HASH => MapKind::Hash,
            sys::BPF_MAP_TYPE_ARRAY => MapKind::Array,
            sys::BPF_MAP_TYPE_HASH_OF_MAPS => MapKind::HashOfMaps,
            other => MapKind::Other(other),
        }
    }
}

/// Kernel metadata of a map, from `BPF_OBJ_GET_INFO_BY_FD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub name: String,
}

impl MapInfo {
    pub fn kind(&self) -> MapKind {
        MapKind::from_type(self.map_type)
    }
}

impl From<sys::BpfMapInfo> for MapInfo {
    fn from(raw: sys::BpfMapInfo) -> Self {
        let end = raw.name.iter().position(|b| *b == 0).unwrap_or(raw.name.len());
        Self {
            map_type: raw.map_type,
            id: raw.id,
            key_size: raw.key_size,
            value_size: raw.value_size,
            max_entries: raw.max_entries,
            name: String::from_utf8_lossy(&raw.name[..end]).into_owned(),
        }
    }
}

/// Exclusive owner of one map descriptor
pub struct MapHandle {
    fd: OwnedFd,
    info: MapInfo,
}

impl MapHandle {
    /// Take ownership of `fd`, which must refer to a bpf map.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let info = sys::map_info(fd.as_fd())?.into();
        Ok(Self { fd, info })
    }

    /// Open a map by its kernel id, as stored in a hash-of-maps.
    pub fn from_id(id: u32) -> io::Result<Self> {
        Self::from_fd(sys::map_fd_by_id(id)?)
    }

    pub fn info(&self) -> &MapInfo {
        &self.info
    }

    pub fn kind(&self) -> MapKind {
        self.info.kind()
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// Duplicate the descriptor, e.g. to hand it to a reader that wants
    /// ownership while the handle stays with the manager.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsFd for MapHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapHandle")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("kind", &self.kind())
            .finish()
    }
}

impl MapView for MapHandle {
    fn key_size(&self) -> usize {
        self.info.key_size as usize
    }

    fn value_size(&self) -> usize {
        self.info.value_size as usize
    }

    fn entries(&self) -> io::Result<Vec<MapEntry>> {
        let mut entries = Vec::new();
        let mut prev: Option<Vec<u8>> = None;
        // a key deleted mid-walk restarts iteration from the first key
        let limit = (self.info.max_entries as usize).saturating_mul(2).max(1);

        for _ in 0..limit {
            let mut key = vec![0u8; self.key_size()];
            if !sys::map_next_key(self.fd.as_fd(), prev.as_deref(), &mut key)? {
                return Ok(entries);
            }
            let mut value = vec![0u8; self.value_size()];
            if sys::map_lookup(self.fd.as_fd(), &key, &mut value)? {
                entries.push((key.clone(), value));
            }
            prev = Some(key);
        }

        warn!(
            "Iteration of map {} stopped after {} steps",
            self.info.name, limit
        );
        Ok(entries)
    }

    fn update_existing(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        sys::map_update(self.fd.as_fd(), key, value, sys::BPF_EXIST)
    }
}

impl ManagedHandle for MapHandle {
    fn from_transferred(mut fds: Vec<OwnedFd>) -> Result<Self, ReceiverError> {
        if fds.len() != 1 {
            return Err(ReceiverError::InvalidHandle(format!(
                "expected one buffer map descriptor, got {}",
                fds.len()
            )));
        }
        let fd = fds.remove(0);
        let handle = MapHandle::from_fd(fd)?;
        match handle.kind() {
            MapKind::PerfEventArray | MapKind::RingBuf => Ok(handle),
            other => Err(ReceiverError::InvalidHandle(format!(
                "map {} is {:?}, not a buffer map",
                handle.info.name, other
            ))),
        }
    }

    fn identity(&self) -> Vec<u32> {
        vec![self.info.id]
    }

    fn close(self) {
        debug!("Closing map {} (id {})", self.info.name, self.info.id);
    }
}

/// The two maps behind a metrics request
#[derive(Debug)]
pub struct MetricsHandles {
    /// UUID to packed resource attributes
    pub attributes: MapHandle,
    /// Hash-of-maps from UUID to the per-process metrics map
    pub index: MapHandle,
}

impl MetricsHandles {
    /// Sort the received maps by kernel type. Order on the wire is not
    /// significant.
    pub fn classify(handles: Vec<MapHandle>) -> Result<Self, ReceiverError> {
        if handles.len() != 2 {
            return Err(ReceiverError::InvalidHandle(format!(
                "expected two metrics map descriptors, got {}",
                handles.len()
            )));
        }

        let mut attributes = None;
        let mut index = None;
        for handle in handles {
            match handle.kind() {
                MapKind::Hash if attributes.is_none() => attributes = Some(handle),
                MapKind::HashOfMaps if index.is_none() => index = Some(handle),
                other => {
                    return Err(ReceiverError::InvalidHandle(format!(
                        "unexpected metrics map {} of kind {:?}",
                        handle.info.name, other
                    )))
                }
            }
        }

        match (attributes, index) {
            (Some(attributes), Some(index)) => Ok(Self { attributes, index }),
            _ => Err(ReceiverError::InvalidHandle(
                "metrics maps must be one hash and one hash-of-maps".to_string(),
            )),
        }
    }
}

impl ManagedHandle for MetricsHandles {
    fn from_transferred(fds: Vec<OwnedFd>) -> Result<Self, ReceiverError> {
        let handles = fds
            .into_iter()
            .map(MapHandle::from_fd)
            .collect::<io::Result<Vec<_>>>()?;
        MetricsHandles::classify(handles)
    }

    fn identity(&self) -> Vec<u32> {
        vec![self.attributes.id(), self.index.id()]
    }

    fn close(self) {
        debug!(
            "Closing metrics maps {} and {}",
            self.attributes.info.name, self.index.info.name
        );
    }
}
