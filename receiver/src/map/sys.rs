//! Thin `bpf(2)` wrappers for map access by descriptor.
//!
//! The typed maps of the eBPF library cannot iterate a hash-of-maps or open an
//! inner map by id, so the metrics path talks to the kernel directly.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

const BPF_MAP_LOOKUP_ELEM: u32 = 1;
const BPF_MAP_UPDATE_ELEM: u32 = 2;
const BPF_MAP_GET_NEXT_KEY: u32 = 4;
const BPF_MAP_GET_FD_BY_ID: u32 = 14;
const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;

/// Update only keys that already exist
pub const BPF_EXIST: u64 = 2;

pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_ARRAY: u32 = 2;
pub const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;
pub const BPF_MAP_TYPE_LRU_HASH: u32 = 9;
pub const BPF_MAP_TYPE_HASH_OF_MAPS: u32 = 13;
pub const BPF_MAP_TYPE_RINGBUF: u32 = 27;

const BPF_OBJ_NAME_LEN: usize = 16;

#[repr(C)]
struct BpfAttrMapElem {
    map_fd: u32,
    _pad: u32,
    key: u64,
    // value for lookup/update, next_key for get_next_key
    value: u64,
    flags: u64,
}

#[repr(C)]
struct BpfAttrGetFdById {
    id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
struct BpfAttrObjGetInfoByFd {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
#[derive(Default)]
pub(crate) struct BpfMapInfo {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    _map_flags: u32,
    pub name: [u8; BPF_OBJ_NAME_LEN],
    _ifindex: u32,
    _btf_vmlinux_value_type_id: u32,
    _netns_dev: u64,
    _netns_ino: u64,
    _btf_id: u32,
    _btf_key_type_id: u32,
    _btf_value_type_id: u32,
    _btf_vmlinux_id: u32,
    _map_extra: u64,
}

fn bpf_syscall<T>(cmd: u32, attr: &mut T) -> io::Result<libc::c_long> {
    // SAFETY: attr is a live, properly sized bpf_attr variant for `cmd`.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            libc::c_long::from(cmd),
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

pub(crate) fn map_info(fd: BorrowedFd<'_>) -> io::Result<BpfMapInfo> {
    let mut info = BpfMapInfo::default();
    let mut attr = BpfAttrObjGetInfoByFd {
        bpf_fd: fd.as_raw_fd() as u32,
        info_len: mem::size_of::<BpfMapInfo>() as u32,
        info: &mut info as *mut BpfMapInfo as u64,
    };
    bpf_syscall(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    Ok(info)
}

pub(crate) fn map_fd_by_id(id: u32) -> io::Result<OwnedFd> {
    let mut attr = BpfAttrGetFdById {
        id,
        next_id: 0,
        open_flags: 0,
    };
    let fd = bpf_syscall(BPF_MAP_GET_FD_BY_ID, &mut attr)?;
    // SAFETY: on success the kernel returns a new descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// Write the key following `key` into `next`. `Ok(false)` means the end of
/// the map was reached.
pub(crate) fn map_next_key(
    fd: BorrowedFd<'_>,
    key: Option<&[u8]>,
    next: &mut [u8],
) -> io::Result<bool> {
    let mut attr = BpfAttrMapElem {
        map_fd: fd.as_raw_fd() as u32,
        _pad: 0,
        key: key.map_or(0, |k| k.as_ptr() as u64),
        value: next.as_mut_ptr() as u64,
        flags: 0,
    };
    match bpf_syscall(BPF_MAP_GET_NEXT_KEY, &mut attr) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the value stored at `key`. `Ok(false)` means the key is gone.
pub(crate) fn map_lookup(fd: BorrowedFd<'_>, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
    let mut attr = BpfAttrMapElem {
        map_fd: fd.as_raw_fd() as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_mut_ptr() as u64,
        flags: 0,
    };
    match bpf_syscall(BPF_MAP_LOOKUP_ELEM, &mut attr) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn map_update(
    fd: BorrowedFd<'_>,
    key: &[u8],
    value: &[u8],
    flags: u64,
) -> io::Result<()> {
    let mut attr = BpfAttrMapElem {
        map_fd: fd.as_raw_fd() as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_ptr() as u64,
        flags,
    };
    bpf_syscall(BPF_MAP_UPDATE_ELEM, &mut attr)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layouts_match_kernel() {
        assert_eq!(mem::size_of::<BpfAttrMapElem>(), 32);
        assert_eq!(mem::size_of::<BpfAttrObjGetInfoByFd>(), 16);
        assert_eq!(mem::size_of::<BpfMapInfo>(), 88);
    }

    #[test]
    fn test_info_on_regular_file_fails() {
        let file = tempfile::tempfile().unwrap();
        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) };
        assert!(map_info(fd).is_err());
    }
}
