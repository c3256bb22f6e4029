//! SysV shared-memory segment wrappers
//!
//! The consumer creates and ultimately removes segments (`OwnedSegment`); the
//! grabber only attaches and detaches (`AttachedSegment`). Segment ids are
//! plain decimal integers so they can be handed to the injected grabber
//! through an environment variable.

use std::ptr;
use vidtap_core::{Error, Result};

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Byte length of a segment as reported by the kernel
fn segment_size(id: i32) -> Result<usize> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } < 0 {
        return Err(Error::Shm(format!(
            "shmctl(IPC_STAT) failed for id {}: {}",
            id,
            last_os_error()
        )));
    }
    Ok(ds.shm_segsz as usize)
}

/// A segment this process created and is responsible for removing
pub struct OwnedSegment {
    id: i32,
    addr: *mut libc::c_void,
    size: usize,
}

// Safety: the mapping is valid for the lifetime of the struct; concurrent
// access is coordinated through the ring protocol.
unsafe impl Send for OwnedSegment {}

impl OwnedSegment {
    /// Create and attach a new private segment of exactly `size` bytes
    ///
    /// Fresh SysV segments are zero-filled by the kernel.
    pub fn create(size: usize) -> Result<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o700) };
        if id < 0 {
            return Err(Error::Shm(format!("shmget failed: {}", last_os_error())));
        }

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr == libc::MAP_FAILED {
            let err = last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(Error::Shm(format!("shmat failed for id {}: {}", id, err)));
        }

        Ok(Self { id, addr, size })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// View the payload as a byte slice
    ///
    /// # Safety
    /// The caller must hold the slot per the ring protocol; the other process
    /// must not be writing the same bytes.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.addr as *const u8, self.size)
    }
}

impl Drop for OwnedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
        }
    }
}

/// A segment created elsewhere that this process attached by id
pub struct AttachedSegment {
    id: i32,
    addr: *mut libc::c_void,
    size: usize,
}

unsafe impl Send for AttachedSegment {}

impl AttachedSegment {
    /// Attach an existing segment read-write
    pub fn attach(id: i32) -> Result<Self> {
        let addr = unsafe { libc::shmat(id, ptr::null(), libc::SHM_RND) };
        if addr == libc::MAP_FAILED {
            return Err(Error::Shm(format!(
                "can't attach to shared memory id {}: {}",
                id,
                last_os_error()
            )));
        }
        let size = segment_size(id)?;
        Ok(Self { id, addr, size })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// View the payload as a mutable byte slice
    ///
    /// # Safety
    /// The caller must hold the slot per the ring protocol; the other process
    /// must not be accessing the same bytes.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.addr as *mut u8, self.size)
    }
}

impl Drop for AttachedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_roundtrip() {
        let owned = OwnedSegment::create(4096).unwrap();
        assert_eq!(owned.size(), 4096);

        let attached = AttachedSegment::attach(owned.id()).unwrap();
        assert_eq!(attached.size(), 4096);

        unsafe {
            attached.as_mut_slice()[0] = 0xAB;
            attached.as_mut_slice()[4095] = 0xCD;
        }
        let view = unsafe { owned.as_slice() };
        assert_eq!(view[0], 0xAB);
        assert_eq!(view[4095], 0xCD);
    }

    #[test]
    fn fresh_segment_is_zeroed() {
        let owned = OwnedSegment::create(1024).unwrap();
        assert!(unsafe { owned.as_slice() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn attach_to_bogus_id_fails() {
        assert!(AttachedSegment::attach(-2).is_err());
    }
}
