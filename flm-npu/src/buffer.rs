//! Host and device memory.
//!
//! A [`Buffer<T>`] is a length-tagged region of memory with a fixed element
//! type. Storage is either a plain host allocation or a DMA-visible buffer
//! object mapped from the driver. Buffers move between threads by value;
//! nothing here is shared mutably.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::driver::{self, DeviceFd};
use crate::error::NpuError;
use crate::Result;

/// Device allocations are page-aligned.
const DMA_ALIGNMENT: usize = 4 * 1024;
/// Upper bound on a single device allocation.
const MAX_DEVICE_ALLOC: usize = 3 * 1024 * 1024 * 1024;
/// Upper bound on a single host allocation.
const MAX_HOST_ALLOC: usize = 8 * 1024 * 1024 * 1024;

/// A DMA-visible buffer object: created through the driver, mapped into the
/// process, unmapped and released on drop.
#[derive(Debug)]
pub struct DmaBuffer {
    fd: Arc<DeviceFd>,
    handle: u32,
    ptr: NonNull<u8>,
    len: usize,
    padded: usize,
    device_addr: u64,
}

// The mapping is private to this object and only reachable through &mut.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate and map `size` bytes of DMA-visible memory.
    pub fn alloc(fd: Arc<DeviceFd>, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_DEVICE_ALLOC {
            return Err(NpuError::SizeMismatch {
                expected: MAX_DEVICE_ALLOC,
                got: size,
            });
        }
        let padded = (size + DMA_ALIGNMENT - 1) / DMA_ALIGNMENT * DMA_ALIGNMENT;
        let handle = fd
            .create_bo(padded as u64, driver::BO_SHARE)
            .map_err(|source| NpuError::Driver { call: "create_bo", source })?;
        let (map_offset, device_addr) = match fd.bo_info(handle) {
            Ok(info) => info,
            Err(source) => {
                fd.close_bo(handle);
                return Err(NpuError::Driver { call: "get_bo_info", source });
            }
        };
        let ptr = match fd.map_bo(map_offset, padded) {
            Ok(ptr) => ptr,
            Err(source) => {
                fd.close_bo(handle);
                return Err(NpuError::Driver { call: "map_bo", source });
            }
        };
        Ok(Self {
            fd,
            handle,
            ptr,
            len: size,
            padded,
            device_addr,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn sync_to_device(&self) -> Result<()> {
        self.fd
            .sync_bo(self.handle, driver::SYNC_TO_DEVICE, self.padded as u64)
            .map_err(|source| NpuError::Driver { call: "sync_bo", source })
    }

    pub fn sync_from_device(&self) -> Result<()> {
        self.fd
            .sync_bo(self.handle, driver::SYNC_FROM_DEVICE, self.padded as u64)
            .map_err(|source| NpuError::Driver { call: "sync_bo", source })
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.fd.unmap_bo(self.ptr, self.padded);
        self.fd.close_bo(self.handle);
    }
}

/// Handle pair passed to the driver when a buffer is used as a kernel
/// argument.
#[derive(Debug, Clone, Copy)]
pub struct BoRef {
    pub handle: u32,
    pub addr: u64,
}

#[derive(Debug)]
enum Storage<T> {
    Host(Vec<T>),
    Device(DmaBuffer),
}

/// A typed buffer. `size()` reports elements, not bytes.
#[derive(Debug)]
pub struct Buffer<T: Pod> {
    storage: Storage<T>,
}

/// An untyped byte buffer.
pub type Bytes = Buffer<u8>;

impl<T: Pod> Buffer<T> {
    /// Zero-initialized host allocation of `count` elements.
    pub fn host(count: usize) -> Result<Self> {
        let bytes = count * std::mem::size_of::<T>();
        if bytes == 0 || bytes >= MAX_HOST_ALLOC {
            return Err(NpuError::SizeMismatch {
                expected: MAX_HOST_ALLOC,
                got: bytes,
            });
        }
        Ok(Self {
            storage: Storage::Host(vec![T::zeroed(); count]),
        })
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            storage: Storage::Host(data),
        }
    }

    /// DMA-visible allocation of `count` elements.
    pub fn device(fd: Arc<DeviceFd>, count: usize) -> Result<Self> {
        let dma = DmaBuffer::alloc(fd, count * std::mem::size_of::<T>())?;
        Ok(Self {
            storage: Storage::Device(dma),
        })
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        match &self.storage {
            Storage::Host(v) => v.len(),
            Storage::Device(d) => d.len() / std::mem::size_of::<T>(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match &self.storage {
            Storage::Host(v) => v.len() * std::mem::size_of::<T>(),
            Storage::Device(d) => d.len(),
        }
    }

    pub fn is_device_backed(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.storage {
            Storage::Host(v) => v,
            // The mapping is page-aligned, which satisfies any Pod type.
            Storage::Device(d) => bytemuck::cast_slice(d.as_slice()),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Host(v) => v,
            Storage::Device(d) => bytemuck::cast_slice_mut(d.as_mut_slice()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Host(v) => bytemuck::cast_slice(v),
            Storage::Device(d) => d.as_slice(),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Host(v) => bytemuck::cast_slice_mut(v),
            Storage::Device(d) => d.as_mut_slice(),
        }
    }

    pub fn fill(&mut self, value: T) {
        for slot in self.as_mut_slice() {
            *slot = value;
        }
    }

    /// Copy `src` into the front of this buffer. `src` must fit.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() > self.size() {
            return Err(NpuError::SizeMismatch {
                expected: self.size_bytes(),
                got: src.len() * std::mem::size_of::<T>(),
            });
        }
        self.as_mut_slice()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Blit raw bytes at a byte offset.
    pub fn copy_bytes_at(&mut self, byte_offset: usize, src: &[u8]) -> Result<()> {
        let end = byte_offset + src.len();
        if end > self.size_bytes() {
            return Err(NpuError::SizeMismatch {
                expected: self.size_bytes(),
                got: end,
            });
        }
        self.as_bytes_mut()[byte_offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Load a byte range of a file into the front of the buffer.
    pub fn load_file_range(&mut self, path: &Path, offset: u64, len: usize) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        if len > self.size_bytes() {
            return Err(NpuError::SizeMismatch {
                expected: self.size_bytes(),
                got: len,
            });
        }
        file.read_exact(&mut self.as_bytes_mut()[..len])?;
        Ok(())
    }

    /// Reinterpret as another element type. Host storage is re-collected to
    /// keep alignment sound; device storage is rewrapped in place.
    pub fn cast_to<U: Pod>(self) -> Buffer<U> {
        match self.storage {
            Storage::Host(v) => Buffer {
                storage: Storage::Host(bytemuck::pod_collect_to_vec(&v)),
            },
            Storage::Device(d) => Buffer {
                storage: Storage::Device(d),
            },
        }
    }

    /// Driver argument reference; fails for host-only buffers.
    pub fn bo(&self) -> Result<BoRef> {
        match &self.storage {
            Storage::Device(d) => Ok(BoRef {
                handle: d.handle(),
                addr: d.device_addr(),
            }),
            Storage::Host(_) => Err(NpuError::NotDeviceBacked),
        }
    }

    pub fn sync_to_device(&self) -> Result<()> {
        match &self.storage {
            Storage::Device(d) => d.sync_to_device(),
            Storage::Host(_) => Err(NpuError::NotDeviceBacked),
        }
    }

    pub fn sync_from_device(&self) -> Result<()> {
        match &self.storage {
            Storage::Device(d) => d.sync_from_device(),
            Storage::Host(_) => Err(NpuError::NotDeviceBacked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_size_in_elements() {
        let buf: Buffer<u32> = Buffer::host(16).unwrap();
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.size_bytes(), 64);
        assert!(!buf.is_device_backed());
    }

    #[test]
    fn test_copy_and_fill() {
        let mut buf: Buffer<u16> = Buffer::host(8).unwrap();
        buf.fill(7);
        assert!(buf.as_slice().iter().all(|&v| v == 7));
        buf.copy_from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(&buf.as_slice()[..4], &[1, 2, 3, 7]);
        assert!(buf.copy_from_slice(&[0u16; 9]).is_err());
    }

    #[test]
    fn test_cast_preserves_bytes() {
        let buf = Buffer::from_vec(vec![0x0403_0201u32, 0x0807_0605]);
        let bytes = buf.cast_to::<u8>();
        assert_eq!(bytes.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_host_buffer_has_no_bo() {
        let buf: Buffer<u8> = Buffer::host(4).unwrap();
        assert!(buf.bo().is_err());
        assert!(buf.sync_to_device().is_err());
    }
}
