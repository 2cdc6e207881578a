use std::collections::BTreeMap;

use crate::error::StorageError;

/// Byte-addressed non-volatile region (EEPROM, NVS blob, backing file).
pub trait ByteRegion {
    fn open(&mut self) -> Result<(), StorageError>;
    fn capacity(&self) -> usize;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
    fn erase(&mut self) -> Result<(), StorageError>;
}

/// Named-file store (SPIFFS, NVS strings, a host directory).
pub trait FileStore {
    fn open(&mut self) -> Result<(), StorageError>;
    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError>;
    fn remove(&mut self, name: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    bytes: Vec<u8>,
    pub fail_open: bool,
    pub fail_writes: bool,
}

impl MemoryRegion {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0xFF; capacity],
            fail_open: false,
            fail_writes: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn bounds(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let end = offset + len;
        if end > self.bytes.len() {
            return Err(StorageError::RegionTooSmall {
                needed: end,
                capacity: self.bytes.len(),
            });
        }
        Ok(offset..end)
    }
}

impl ByteRegion for MemoryRegion {
    fn open(&mut self) -> Result<(), StorageError> {
        if self.fail_open {
            return Err(StorageError::Unavailable("memory region"));
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend("memory region write refused".into()));
        }
        let range = self.bounds(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.bytes.fill(0xFF);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFiles {
    files: BTreeMap<String, Vec<u8>>,
    pub fail_open: bool,
    pub fail_writes: bool,
}

impl MemoryFiles {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<u8>> {
        self.files.get_mut(name)
    }
}

impl FileStore for MemoryFiles {
    fn open(&mut self) -> Result<(), StorageError> {
        if self.fail_open {
            return Err(StorageError::Unavailable("memory files"));
        }
        Ok(())
    }

    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.files.get(name).cloned())
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend(format!("write of {name} refused")));
        }
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        self.files.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_rejects_out_of_bounds_access() {
        let mut region = MemoryRegion::new(16);
        let mut buf = [0_u8; 8];

        assert!(region.read(12, &mut buf).is_err());
        assert!(region.write(10, &[1; 8]).is_err());
        assert!(region.write(8, &[1; 8]).is_ok());
        region.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
    }

    #[test]
    fn erased_region_reads_back_ff() {
        let mut region = MemoryRegion::new(4);
        region.write(0, &[1, 2, 3, 4]).unwrap();
        region.erase().unwrap();

        assert_eq!(region.bytes(), &[0xFF; 4]);
    }
}
