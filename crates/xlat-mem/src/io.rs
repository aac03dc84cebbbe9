use thiserror::Error;

/// Failure reported by a device region for a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("device rejected access at offset {offset:#x} (size {size})")]
    Rejected { offset: u64, size: usize },
    #[error("unsupported access size {size}")]
    BadSize { size: usize },
}

/// A device window mapped into the guest address space.
///
/// Offsets are relative to the start of the original `map_io` call, even after the
/// region has been split by a partial `protect`/`unmap`.
pub trait IoHandler {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, IoError>;
    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), IoError>;
}

/// Byte-addressed scratch device: reads return what was written, little-endian.
///
/// Mostly useful for tests and as a placeholder device.
#[derive(Debug, Clone, Default)]
pub struct ScratchDevice {
    data: Vec<u8>,
}

impl ScratchDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    fn range(&self, offset: u64, size: usize) -> Result<std::ops::Range<usize>, IoError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(IoError::BadSize { size });
        }
        let start = usize::try_from(offset).map_err(|_| IoError::Rejected { offset, size })?;
        match start.checked_add(size) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(IoError::Rejected { offset, size }),
        }
    }
}

impl IoHandler for ScratchDevice {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, IoError> {
        let r = self.range(offset, size)?;
        Ok(xlat_types::Endian::Little.load(&self.data[r]))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), IoError> {
        let r = self.range(offset, size)?;
        xlat_types::Endian::Little.store(value, &mut self.data[r]);
        Ok(())
    }
}
