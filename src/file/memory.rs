use super::Backend;
use crate::Result;

/// Container held in an owned buffer, used for bytes that did not come from disk
/// (tests, fuzzing, containers extracted from resource forks).
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Take ownership of `data`.
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(out_of_bounds_error!())
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error::OutOfBounds;

    #[test]
    fn slices_within_bounds() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"Joy!");
        data[4..8].copy_from_slice(b"peff");

        let memory = Memory::new(data);
        assert_eq!(memory.len(), 64);
        assert_eq!(memory.data_slice(0, 8).unwrap(), b"Joy!peff");
        assert_eq!(memory.data_slice(64, 0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn slices_out_of_bounds() {
        let memory = Memory::new(vec![0u8; 16]);

        assert!(matches!(memory.data_slice(15, 2), Err(OutOfBounds)));
        assert!(matches!(memory.data_slice(17, 0), Err(OutOfBounds)));
        assert!(matches!(memory.data_slice(usize::MAX, 1), Err(OutOfBounds)));
    }
}
