//! Executable-memory regions for JIT-compiled probe functions.
//!
//! A probe is assembled into a plain byte buffer, copied into a
//! [`CodeRegion`], optionally patched (absolute-address fixups need the
//! final base address), and then sealed into an [`ExecRegion`] whose
//! pages are `R+X` and no longer writable. The region owns the mapping;
//! dropping it unmaps the code, so a caller must not retain function
//! pointers past the region's lifetime.

use memmap2::{Mmap, MmapMut, MmapOptions};

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("failed to map {size} bytes of code memory: {source}")]
    Map {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to make code memory executable: {0}")]
    Protect(#[source] std::io::Error),
    #[error("cannot map an empty code buffer")]
    Empty,
}

/// A writable, not-yet-executable code mapping.
pub struct CodeRegion {
    map: MmapMut,
    len: usize,
}

impl CodeRegion {
    /// Maps an anonymous writable region and copies `code` into it.
    pub fn with_code(code: &[u8]) -> Result<CodeRegion, JitError> {
        if code.is_empty() {
            return Err(JitError::Empty);
        }
        let mut map = MmapOptions::new()
            .len(code.len())
            .map_anon()
            .map_err(|source| JitError::Map {
                size: code.len(),
                source,
            })?;
        map[..code.len()].copy_from_slice(code);
        Ok(CodeRegion {
            map,
            len: code.len(),
        })
    }

    /// Base address the code will execute at. Stable across `seal`.
    pub fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.map[..len]
    }

    /// Flips the mapping to read+execute.
    pub fn seal(self) -> Result<ExecRegion, JitError> {
        let map = self.map.make_exec().map_err(JitError::Protect)?;
        Ok(ExecRegion { map, len: self.len })
    }
}

/// A sealed, executable code mapping.
pub struct ExecRegion {
    map: Mmap,
    len: usize,
}

impl ExecRegion {
    pub fn entry(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
