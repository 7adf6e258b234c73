//! Executable images
//!
//! The kernel only needs three segment descriptors and random access to
//! the file bytes; decoding an on-disk header is the loader's business.
//! [`ImageBuilder`] lays out images in memory for the demo programs and
//! the tests.

use alloc::vec::Vec;

/// Size of the header that precedes the segments in a built image
pub const HEADER_SIZE: u32 = 40;

/// One segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// First virtual address of the segment
    pub virtual_addr: u32,
    /// Length in bytes
    pub size: u32,
    /// Where the segment's bytes start in the file
    pub in_file_addr: u32,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.virtual_addr + self.size
    }

    /// Part of `[start, end)` that this segment covers
    pub fn overlap(&self, start: u32, end: u32) -> Option<(u32, u32)> {
        if self.size == 0 {
            return None;
        }
        let lo = start.max(self.virtual_addr);
        let hi = end.min(self.end());
        (lo < hi).then_some((lo, hi))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
    file: Vec<u8>,
}

impl ExecutableImage {
    pub fn new(code: Segment, init_data: Segment, uninit_data: Segment, file: Vec<u8>) -> Self {
        Self {
            code,
            init_data,
            uninit_data,
            file,
        }
    }

    pub fn builder() -> ImageBuilder {
        ImageBuilder::default()
    }

    pub fn file_len(&self) -> usize {
        self.file.len()
    }

    /// Copy file bytes starting at `offset` into `buf`
    ///
    /// Returns how many bytes were available; the rest of `buf` is left
    /// untouched.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let Some(available) = self.file.get(offset..) else {
            return 0;
        };
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }

    /// Highest virtual address any segment reaches
    pub fn image_size(&self) -> u32 {
        self.code
            .end()
            .max(self.init_data.end())
            .max(self.uninit_data.end())
    }
}

/// Builds an image with code at virtual address 0
#[derive(Debug, Default)]
pub struct ImageBuilder {
    code: Vec<u8>,
    data: Option<(u32, Vec<u8>)>,
    bss: u32,
}

impl ImageBuilder {
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Initialized data placed at `vaddr`
    pub fn data(mut self, vaddr: u32, bytes: Vec<u8>) -> Self {
        self.data = Some((vaddr, bytes));
        self
    }

    /// Zero-filled data following the initialized data
    pub fn bss(mut self, size: u32) -> Self {
        self.bss = size;
        self
    }

    pub fn build(self) -> ExecutableImage {
        let mut file = Vec::with_capacity(HEADER_SIZE as usize + self.code.len());
        file.resize(HEADER_SIZE as usize, 0);

        let code = Segment {
            virtual_addr: 0,
            size: self.code.len() as u32,
            in_file_addr: HEADER_SIZE,
        };
        file.extend_from_slice(&self.code);

        let init_data = match self.data {
            Some((vaddr, bytes)) => {
                let segment = Segment {
                    virtual_addr: vaddr,
                    size: bytes.len() as u32,
                    in_file_addr: file.len() as u32,
                };
                file.extend_from_slice(&bytes);
                segment
            }
            None => Segment {
                virtual_addr: code.end(),
                ..Segment::default()
            },
        };

        let uninit_data = Segment {
            virtual_addr: init_data.end().max(code.end()),
            size: self.bss,
            in_file_addr: 0,
        };

        ExecutableImage::new(code, init_data, uninit_data, file)
    }
}

/// Packs NUL-terminated strings and words into an init-data segment
#[derive(Debug, Clone)]
pub struct DataSection {
    base: u32,
    bytes: Vec<u8>,
}

impl DataSection {
    pub fn at(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Append a C string and return its virtual address
    pub fn cstr(&mut self, s: &str) -> u32 {
        let addr = self.base + self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        addr
    }

    /// Append a word-aligned little-endian word and return its address
    pub fn word(&mut self, value: i32) -> u32 {
        while (self.base as usize + self.bytes.len()) % 4 != 0 {
            self.bytes.push(0);
        }
        let addr = self.base + self.bytes.len() as u32;
        self.bytes.extend_from_slice(&value.to_le_bytes());
        addr
    }

    /// Reserve `len` zero bytes and return their address
    pub fn buffer(&mut self, len: usize) -> u32 {
        let addr = self.base + self.bytes.len() as u32;
        self.bytes.resize(self.bytes.len() + len, 0);
        addr
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
