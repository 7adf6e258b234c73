//! External services behind the syscall handlers
//!
//! The kernel core does not own a console driver, a file system, a
//! semaphore registry or an executable loader. It talks to each through a
//! trait object held in [`Services`]. In-memory implementations of all
//! four ship here; the demo binary and the tests run on them.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;
use log::{debug, trace};
use spin::Mutex;

use crate::types::ThreadId;
use crate::vm::ExecutableImage;

// ============================================================================
// Console
// ============================================================================

/// Character console used by the numeric, character and string syscalls
pub trait ConsoleIo {
    /// Next input byte, or `None` once input is exhausted
    fn read_char(&mut self) -> Option<u8>;

    fn print_char(&mut self, c: u8);

    /// Read one whitespace-delimited integer; anything unparsable reads
    /// as 0
    fn read_num(&mut self) -> i32 {
        let mut token = Vec::new();
        while let Some(c) = self.read_char() {
            if c.is_ascii_whitespace() {
                if token.is_empty() {
                    continue;
                }
                break;
            }
            token.push(c);
        }
        core::str::from_utf8(&token)
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0)
    }

    fn print_num(&mut self, n: i32) {
        let mut digits: heapless::String<12> = heapless::String::new();
        // i32::MIN is 11 characters
        let _ = write!(digits, "{}", n);
        self.print_string(digits.as_bytes());
    }

    /// Read up to `max` bytes, stopping before a newline
    fn read_string(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            match self.read_char() {
                Some(b'\n') | None => break,
                Some(c) => out.push(c),
            }
        }
        out
    }

    fn print_string(&mut self, s: &[u8]) {
        for c in s {
            self.print_char(*c);
        }
    }
}

/// Shared view of everything a [`BufferConsole`] has printed
#[derive(Debug, Clone, Default)]
pub struct OutputHandle(Arc<Mutex<Vec<u8>>>);

impl OutputHandle {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

/// Console reading from a fixed input buffer and recording its output
#[derive(Debug, Default)]
pub struct BufferConsole {
    input: VecDeque<u8>,
    output: OutputHandle,
}

impl BufferConsole {
    pub fn new(input: &[u8]) -> Self {
        Self {
            input: input.iter().copied().collect(),
            output: OutputHandle::default(),
        }
    }

    pub fn output(&self) -> OutputHandle {
        self.output.clone()
    }
}

impl ConsoleIo for BufferConsole {
    fn read_char(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn print_char(&mut self, c: u8) {
        self.output.0.lock().push(c);
    }
}

// ============================================================================
// File System
// ============================================================================

/// Open file handle as seen by user programs
pub type OpenFileId = i32;

/// Console input, never opened explicitly
pub const STDIN: OpenFileId = 0;
/// Console output, never opened explicitly
pub const STDOUT: OpenFileId = 1;

/// Mode argument of the Open syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite = 0,
    ReadOnly = 1,
}

impl OpenMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::ReadWrite),
            1 => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

/// File operations backing Create/Open/Read/Write/Seek/Close
///
/// Ids 0 and 1 are handled by the console and never reach this trait.
pub trait FileSystem {
    /// Create an empty file, truncating any existing one
    fn create(&mut self, name: &str) -> bool;

    fn open(&mut self, name: &str, mode: OpenMode) -> Option<OpenFileId>;

    fn close(&mut self, id: OpenFileId) -> bool;

    /// Bytes read at the current position
    fn read(&mut self, id: OpenFileId, buf: &mut [u8]) -> Option<usize>;

    /// Bytes written at the current position
    fn write(&mut self, id: OpenFileId, data: &[u8]) -> Option<usize>;

    /// Move to `pos`, or to the end for -1; returns the new position
    fn seek(&mut self, id: OpenFileId, pos: i32) -> Option<i32>;
}

/// Open-file slots, console ids included
pub const MAX_OPEN_FILES: usize = 20;

#[derive(Debug, Clone)]
struct OpenFile {
    name: String,
    mode: OpenMode,
    pos: usize,
}

/// File system kept entirely in memory
#[derive(Debug, Default)]
pub struct MemFileSystem {
    files: BTreeMap<String, Vec<u8>>,
    open: BTreeMap<OpenFileId, OpenFile>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file with contents
    pub fn insert(&mut self, name: &str, contents: &[u8]) {
        self.files.insert(name.to_string(), contents.to_vec());
    }

    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|data| data.as_slice())
    }

    fn free_id(&self) -> Option<OpenFileId> {
        (STDOUT + 1..MAX_OPEN_FILES as OpenFileId).find(|id| !self.open.contains_key(id))
    }
}

impl FileSystem for MemFileSystem {
    fn create(&mut self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        debug!(target: "file", "create {:?}", name);
        self.files.insert(name.to_string(), Vec::new());
        true
    }

    fn open(&mut self, name: &str, mode: OpenMode) -> Option<OpenFileId> {
        if !self.files.contains_key(name) {
            return None;
        }
        let id = self.free_id()?;
        self.open.insert(
            id,
            OpenFile {
                name: name.to_string(),
                mode,
                pos: 0,
            },
        );
        debug!(target: "file", "open {:?} as {} ({:?})", name, id, mode);
        Some(id)
    }

    fn close(&mut self, id: OpenFileId) -> bool {
        self.open.remove(&id).is_some()
    }

    fn read(&mut self, id: OpenFileId, buf: &mut [u8]) -> Option<usize> {
        let file = self.open.get_mut(&id)?;
        let data = self.files.get(&file.name)?;
        let start = file.pos.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        file.pos = start + n;
        trace!(target: "file", "read {} bytes from {}", n, id);
        Some(n)
    }

    fn write(&mut self, id: OpenFileId, data: &[u8]) -> Option<usize> {
        let file = self.open.get_mut(&id)?;
        if file.mode == OpenMode::ReadOnly {
            return None;
        }
        let contents = self.files.get_mut(&file.name)?;
        let end = file.pos + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[file.pos..end].copy_from_slice(data);
        file.pos = end;
        trace!(target: "file", "wrote {} bytes to {}", data.len(), id);
        Some(data.len())
    }

    fn seek(&mut self, id: OpenFileId, pos: i32) -> Option<i32> {
        let file = self.open.get_mut(&id)?;
        let len = self.files.get(&file.name)?.len();
        let target = match pos {
            -1 => len,
            p if p >= 0 && p as usize <= len => p as usize,
            _ => return None,
        };
        file.pos = target;
        i32::try_from(target).ok()
    }
}

// ============================================================================
// Semaphores
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Count was positive and has been taken
    Acquired,
    /// Caller was queued and must block
    MustBlock,
    /// No semaphore by that name
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Count released, possibly straight to a queued waiter
    Released(Option<ThreadId>),
    Unknown,
}

/// Named semaphores backing CreateSemaphore/Wait/Signal
pub trait SyncRegistry {
    fn create(&mut self, name: &str, initial: i32) -> bool;

    fn wait(&mut self, name: &str, thread: ThreadId) -> WaitOutcome;

    fn signal(&mut self, name: &str) -> SignalOutcome;
}

/// Semaphore slots
pub const MAX_SEMAPHORES: usize = 10;

#[derive(Debug, Default)]
struct Semaphore {
    value: i32,
    waiters: VecDeque<ThreadId>,
}

#[derive(Debug, Default)]
pub struct SemaphoreTable {
    sems: BTreeMap<String, Semaphore>,
}

impl SemaphoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<i32> {
        self.sems.get(name).map(|sem| sem.value)
    }
}

impl SyncRegistry for SemaphoreTable {
    fn create(&mut self, name: &str, initial: i32) -> bool {
        if name.is_empty() || initial < 0 || self.sems.contains_key(name) || self.sems.len() >= MAX_SEMAPHORES {
            return false;
        }
        self.sems.insert(
            name.to_string(),
            Semaphore {
                value: initial,
                waiters: VecDeque::new(),
            },
        );
        true
    }

    fn wait(&mut self, name: &str, thread: ThreadId) -> WaitOutcome {
        let Some(sem) = self.sems.get_mut(name) else {
            return WaitOutcome::Unknown;
        };
        if sem.value > 0 {
            sem.value -= 1;
            WaitOutcome::Acquired
        } else {
            sem.waiters.push_back(thread);
            WaitOutcome::MustBlock
        }
    }

    fn signal(&mut self, name: &str) -> SignalOutcome {
        let Some(sem) = self.sems.get_mut(name) else {
            return SignalOutcome::Unknown;
        };
        match sem.waiters.pop_front() {
            Some(thread) => SignalOutcome::Released(Some(thread)),
            None => {
                sem.value += 1;
                SignalOutcome::Released(None)
            }
        }
    }
}

// ============================================================================
// Program Loader
// ============================================================================

/// Resolves Exec names to executable images
pub trait ProgramLoader {
    fn load(&self, name: &str) -> Option<Arc<ExecutableImage>>;
}

/// Loader over a fixed set of named images
#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: BTreeMap<String, Arc<ExecutableImage>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, image: ExecutableImage) {
        self.images.insert(name.to_string(), Arc::new(image));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(|name| name.as_str())
    }
}

impl ProgramLoader for ImageRegistry {
    fn load(&self, name: &str) -> Option<Arc<ExecutableImage>> {
        self.images.get(name).cloned()
    }
}

// ============================================================================
// Random Numbers
// ============================================================================

/// Seeded xorshift64* generator behind RandomNum
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift
        Self {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// A value in `1..=i32::MAX`
    pub fn next_positive(&mut self) -> i32 {
        ((self.next_u64() >> 33) as i32).max(1)
    }
}

// ============================================================================
// Service Bundle
// ============================================================================

/// Everything the syscall handlers delegate to
pub struct Services {
    pub console: Box<dyn ConsoleIo>,
    pub files: Box<dyn FileSystem>,
    pub sync: Box<dyn SyncRegistry>,
    pub loader: Box<dyn ProgramLoader>,
}

impl Services {
    pub fn new(
        console: Box<dyn ConsoleIo>,
        files: Box<dyn FileSystem>,
        sync: Box<dyn SyncRegistry>,
        loader: Box<dyn ProgramLoader>,
    ) -> Self {
        Self {
            console,
            files,
            sync,
            loader,
        }
    }

    /// In-memory services: a buffer console fed `input`, an empty file
    /// system and semaphore table, and `programs` as the loader
    pub fn in_memory(input: &[u8], programs: ImageRegistry) -> (Self, OutputHandle) {
        let console = BufferConsole::new(input);
        let output = console.output();
        let services = Self::new(
            Box::new(console),
            Box::new(MemFileSystem::new()),
            Box::new(SemaphoreTable::new()),
            Box::new(programs),
        );
        (services, output)
    }
}
