use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port range exhausted")]
    Exhausted,

    #[error("port {port} is outside the managed range [{min}, {max}]")]
    OutOfRange { port: u16, min: u16, max: u16 },

    #[error("port {port} is not allocated")]
    NotAllocated { port: u16 },

    #[error("invalid port range [{min}, {max}]")]
    InvalidRange { min: u16, max: u16 },
}

/// Hands out unique TCP ports from a finite inclusive range.
///
/// A released port becomes available again; the scan starts from a rotating
/// cursor so recently released ports are reused without always favouring the
/// bottom of the range. All mutation happens under one mutex.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    allocated: HashSet<u16>,
    cursor: u16,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 || min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        Ok(Self {
            min,
            max,
            inner: Mutex::new(Inner {
                allocated: HashSet::new(),
                cursor: min,
            }),
        })
    }

    /// Reserve an unused port, or fail immediately when none is free.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut inner = self.inner.lock().expect("port allocator poisoned");
        let span = self.span();
        let start = inner.cursor;

        for offset in 0..span {
            let port = self.wrap(start as u32 + offset);
            if !inner.allocated.contains(&port) {
                inner.allocated.insert(port);
                inner.cursor = self.wrap(port as u32 + 1);
                debug!(port, "allocated port");
                return Ok(port);
            }
        }

        Err(PortError::Exhausted)
    }

    /// Release a previously allocated port. Double-release is an error.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        if port < self.min || port > self.max {
            return Err(PortError::OutOfRange {
                port,
                min: self.min,
                max: self.max,
            });
        }
        let mut inner = self.inner.lock().expect("port allocator poisoned");
        if !inner.allocated.remove(&port) {
            return Err(PortError::NotAllocated { port });
        }
        debug!(port, "released port");
        Ok(())
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.inner
            .lock()
            .expect("port allocator poisoned")
            .allocated
            .contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.inner
            .lock()
            .expect("port allocator poisoned")
            .allocated
            .len()
    }

    pub fn available_count(&self) -> usize {
        self.span() as usize - self.allocated_count()
    }

    fn span(&self) -> u32 {
        (self.max - self.min) as u32 + 1
    }

    /// Map an unbounded offset back into the inclusive range.
    fn wrap(&self, value: u32) -> u16 {
        let span = self.span();
        let rel = (value - self.min as u32) % span;
        (self.min as u32 + rel) as u16
    }
}
