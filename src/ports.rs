use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::Error;

/// Bounded TCP port allocator over `[base_port, base_port + max_instances)`.
///
/// One port per live IDE instance. Release is idempotent so the exit
/// handler and the explicit stop path can both call it.
pub struct PortPool {
    base_port: u16,
    max_instances: usize,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(base_port: u16, max_instances: usize) -> Self {
        Self {
            base_port,
            max_instances,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port in the range.
    pub fn allocate(&self) -> Result<u16, Error> {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        for offset in 0..self.max_instances {
            let port = self.base_port + offset as u16;
            if allocated.insert(port) {
                return Ok(port);
            }
        }
        Err(Error::CapacityExhausted("no free IDE ports"))
    }

    /// Release a port back to the pool. Idempotent; ports outside the range
    /// are ignored.
    pub fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock().unwrap_or_else(|e| e.into_inner());
        allocated.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port() {
        let pool = PortPool::new(3100, 3);
        assert_eq!(pool.allocate().unwrap(), 3100);
        assert_eq!(pool.allocate().unwrap(), 3101);
        pool.release(3100);
        assert_eq!(pool.allocate().unwrap(), 3100);
    }

    #[test]
    fn exhaustion_fails() {
        let pool = PortPool::new(3100, 2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortPool::new(3100, 2);
        let p = pool.allocate().unwrap();
        pool.release(p);
        pool.release(p);
        pool.release(9999);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        use std::sync::Arc;
        let pool = Arc::new(PortPool::new(4000, 64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                (0..8).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64);
    }
}
