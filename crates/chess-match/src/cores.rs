//! CPU core pools shared by concurrently running games.
//!
//! Cores are configured in four classes (physical performance cores, their
//! hyperthread siblings, efficiency cores and unclassified cores). A game asks
//! for a number of cores and gets what is available, drawn in that class
//! order; the set goes back to the pools when the game is over.

use std::io;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Core ids must be below this to fit an affinity mask.
#[cfg(target_os = "linux")]
pub const MAX_CORES: usize = libc::CPU_SETSIZE as usize;
/// Core ids must be below this to fit an affinity mask.
#[cfg(not(target_os = "linux"))]
pub const MAX_CORES: usize = 1024;

/// Errors that can occur when parsing or validating core lists.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoreListError {
    /// A list entry is not a core id or an `a-b` range.
    #[error("Invalid core list entry: {0:?}")]
    InvalidEntry(String),
    /// A range whose start is greater than its end.
    #[error("Invalid core range: {0}-{1}")]
    InvalidRange(usize, usize),
    /// A core id too large for an affinity mask.
    #[error("Core {0} is out of range (must be below {max})", max = MAX_CORES)]
    OutOfRange(usize),
    /// The same core was configured in more than one class.
    #[error("Core {0} appears in more than one core list")]
    Overlap(usize),
}

/// The class a core was configured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreClass {
    PhysicalFast,
    LogicalFast,
    Efficiency,
    Generic,
}

impl CoreClass {
    /// Order in which pools are drained when a game asks for cores.
    pub const ALLOCATION_ORDER: [CoreClass; 4] = [
        CoreClass::PhysicalFast,
        CoreClass::LogicalFast,
        CoreClass::Efficiency,
        CoreClass::Generic,
    ];
}

/// One list of core ids per [`CoreClass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreLists {
    pub physical_fast: Vec<usize>,
    pub logical_fast: Vec<usize>,
    pub efficiency: Vec<usize>,
    pub generic: Vec<usize>,
}

impl CoreLists {
    pub fn get(&self, class: CoreClass) -> &Vec<usize> {
        match class {
            CoreClass::PhysicalFast => &self.physical_fast,
            CoreClass::LogicalFast => &self.logical_fast,
            CoreClass::Efficiency => &self.efficiency,
            CoreClass::Generic => &self.generic,
        }
    }

    fn get_mut(&mut self, class: CoreClass) -> &mut Vec<usize> {
        match class {
            CoreClass::PhysicalFast => &mut self.physical_fast,
            CoreClass::LogicalFast => &mut self.logical_fast,
            CoreClass::Efficiency => &mut self.efficiency,
            CoreClass::Generic => &mut self.generic,
        }
    }

    /// Total number of cores over all classes.
    pub fn len(&self) -> usize {
        CoreClass::ALLOCATION_ORDER
            .iter()
            .map(|&class| self.get(class).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that no core id is listed twice, within or across classes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreListError::Overlap`] naming the first repeated core.
    pub fn ensure_disjoint(&self) -> Result<(), CoreListError> {
        let mut seen = std::collections::HashSet::new();
        for class in CoreClass::ALLOCATION_ORDER {
            for &core in self.get(class) {
                if !seen.insert(core) {
                    return Err(CoreListError::Overlap(core));
                }
            }
        }
        Ok(())
    }

    fn class_of(&self, core: usize) -> Option<CoreClass> {
        CoreClass::ALLOCATION_ORDER
            .into_iter()
            .find(|&class| self.get(class).contains(&core))
    }
}

/// Parses a core specification such as `"0-3,8,10-11"`.
///
/// Whitespace around entries is ignored, the result is sorted and
/// deduplicated, and an empty specification yields an empty list.
///
/// # Errors
///
/// Returns [`CoreListError::InvalidEntry`] for anything that is not a number
/// or a range, [`CoreListError::InvalidRange`] for a descending range and
/// [`CoreListError::OutOfRange`] for ids of [`MAX_CORES`] or more.
pub fn parse_core_list(text: &str) -> Result<Vec<usize>, CoreListError> {
    let mut cores = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            let core = s
                .trim()
                .parse::<usize>()
                .map_err(|_| CoreListError::InvalidEntry(part.to_string()))?;
            if core >= MAX_CORES {
                return Err(CoreListError::OutOfRange(core));
            }
            Ok(core)
        };
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(CoreListError::InvalidRange(start, end));
                }
                cores.extend(start..=end);
            }
            None => cores.push(parse(part)?),
        }
    }
    cores.sort_unstable();
    cores.dedup();
    Ok(cores)
}

/// Hands out and takes back core sets under one lock.
///
/// Every core handed out is missing from the available lists until it is
/// released, and is released into the class it was configured in.
#[derive(Debug)]
pub struct CoreAllocator {
    master: CoreLists,
    available: Mutex<CoreLists>,
}

impl CoreAllocator {
    /// Creates an allocator with every configured core available.
    ///
    /// # Errors
    ///
    /// Returns [`CoreListError::Overlap`] if a core is configured twice.
    pub fn new(master: CoreLists) -> Result<Self, CoreListError> {
        master.ensure_disjoint()?;
        Ok(Self {
            available: Mutex::new(master.clone()),
            master,
        })
    }

    /// An allocator with no cores; every request yields an empty set.
    pub fn disabled() -> Self {
        Self {
            master: CoreLists::default(),
            available: Mutex::new(CoreLists::default()),
        }
    }

    /// Whether any cores were configured at all.
    pub fn is_enabled(&self) -> bool {
        !self.master.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, CoreLists> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes up to `count` cores, draining the pools in
    /// [`CoreClass::ALLOCATION_ORDER`].
    ///
    /// Returns fewer cores than requested (possibly none) when the pools run
    /// dry rather than failing. The cores go back when the lease is dropped,
    /// including when the holder unwinds.
    pub fn allocate(&self, count: usize) -> CoreLease<'_> {
        let mut available = self.lock();
        let mut cores = Vec::with_capacity(count);
        for class in CoreClass::ALLOCATION_ORDER {
            let pool = available.get_mut(class);
            let take = (count - cores.len()).min(pool.len());
            cores.extend(pool.drain(..take));
            if cores.len() == count {
                break;
            }
        }
        CoreLease {
            allocator: self,
            cores,
        }
    }

    /// Returns cores to the pools they were allocated from. Ids that were
    /// never configured are dropped.
    fn release(&self, cores: &[usize]) {
        if cores.is_empty() {
            return;
        }
        let mut available = self.lock();
        for &core in cores {
            match self.master.class_of(core) {
                Some(class) => available.get_mut(class).push(core),
                None => tracing::warn!("Ignoring release of unknown core {}", core),
            }
        }
    }

    /// Snapshot of the available lists.
    pub fn available(&self) -> CoreLists {
        self.lock().clone()
    }

    /// The configured lists.
    pub fn master(&self) -> &CoreLists {
        &self.master
    }
}

/// A set of cores held by one game.
#[derive(Debug)]
pub struct CoreLease<'a> {
    allocator: &'a CoreAllocator,
    cores: Vec<usize>,
}

impl Deref for CoreLease<'_> {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.cores
    }
}

impl Drop for CoreLease<'_> {
    fn drop(&mut self) {
        self.allocator.release(&self.cores);
    }
}

/// Restricts every thread of process `pid` to `cores`.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] for a core of [`MAX_CORES`] or
/// more, and the OS error if the thread list cannot be read or the affinity
/// of a thread cannot be set.
#[cfg(target_os = "linux")]
pub fn set_process_affinity(pid: u32, cores: &[usize]) -> io::Result<()> {
    if cores.is_empty() {
        return Ok(());
    }
    if let Some(&core) = cores.iter().find(|&&core| core >= MAX_CORES) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            CoreListError::OutOfRange(core),
        ));
    }
    // SAFETY: cpu_set_t is a plain bitmask; all-zero is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &core in cores {
        // SAFETY: every id was checked against CPU_SETSIZE above.
        unsafe { libc::CPU_SET(core, &mut set) };
    }
    for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
        let tid: libc::pid_t = match entry?.file_name().to_string_lossy().parse() {
            Ok(tid) => tid,
            Err(_) => continue,
        };
        // SAFETY: `set` is a valid cpu_set_t that outlives the call.
        let rc = unsafe {
            libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Affinity is only applied on Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_process_affinity(_pid: u32, _cores: &[usize]) -> io::Result<()> {
    Ok(())
}
