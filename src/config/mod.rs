//! Configuration for opening a database.
//!
//! The page size is captured into [`Options`] once at open time and threaded
//! through every component; there is no process-global page size. Opening an
//! existing file always defers to the page size recorded in its meta pages.

mod constants;

pub use constants::*;

use crate::error::{Error, Result};

/// Options controlling how a database file is opened and formatted.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page size used when formatting a new file. Existing files keep the
    /// page size recorded in their meta pages.
    pub page_size: usize,
    /// Initial size of the read mapping over the file.
    pub mmap_size: usize,
}

impl Options {
    pub fn new() -> Self {
        Self {
            page_size: os_page_size(),
            mmap_size: INIT_MMAP_SIZE,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::InvalidArgument(
                "page size must be a power of two between 512 and 65536",
            ));
        }
        if self.mmap_size < self.page_size {
            return Err(Error::InvalidArgument(
                "mmap size must cover at least one page",
            ));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the OS page size, falling back to [`DEFAULT_PAGE_SIZE`] when the
/// probe fails or reports something the format cannot use.
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf takes no pointers and returns -1 on error.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            let sz = sz as usize;
            if (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&sz) && sz.is_power_of_two() {
                return sz;
            }
        }
    }
    DEFAULT_PAGE_SIZE
}
