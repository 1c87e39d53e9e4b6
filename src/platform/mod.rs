//! Platform-specific operations behind a common interface so call sites
//! stay free of `#[cfg]` blocks.

use std::path::{Path, PathBuf};

pub trait Platform {
    /// Ask the process (and its tree where the OS supports it) to exit.
    fn terminate_process(pid: u32) -> std::io::Result<()>;

    /// Force-kill the process tree. Used after the grace period and on
    /// per-call timeouts; the agent CLIs fork helpers that must die too.
    fn kill_process_tree(pid: u32) -> std::io::Result<()>;

    /// Whether prompts should be fed via stdin instead of argv
    /// (Windows mangles long command lines).
    fn prompt_via_stdin() -> bool;

    /// Create a directory symlink; Windows falls back to an NTFS junction
    /// which needs no elevated rights.
    fn create_dir_link(link: &Path, target: &Path) -> std::io::Result<()>;

    /// Root data directory (`~/.tether` / `%APPDATA%\tether`).
    fn data_dir() -> PathBuf;
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
