use std::path::{Path, PathBuf};

use super::Platform;

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn terminate_process(pid: u32) -> std::io::Result<()> {
        std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output()
            .map(|_| ())
    }

    fn kill_process_tree(pid: u32) -> std::io::Result<()> {
        std::process::Command::new("kill")
            .args(["-KILL", &pid.to_string()])
            .output()
            .map(|_| ())
    }

    fn prompt_via_stdin() -> bool {
        false
    }

    fn create_dir_link(link: &Path, target: &Path) -> std::io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tether")
    }
}
