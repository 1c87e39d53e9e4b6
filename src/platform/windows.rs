use std::path::{Path, PathBuf};

use super::Platform;

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn terminate_process(pid: u32) -> std::io::Result<()> {
        // /T covers the helper processes the agent CLIs fork.
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T"])
            .output()
            .map(|_| ())
    }

    fn kill_process_tree(pid: u32) -> std::io::Result<()> {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .map(|_| ())
    }

    fn prompt_via_stdin() -> bool {
        true
    }

    fn create_dir_link(link: &Path, target: &Path) -> std::io::Result<()> {
        // Plain symlinks need Developer Mode or admin; junctions do not.
        match std::os::windows::fs::symlink_dir(target, link) {
            Ok(()) => Ok(()),
            Err(_) => {
                let output = std::process::Command::new("cmd")
                    .args([
                        "/c",
                        "mklink",
                        "/J",
                        &link.display().to_string(),
                        &target.display().to_string(),
                    ])
                    .output()?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(std::io::Error::other(format!(
                        "mklink /J failed: {} -> {}",
                        link.display(),
                        target.display()
                    )))
                }
            }
        }
    }

    fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }
}
