use std::path::PathBuf;
use std::process::Command;

use directories::ProjectDirs;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "ami-keeper")
}

/// ~/.config/ami-keeper on Linux, ~/Library/Application Support/ami-keeper on macOS.
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// ~/.local/share/ami-keeper on Linux, where the run history lives.
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

pub fn aws_cli_available(cli: &str) -> bool {
    Command::new(cli)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
