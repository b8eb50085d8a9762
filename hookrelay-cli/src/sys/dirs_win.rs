extern crate dirs_sys;

use std::path::PathBuf;

pub fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}

pub fn state_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_local_app_data()
}
