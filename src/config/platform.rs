//! Host platform identification

use crate::types::LspError;
use std::env::consts;

/// Platform identifiers understood by dependency catalogs
pub const KNOWN_PLATFORMS: &[&str] = &[
    "linux-x64",
    "linux-arm64",
    "osx-x64",
    "osx-arm64",
    "win-x64",
    "win-arm64",
];

/// Map an OS/architecture pair (as in `std::env::consts`) to a platform id
pub fn platform_id(os: &str, arch: &str) -> Option<&'static str> {
    let id = match (os, arch) {
        ("linux", "x86_64") => "linux-x64",
        ("linux", "aarch64") => "linux-arm64",
        ("macos", "x86_64") => "osx-x64",
        ("macos", "aarch64") => "osx-arm64",
        ("windows", "x86_64") => "win-x64",
        ("windows", "aarch64") => "win-arm64",
        _ => return None,
    };
    Some(id)
}

/// Platform id of the running host
pub fn current() -> Result<&'static str, LspError> {
    platform_id(consts::OS, consts::ARCH).ok_or_else(|| LspError::UnsupportedPlatform {
        platform: format!("{}-{}", consts::OS, consts::ARCH),
        supported: KNOWN_PLATFORMS.iter().map(|p| p.to_string()).collect(),
    })
}
