//! System browser launching.

use crate::core::{FederationError, Result};
use std::process::Command;
use tracing::debug;

/// Open `url` in the platform's default browser.
///
/// The URL must already have passed [`crate::http::validate_idp_url`]; this
/// function only dispatches to the platform opener and never blocks on the
/// spawned process.
pub fn open(url: &str) -> Result<()> {
    debug!(%url, "opening system browser");

    #[cfg(target_os = "macos")]
    let result = Command::new("open").arg(url).spawn();

    #[cfg(target_os = "windows")]
    let result = Command::new("cmd").args(["/C", "start", "", url]).spawn();

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let result = Command::new("xdg-open").arg(url).spawn();

    result
        .map(|_| ())
        .map_err(|e| FederationError::Unexpected(format!("failed to launch browser: {e}")))
}
