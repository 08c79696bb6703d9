#![forbid(unsafe_code)]

//! Shared security helpers used by the DotByte binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The server writes into the
/// movie library and the catalog database; doing that as an unprivileged
/// service account keeps a misconfigured path from touching system files.
pub fn ensure_not_root(process: &str) -> Result<()> {
    refuse_root(Uid::effective(), process)
}

fn refuse_root(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "refusing to start {process} as root; run it under the account that owns the movie library"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuse_root_accepts_service_account() {
        assert!(refuse_root(Uid::from_raw(1234), "backend").is_ok());
    }

    #[test]
    fn refuse_root_rejects_uid_zero() {
        let err = refuse_root(Uid::from_raw(0), "backend").unwrap_err();
        assert!(
            err.to_string()
                .contains("refusing to start backend as root")
        );
    }
}
