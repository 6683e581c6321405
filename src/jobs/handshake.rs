// Transfer handshake
//
// The file-transfer process drops `<source>.READY` after the raw video is
// fully written. Until then the source must not be read; a missing marker
// defers the job, it never fails it.

use std::path::{Path, PathBuf};

use crate::media::ready_marker_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { marker: PathBuf },
    NotReady { marker: PathBuf },
}

pub fn check_transfer_ready(source: &Path) -> Readiness {
    let marker = ready_marker_path(source);
    if marker.exists() {
        Readiness::Ready { marker }
    } else {
        Readiness::NotReady { marker }
    }
}
