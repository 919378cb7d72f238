//! Mount supervisor: binds the adapter to a mount point and owns the
//! kernel-bridge session lifecycle.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fuser::{BackgroundSession, MountOption};

use crate::common::{Error, Result};
use crate::fs::adapter::FtpFs;
use crate::fs::fuse::FtpFuse;

/// Default wait for the kernel to acknowledge the mount.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FuseHost {
    fs: Arc<FtpFs>,
    mountpoint: PathBuf,
    session: Option<BackgroundSession>,
}

impl FuseHost {
    pub fn new(fs: Arc<FtpFs>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            mountpoint: mountpoint.into(),
            session: None,
        }
    }

    fn options() -> Vec<MountOption> {
        vec![
            MountOption::FSName("ftpfs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ]
    }

    /// Mount in the background. Errors with [`Error::MountFailed`] when the
    /// kernel has not acknowledged the mount within `timeout`.
    pub fn start(&mut self, timeout: Duration) -> Result<()> {
        let shim = FtpFuse::new(self.fs.clone());
        let mountpoint = self.mountpoint.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(fuser::spawn_mount2(shim, &mountpoint, &Self::options()));
        });
        match rx.recv_timeout(timeout) {
            Ok(Ok(session)) => {
                self.session = Some(session);
                tracing::info!("mounted at {}", self.mountpoint.display());
                Ok(())
            }
            Ok(Err(e)) => Err(Error::MountFailed(e.to_string())),
            Err(_) => Err(Error::MountFailed(format!(
                "no mount acknowledgement within {:?}",
                timeout
            ))),
        }
    }

    /// Mount in the foreground; returns once the filesystem is unmounted.
    pub fn run(&self) -> Result<()> {
        let shim = FtpFuse::new(self.fs.clone());
        tracing::info!("mounting at {}", self.mountpoint.display());
        fuser::mount2(shim, &self.mountpoint, &Self::options())
            .map_err(|e| Error::MountFailed(e.to_string()))?;
        self.fs.close();
        Ok(())
    }

    /// Unmount and shut the adapter down; idle handles are force-released
    /// and the pool reaper is joined.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session);
            tracing::info!("unmounted {}", self.mountpoint.display());
        }
        self.fs.close();
    }
}
