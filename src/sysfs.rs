//! The legacy GPIO sysfs interface (`/sys/class/gpio`).
//!
//! Lines are exported by writing their number to `export`, after which the
//! kernel creates a `gpio<N>` directory holding the `direction`, `edge`,
//! `active_low` and `value` attributes.

use log::debug;
use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Direction, Edge};
use crate::error::GpioError;

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

const EXPORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);
const EXPORT_SETTLE_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new(SYSFS_GPIO_ROOT)
    }
}

impl Sysfs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the GPIO sysfs interface is present at all.
    pub fn is_available(&self) -> bool {
        self.root.join("export").exists()
    }

    pub fn line_dir(&self, id: u32) -> PathBuf {
        self.root.join(format!("gpio{id}"))
    }

    pub fn value_path(&self, id: u32) -> PathBuf {
        self.line_dir(id).join("value")
    }

    pub fn is_exported(&self, id: u32) -> bool {
        self.line_dir(id).is_dir()
    }

    /// Exports and configures line `id` unless it is already exported.
    ///
    /// An already exported line keeps whatever configuration it has. Returns
    /// whether this call performed the export.
    pub fn export(
        &self,
        id: u32,
        direction: Direction,
        edge: Option<Edge>,
    ) -> Result<bool, GpioError> {
        if self.is_exported(id) {
            debug!("gpio{id} already exported, leaving configuration untouched");
            return Ok(false);
        }

        write_attr(&self.root.join("export"), &id.to_string())
            .map_err(|e| GpioError::Config(format!("export gpio{id}: {e}")))?;
        self.wait_for_line(id)?;

        self.write_line_attr(id, "direction", direction.as_sysfs())
            .map_err(|e| GpioError::Config(format!("set gpio{id} direction: {e}")))?;
        if let Some(edge) = edge {
            self.write_line_attr(id, "edge", edge.as_sysfs())
                .map_err(|e| GpioError::Config(format!("set gpio{id} edge: {e}")))?;
        }

        fs::set_permissions(self.value_path(id), Permissions::from_mode(0o666))
            .map_err(|e| GpioError::Config(format!("chmod gpio{id} value: {e}")))?;

        debug!("exported gpio{id} as {direction}");
        Ok(true)
    }

    pub fn unexport(&self, id: u32) -> Result<(), GpioError> {
        write_attr(&self.root.join("unexport"), &id.to_string())
            .map_err(|e| GpioError::Config(format!("unexport gpio{id}: {e}")))?;
        debug!("unexported gpio{id}");
        Ok(())
    }

    /// Opens the value attribute read-write for positional access.
    pub fn open_value(&self, id: u32) -> Result<File, GpioError> {
        let path = self.value_path(id);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| GpioError::Config(format!("open {}: {e}", path.display())))
    }

    pub fn read_line_attr(&self, id: u32, attr: &str) -> Result<String, GpioError> {
        let path = self.line_dir(id).join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| GpioError::Io(format!("read {}: {e}", path.display())))
    }

    pub fn write_line_attr(&self, id: u32, attr: &str, value: &str) -> Result<(), GpioError> {
        let path = self.line_dir(id).join(attr);
        write_attr(&path, value)
            .map_err(|e| GpioError::Io(format!("write {}: {e}", path.display())))
    }

    // The line directory may show up a little after the export write returns
    // when udev is still adjusting ownership.
    fn wait_for_line(&self, id: u32) -> Result<(), GpioError> {
        let deadline = Instant::now() + EXPORT_SETTLE_TIMEOUT;
        while !self.value_path(id).exists() {
            if Instant::now() >= deadline {
                return Err(GpioError::Config(format!(
                    "gpio{id} did not appear after export"
                )));
            }
            thread::sleep(EXPORT_SETTLE_INTERVAL);
        }
        Ok(())
    }
}

fn write_attr(path: &Path, value: &str) -> std::io::Result<()> {
    fs::write(path, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn control_files(root: &Path) {
        fs::write(root.join("export"), "").unwrap();
        fs::write(root.join("unexport"), "").unwrap();
    }

    #[test]
    fn already_exported_line_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        control_files(dir.path());
        let line = dir.path().join("gpio7");
        fs::create_dir(&line).unwrap();
        fs::write(line.join("direction"), "out").unwrap();
        fs::write(line.join("value"), "0").unwrap();

        let sysfs = Sysfs::new(dir.path());
        let exported = sysfs.export(7, Direction::In, Some(Edge::Both)).unwrap();

        assert!(!exported);
        assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "");
        assert_eq!(sysfs.read_line_attr(7, "direction").unwrap(), "out");
        assert!(!line.join("edge").exists());
    }

    #[test]
    fn export_writes_id_direction_and_edge() {
        let dir = tempfile::tempdir().unwrap();
        control_files(dir.path());
        let root = dir.path().to_path_buf();

        // Stand-in for the kernel: create the line directory once the export
        // file has been written.
        let stop = Arc::new(AtomicBool::new(false));
        let kernel = {
            let stop = stop.clone();
            let root = root.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if fs::read_to_string(root.join("export")).unwrap_or_default() == "12" {
                        let line = root.join("gpio12");
                        fs::create_dir_all(&line).unwrap();
                        fs::write(line.join("direction"), "in").unwrap();
                        fs::write(line.join("edge"), "none").unwrap();
                        fs::write(line.join("value"), "0").unwrap();
                        return;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let sysfs = Sysfs::new(&root);
        let exported = sysfs.export(12, Direction::OutLow, Some(Edge::Rising));
        stop.store(true, Ordering::Relaxed);
        kernel.join().unwrap();

        assert!(exported.unwrap());
        assert_eq!(sysfs.read_line_attr(12, "direction").unwrap(), "low");
        assert_eq!(sysfs.read_line_attr(12, "edge").unwrap(), "rising");
        let mode = fs::metadata(sysfs.value_path(12)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn export_failure_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = Sysfs::new(dir.path().join("missing"));

        let err = sysfs.export(3, Direction::In, None).unwrap_err();
        assert!(matches!(err, GpioError::Config(_)));
        assert!(!sysfs.is_available());
    }

    #[test]
    fn unexport_writes_id() {
        let dir = tempfile::tempdir().unwrap();
        control_files(dir.path());
        let sysfs = Sysfs::new(dir.path());

        sysfs.unexport(21).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("unexport")).unwrap(), "21");
    }
}
