//! System control boundary
//!
//! Display modes are also tracked by a system service, which owns the boot environment and the
//! sysfs nodes of the display driver. [`SystemControl`] is the interface to it.
//! [`MemorySystemControl`] keeps everything in memory, [`SysfsSystemControl`] talks to the
//! sysfs nodes directly.
//!
//! Callers treat failures as "no change".

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::trace;

/// Boot environment key of the user selected HDMI mode
pub const ENV_HDMI_MODE: &str = "ubootenv.var.hdmimode";
/// Boot environment key of the user selected CVBS mode
pub const ENV_CVBS_MODE: &str = "ubootenv.var.cvbsmode";
/// Boot environment key selecting the best mode over the user mode
pub const ENV_BEST_MODE: &str = "ubootenv.var.is.bestmode";

/// Synchronous interface to the system control service
pub trait SystemControl: fmt::Debug + Send + Sync {
    /// Name of the mode currently driven
    fn active_mode(&self) -> io::Result<String>;
    /// Records the mode currently driven
    fn set_active_mode(&self, mode: &str) -> io::Result<()>;
    /// Names of the modes the display driver offers
    fn display_modes(&self) -> io::Result<Vec<String>>;
    /// Reads a sysfs style key
    fn read_sysfs(&self, key: &str) -> io::Result<String>;
    /// Writes a sysfs style key
    fn write_sysfs(&self, key: &str, value: &str) -> io::Result<()>;
    /// Reads a boot environment variable
    fn boot_env(&self, key: &str) -> io::Result<Option<String>>;
    /// Writes a boot environment variable
    fn set_boot_env(&self, key: &str, value: &str) -> io::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    active_mode: Option<String>,
    display_modes: Vec<String>,
    sysfs: HashMap<String, String>,
    boot_env: HashMap<String, String>,
}

/// System control state kept in memory
#[derive(Debug, Default)]
pub struct MemorySystemControl {
    state: Mutex<MemoryState>,
}

impl MemorySystemControl {
    /// Empty state, no active mode
    pub fn new() -> MemorySystemControl {
        MemorySystemControl::default()
    }

    /// Presets a boot environment variable
    pub fn with_boot_env(self, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .boot_env
            .insert(key.to_owned(), value.to_owned());
        self
    }

    /// Presets the modes reported by [`SystemControl::display_modes`]
    pub fn with_display_modes<I: IntoIterator<Item = S>, S: Into<String>>(self, modes: I) -> Self {
        self.state.lock().unwrap().display_modes = modes.into_iter().map(Into::into).collect();
        self
    }
}

fn not_found(key: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} is not set", key))
}

impl SystemControl for MemorySystemControl {
    fn active_mode(&self) -> io::Result<String> {
        self.state
            .lock()
            .unwrap()
            .active_mode
            .clone()
            .ok_or_else(|| not_found("active mode"))
    }

    fn set_active_mode(&self, mode: &str) -> io::Result<()> {
        trace!(mode, "Active mode recorded");
        self.state.lock().unwrap().active_mode = Some(mode.to_owned());
        Ok(())
    }

    fn display_modes(&self) -> io::Result<Vec<String>> {
        Ok(self.state.lock().unwrap().display_modes.clone())
    }

    fn read_sysfs(&self, key: &str) -> io::Result<String> {
        self.state
            .lock()
            .unwrap()
            .sysfs
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    fn write_sysfs(&self, key: &str, value: &str) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .sysfs
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn boot_env(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.state.lock().unwrap().boot_env.get(key).cloned())
    }

    fn set_boot_env(&self, key: &str, value: &str) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .boot_env
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// System control through the display driver's sysfs nodes
///
/// Keys are paths relative to the sysfs root. The boot environment is not reachable this way,
/// it reads as unset and can not be written.
#[derive(Debug, Clone)]
pub struct SysfsSystemControl {
    root: PathBuf,
}

impl Default for SysfsSystemControl {
    fn default() -> Self {
        SysfsSystemControl::new("/sys")
    }
}

impl SysfsSystemControl {
    /// Display mode node
    pub const MODE: &'static str = "class/display/mode";
    /// Mode list node of the HDMI transmitter
    pub const DISPLAY_MODES: &'static str = "class/amhdmitx/amhdmitx0/disp_cap";

    /// Uses the sysfs tree below `root`
    pub fn new(root: impl AsRef<Path>) -> SysfsSystemControl {
        SysfsSystemControl {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl SystemControl for SysfsSystemControl {
    fn active_mode(&self) -> io::Result<String> {
        self.read_sysfs(Self::MODE)
    }

    fn set_active_mode(&self, mode: &str) -> io::Result<()> {
        self.write_sysfs(Self::MODE, mode)
    }

    fn display_modes(&self) -> io::Result<Vec<String>> {
        let modes = self.read_sysfs(Self::DISPLAY_MODES)?;
        // the preferred mode carries a trailing '*'
        Ok(modes
            .lines()
            .map(|line| line.trim().trim_end_matches('*').to_owned())
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn read_sysfs(&self, key: &str) -> io::Result<String> {
        Ok(fs::read_to_string(self.path(key))?.trim().to_owned())
    }

    fn write_sysfs(&self, key: &str, value: &str) -> io::Result<()> {
        fs::write(self.path(key), value)
    }

    fn boot_env(&self, _key: &str) -> io::Result<Option<String>> {
        Ok(None)
    }

    fn set_boot_env(&self, _key: &str, _value: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "boot environment not reachable through sysfs",
        ))
    }
}
