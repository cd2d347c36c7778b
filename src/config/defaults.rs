//! First-run defaults and the host facts bootstrap depends on.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::validate::{HashSelection, ReportChannel, Verbosity};

pub const DEFAULT_BACKEND_NAME: &str = "tkbackend";
pub const DEFAULT_COLLECTION_SERVICE: &str = "tracekeep";
pub const DEFAULT_WORKER_THREADS: u32 = 4;
pub const DEFAULT_VERBOSITY: Verbosity = Verbosity::Trace;
pub const DEFAULT_REPORT_CHANNELS: [ReportChannel; 2] =
    [ReportChannel::EventLog, ReportChannel::DebugEvents];
pub const DEFAULT_CONFIG_FILE_NAME: &str = "tracekeep_config.xml";
pub const DEFAULT_BACKEND_CONFIG_FILE_NAME: &str = "tkbackend_config.xml";
pub const DEFAULT_LOG_FILE_NAME: &str = "tracekeep.log";
pub const BLOB_LOCATION: &str = "SOFTWARE\\TraceKeep";
pub const BLOB_VALUE_NAME: &str = "RuntimeConfig";
const SECURE_DIR_NAME: &str = "TraceKeep";

const CONFIG_HEADER: &str = "<TraceConfig schemaversion=\"1.0\">\n";
const CONFIG_TAIL: &str = "</TraceConfig>\n";
const COLLECTION_FILTERING: &str = concat!(
    "   <EventFiltering>\n",
    "      <ProcessCreate onmatch=\"exclude\"/>\n",
    "      <ProcessTerminate onmatch=\"exclude\"/>\n",
    "      <ImageLoad onmatch=\"include\"/>\n",
    "      <NetworkConnect onmatch=\"include\"/>\n",
    "   </EventFiltering>\n",
);
const BACKEND_FILTERING: &str = concat!(
    "   <EventFiltering>\n",
    "      <ProcessCreate onmatch=\"exclude\"/>\n",
    "      <FileCreateTime onmatch=\"include\"/>\n",
    "      <ProcessTerminate onmatch=\"exclude\"/>\n",
    "      <DriverLoad onmatch=\"include\"/>\n",
    "   </EventFiltering>\n",
);

/// The 32- and 64-bit backend image names derived from a backend name.
pub fn backend_names(name: &str) -> (String, String) {
    (format!("{name}32.exe"), format!("{name}64.exe"))
}

/// Host locations bootstrap may fall back on.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Parent under which a fresh secure working directory is created.
    pub secure_base: Option<PathBuf>,
    /// Last-resort working directory.
    pub system_root: PathBuf,
}

impl HostPaths {
    pub fn detect() -> Self {
        let system_root = std::env::var_os("SystemRoot")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    PathBuf::from(r"C:\Windows")
                } else {
                    PathBuf::from("/var/lib")
                }
            });
        Self {
            secure_base: dirs::data_local_dir(),
            system_root,
        }
    }

    pub fn with_secure_base(mut self, base: PathBuf) -> Self {
        self.secure_base = Some(base);
        self
    }

    /// Create (or reuse) the agent's owner-only working directory.
    pub fn create_secure_dir(&self) -> Option<PathBuf> {
        let dir = self.secure_base.as_ref()?.join(SECURE_DIR_NAME);
        match create_private_dir(&dir) {
            Ok(()) if dir.is_dir() => Some(dir),
            Ok(()) => None,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "secure working directory unavailable");
                None
            }
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn render_config(hash: &HashSelection, revocation: bool, filtering: &str) -> String {
    let mut out = String::from(CONFIG_HEADER);
    out.push_str(&format!("   <HashAlgorithms>{hash}</HashAlgorithms>\n"));
    if revocation {
        out.push_str("   <CheckRevocation/>\n");
    }
    out.push_str(filtering);
    out.push_str(CONFIG_TAIL);
    out
}

fn write_config(path: PathBuf, content: &str) -> std::io::Result<PathBuf> {
    let mut file = std::fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    debug!(path = %path.display(), "configuration file generated");
    Ok(path)
}

/// Write the default collection-service configuration file into `dir`.
pub fn generate_collection_config(
    dir: &Path,
    hash: &HashSelection,
    revocation: bool,
) -> std::io::Result<PathBuf> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }
    write_config(
        dir.join(DEFAULT_CONFIG_FILE_NAME),
        &render_config(hash, revocation, COLLECTION_FILTERING),
    )
}

/// Write the backend configuration file into `dir`.
pub fn generate_backend_config(
    dir: &Path,
    hash: &HashSelection,
    revocation: bool,
) -> std::io::Result<PathBuf> {
    write_config(
        dir.join(DEFAULT_BACKEND_CONFIG_FILE_NAME),
        &render_config(hash, revocation, BACKEND_FILTERING),
    )
}
