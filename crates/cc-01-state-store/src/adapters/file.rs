use crate::domain::{Result, StateError, VersionedState};
use crate::ports::StatePersistence;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const STATE_MAGIC: &[u8; 4] = b"CCST";

/// On-disk format version of the state file.
pub const STATE_FILE_VERSION: u32 = 1;

/// Single-file persistence.
///
/// Layout: `[magic:4][version:u32][crc32:u32][len:u64][bincode state]`.
/// Written atomically via a temp file and rename.
pub struct FileStatePersistence {
    path: PathBuf,
}

impl FileStatePersistence {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatePersistence for FileStatePersistence {
    fn load(&self) -> Result<Option<VersionedState>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[cc-01] no existing state file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < 20 || &bytes[..4] != STATE_MAGIC {
            return Err(StateError::Corrupted("bad state file header".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != STATE_FILE_VERSION {
            return Err(StateError::VersionMismatch {
                found: version,
                supported: STATE_FILE_VERSION,
            });
        }
        let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[12..20]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let body = bytes
            .get(20..20 + len)
            .ok_or_else(|| StateError::Corrupted("truncated state file".into()))?;
        if crc32fast::hash(body) != crc {
            return Err(StateError::Corrupted("state file checksum mismatch".into()));
        }
        let state: VersionedState = bincode::deserialize(body)?;
        info!(
            "[cc-01] loaded {} rows at revision {} from {}",
            state.row_count(),
            state.revision(),
            self.path.display()
        );
        Ok(Some(state))
    }

    fn save(&self, state: &VersionedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = bincode::serialize(state)?;
        let mut bytes = Vec::with_capacity(body.len() + 20);
        bytes.extend_from_slice(STATE_MAGIC);
        bytes.extend_from_slice(&STATE_FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&body);

        let temp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
