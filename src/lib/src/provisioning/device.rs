/// Registered devices
///
/// The registry is the authority on which serial numbers may obtain a
/// certificate. The provisioning service only reads it; devices are entered
/// by an administrator ahead of first boot.
use crate::error::PkiError;
use crate::secure_file;
use crate::store::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use uuid::Uuid;

/// A device known to the registry
///
/// Serial numbers are typically:
/// - Factory serials (e.g., "EM-2024-001234")
/// - Simulator names (e.g., "central_simulada_01")
/// - MAC addresses (e.g., "00:1A:2B:3C:4D:5E")
///
/// The serial doubles as the certificate common name and as the file stem
/// of the device's stored identity, so it is restricted to
/// `[A-Za-z0-9-_:.]` and 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Internal identifier
    pub id: Uuid,
    pub serial_number: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceRecord {
    /// Create a record with a fresh identifier.
    pub fn new(serial_number: impl Into<String>) -> Result<Self, PkiError> {
        let serial_number = serial_number.into();
        validate_serial(&serial_number)?;
        Ok(Self {
            id: Uuid::new_v4(),
            serial_number,
            name: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}, {})", self.serial_number, name, self.id),
            None => write!(f, "{} ({})", self.serial_number, self.id),
        }
    }
}

/// Check serial number format
///
/// Checks that the serial:
/// - Is not empty
/// - Is not too long (max 64 chars)
/// - Contains only safe characters (ASCII alphanumeric, dash, underscore, colon, dot)
pub fn validate_serial(serial: &str) -> Result<(), PkiError> {
    validate_name(serial)
        .map_err(|e| PkiError::InvalidArgument(format!("invalid serial number: {}", e)))
}

/// Lookup of registered devices by serial number
pub trait DeviceRegistry: Send + Sync {
    /// The record for `serial_number`, or `None` if it is not registered.
    fn find_by_serial(&self, serial_number: &str) -> Result<Option<DeviceRecord>, PkiError>;
}

/// Registry held in memory
#[derive(Default)]
pub struct MemoryDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `serials`
    pub fn with_serials<I, S>(serials: I) -> Result<Self, PkiError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for serial in serials {
            registry.register(DeviceRecord::new(serial)?)?;
        }
        Ok(registry)
    }

    pub fn register(&self, record: DeviceRecord) -> Result<(), PkiError> {
        validate_serial(&record.serial_number)?;
        let mut devices = self
            .devices
            .write()
            .map_err(|_| PkiError::InternalError("registry lock poisoned".to_string()))?;
        devices.insert(record.serial_number.clone(), record);
        Ok(())
    }
}

impl DeviceRegistry for MemoryDeviceRegistry {
    fn find_by_serial(&self, serial_number: &str) -> Result<Option<DeviceRecord>, PkiError> {
        let devices = self
            .devices
            .read()
            .map_err(|_| PkiError::InternalError("registry lock poisoned".to_string()))?;
        Ok(devices.get(serial_number).cloned())
    }
}

/// Registry persisted as a JSON array of records
///
/// ```json
/// [{"id": "3f0e...", "serialNumber": "central_simulada_01", "name": "Simulator"}]
/// ```
///
/// Lookups follow the file: a changed modification time or size, or a
/// serial that is not in the cached copy, makes the next lookup re-read it.
/// A device registered by another process is visible to a running server
/// without a restart.
pub struct JsonDeviceRegistry {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

struct Snapshot {
    devices: Vec<DeviceRecord>,
    stamp: Option<FileStamp>,
}

impl Snapshot {
    fn find(&self, serial_number: &str) -> Option<DeviceRecord> {
        self.devices
            .iter()
            .find(|d| d.serial_number == serial_number)
            .cloned()
    }
}

fn poisoned() -> PkiError {
    PkiError::InternalError("registry lock poisoned".to_string())
}

impl JsonDeviceRegistry {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PkiError> {
        let path = path.into();
        let snapshot = Self::read_snapshot(&path)?;
        log::debug!(
            "Loaded {} registered devices from {}",
            snapshot.devices.len(),
            path.display()
        );
        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
        })
    }

    fn stamp(path: &Path) -> Result<Option<FileStamp>, PkiError> {
        match std::fs::metadata(path) {
            Ok(metadata) => Ok(Some(FileStamp {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_file(path: &Path) -> Result<Vec<DeviceRecord>, PkiError> {
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                PkiError::ConfigError(format!("invalid registry {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stamp first, so a write landing between the two reads is picked up
    /// by the next lookup.
    fn read_snapshot(path: &Path) -> Result<Snapshot, PkiError> {
        let stamp = Self::stamp(path)?;
        let devices = Self::read_file(path)?;
        Ok(Snapshot { devices, stamp })
    }

    /// Re-read the file.
    pub fn reload(&self) -> Result<(), PkiError> {
        let fresh = Self::read_snapshot(&self.path)?;
        let mut snapshot = self.snapshot.write().map_err(|_| poisoned())?;
        if snapshot.devices.len() != fresh.devices.len() {
            log::info!(
                "Registry {} now lists {} devices",
                self.path.display(),
                fresh.devices.len()
            );
        }
        *snapshot = fresh;
        Ok(())
    }

    fn is_stale(&self) -> Result<bool, PkiError> {
        let current = Self::stamp(&self.path)?;
        let snapshot = self.snapshot.read().map_err(|_| poisoned())?;
        Ok(snapshot.stamp != current)
    }

    /// Add or replace the record for its serial number and rewrite the file.
    ///
    /// Starts from the file's current contents, so records added through
    /// other handles are kept.
    pub fn register(&self, record: DeviceRecord) -> Result<(), PkiError> {
        validate_serial(&record.serial_number)?;
        let mut snapshot = self.snapshot.write().map_err(|_| poisoned())?;

        let mut updated = Self::read_file(&self.path)?;
        updated.retain(|d| d.serial_number != record.serial_number);
        updated.push(record);

        let json = serde_json::to_vec_pretty(&updated)
            .map_err(|e| PkiError::InternalError(format!("cannot encode registry: {}", e)))?;
        secure_file::write_atomic(&self.path, &json)?;
        *snapshot = Snapshot {
            devices: updated,
            stamp: Self::stamp(&self.path)?,
        };
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().map(|s| s.devices.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRegistry for JsonDeviceRegistry {
    fn find_by_serial(&self, serial_number: &str) -> Result<Option<DeviceRecord>, PkiError> {
        if self.is_stale()? {
            self.reload()?;
        }
        if let Some(record) = self.snapshot.read().map_err(|_| poisoned())?.find(serial_number) {
            return Ok(Some(record));
        }

        // The stamp can miss a rewrite within the filesystem's timestamp
        // granularity that kept the same size
        self.reload()?;
        Ok(self
            .snapshot
            .read()
            .map_err(|_| poisoned())?
            .find(serial_number))
    }
}
