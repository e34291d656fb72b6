//! Delivery store: the shared patient/reminder records behind one reader/writer lock.
//!
//! Every lock-holding section is pure in-memory work. Persistence to the JSON
//! data file happens after the lock is released, on a background writer task
//! that always writes the latest snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::delivery::{Patient, Reminder};
use crate::error::StoreError;

/// Patient records keyed by patient id.
pub type PatientMap = HashMap<String, Patient>;

struct Persistence {
    path: PathBuf,
    tx: watch::Sender<Arc<Vec<u8>>>,
    /// Serializes file writes between `flush` and the background writer.
    write_lock: Arc<Mutex<()>>,
}

/// Concurrency-safe repository of patients and their reminders.
pub struct DeliveryStore {
    patients: RwLock<PatientMap>,
    persistence: Option<Persistence>,
}

impl DeliveryStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            patients: RwLock::new(HashMap::new()),
            persistence: None,
        })
    }

    /// Load records from `path` (missing file means empty) and persist
    /// every later mutation back to it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let path = path.as_ref().to_path_buf();
        let patients = load(&path).await?;
        info!(path = %path.display(), patients = patients.len(), "Delivery store loaded");

        let (tx, rx) = watch::channel(Arc::new(Vec::new()));
        let write_lock = Arc::new(Mutex::new(()));
        spawn_writer(path.clone(), rx, write_lock.clone());

        Ok(Arc::new(Self {
            patients: RwLock::new(patients),
            persistence: Some(Persistence {
                path,
                tx,
                write_lock,
            }),
        }))
    }

    /// Run `f` with shared access to all records.
    pub async fn read<R>(&self, f: impl FnOnce(&PatientMap) -> R) -> R {
        let patients = self.patients.read().await;
        f(&patients)
    }

    /// Run `f` with exclusive access to one patient. Returns `None` if the
    /// patient does not exist. Persists when `f` changed the record.
    pub async fn update_patient<R>(
        &self,
        patient_id: &str,
        f: impl FnOnce(&mut Patient) -> R,
    ) -> Option<R> {
        let (result, changed) = {
            let mut patients = self.patients.write().await;
            let patient = patients.get_mut(patient_id)?;
            let before = patient.clone();
            let result = f(patient);
            (result, *patient != before)
        };

        if changed {
            self.persist().await;
        }
        Some(result)
    }

    /// Insert or replace a patient record.
    pub async fn insert_patient(&self, patient: Patient) {
        {
            let mut patients = self.patients.write().await;
            patients.insert(patient.id.clone(), patient);
        }
        self.persist().await;
    }

    /// Attach a reminder to an existing patient. Returns false if the patient is unknown.
    pub async fn add_reminder(&self, patient_id: &str, reminder: Reminder) -> bool {
        self.update_patient(patient_id, |p| p.reminders.push(reminder))
            .await
            .is_some()
    }

    pub async fn get_patient(&self, patient_id: &str) -> Option<Patient> {
        self.read(|patients| patients.get(patient_id).cloned()).await
    }

    pub async fn get_reminder(&self, patient_id: &str, reminder_id: &str) -> Option<Reminder> {
        self.read(|patients| {
            patients
                .get(patient_id)
                .and_then(|p| p.reminder(reminder_id))
                .cloned()
        })
        .await
    }

    /// Locate a reminder by the id the gateway assigned to its message.
    /// Linear scan over every reminder.
    pub async fn find_by_gateway_message_id(&self, message_id: &str) -> Option<(String, String)> {
        self.read(|patients| {
            patients.values().find_map(|p| {
                p.reminders
                    .iter()
                    .find(|r| r.gateway_message_id.as_deref() == Some(message_id))
                    .map(|r| (p.id.clone(), r.id.clone()))
            })
        })
        .await
    }

    /// Clone of every patient record.
    pub async fn snapshot(&self) -> Vec<Patient> {
        self.read(|patients| patients.values().cloned().collect())
            .await
    }

    /// Write the current records to disk now, bypassing the background writer.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let _guard = persistence.write_lock.lock().await;
        let bytes = self.serialize().await?;
        write_atomic(&persistence.path, &bytes).await
    }

    async fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let patients = self.patients.read().await;
        let ordered: BTreeMap<&String, &Patient> = patients.iter().collect();
        Ok(serde_json::to_vec_pretty(&ordered)?)
    }

    /// Hand the latest snapshot to the background writer. Failures are logged only.
    async fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match self.serialize().await {
            Ok(bytes) => {
                let _ = persistence.tx.send(Arc::new(bytes));
            }
            Err(e) => warn!(error = %e, "Failed to serialize delivery store"),
        }
    }
}

async fn load(path: &Path) -> Result<PatientMap, StoreError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_slice(&data)?)
}

fn spawn_writer(path: PathBuf, mut rx: watch::Receiver<Arc<Vec<u8>>>, write_lock: Arc<Mutex<()>>) {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            // Borrow under the lock so an older snapshot never replaces a flush.
            let _guard = write_lock.lock().await;
            let bytes = rx.borrow_and_update().clone();
            match write_atomic(&path, &bytes).await {
                Ok(()) => debug!(path = %path.display(), bytes = bytes.len(), "Delivery store saved"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to save delivery store"),
            }
        }
    });
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
