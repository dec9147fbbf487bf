//! System identity read from local files

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use async_trait::async_trait;
use iam_server::{IdentHandler, ServiceError, SubjectsObserver};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::FileIdentifierConfig;

/// [`IdentHandler`] serving the system ID, unit model and subjects from files
pub struct FileIdentifier {
    system_id: String,
    unit_model: String,
    subjects_path: Option<PathBuf>,
    subjects: RwLock<Vec<String>>,
    observers: Mutex<Vec<Weak<dyn SubjectsObserver>>>,
}

impl FileIdentifier {
    /// Read the identity files
    ///
    /// The system ID and unit model files must exist. A missing subjects
    /// file yields no subjects.
    pub fn new(config: &FileIdentifierConfig) -> Result<Self, ServiceError> {
        let system_id = read_trimmed(&config.system_id_path)?;
        let unit_model = read_trimmed(&config.unit_model_path)?;
        let subjects = read_subjects(config.subjects_path.as_deref());

        info!(
            system_id = %system_id,
            unit_model = %unit_model,
            subjects = subjects.len(),
            "File identifier loaded"
        );

        Ok(Self {
            system_id,
            unit_model,
            subjects_path: config.subjects_path.clone(),
            subjects: RwLock::new(subjects),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Re-read the subjects file and notify observers when it changed
    ///
    /// Returns whether the subjects changed.
    pub fn reload_subjects(&self) -> bool {
        let subjects = read_subjects(self.subjects_path.as_deref());

        {
            let mut current = self.subjects.write();
            if *current == subjects {
                return false;
            }
            *current = subjects.clone();
        }

        debug!(count = subjects.len(), "Subjects changed");

        let observers: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };

        for observer in observers {
            observer.subjects_changed(&subjects);
        }

        true
    }
}

#[async_trait]
impl IdentHandler for FileIdentifier {
    async fn get_system_id(&self) -> Result<String, ServiceError> {
        Ok(self.system_id.clone())
    }

    async fn get_unit_model(&self) -> Result<String, ServiceError> {
        Ok(self.unit_model.clone())
    }

    async fn get_subjects(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.subjects.read().clone())
    }

    fn subscribe_subjects_changed(&self, observer: Weak<dyn SubjectsObserver>) {
        self.observers.lock().push(observer);
    }
}

fn read_trimmed(path: &Path) -> Result<String, ServiceError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ServiceError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(ServiceError::failed(format!(
            "read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn read_subjects(path: Option<&Path>) -> Vec<String> {
    let Some(path) = path else {
        return Vec::new();
    };

    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Can't read subjects file, using empty subjects");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl SubjectsObserver for Recorder {
        fn subjects_changed(&self, subjects: &[String]) {
            self.seen.lock().push(subjects.to_vec());
        }
    }

    fn config(dir: &TempDir, subjects: Option<&str>) -> FileIdentifierConfig {
        std::fs::write(dir.path().join("system-id"), "sys-1\n").expect("write");
        std::fs::write(dir.path().join("unit-model"), "model;1.0\n").expect("write");

        let subjects_path = subjects.map(|text| {
            let path = dir.path().join("subjects");
            std::fs::write(&path, text).expect("write");
            path
        });

        FileIdentifierConfig {
            system_id_path: dir.path().join("system-id"),
            unit_model_path: dir.path().join("unit-model"),
            subjects_path,
        }
    }

    #[tokio::test]
    async fn identity_is_read_from_files() {
        let dir = TempDir::new().expect("tempdir");
        let identifier =
            FileIdentifier::new(&config(&dir, Some("subject1\n\nsubject2\n"))).expect("identifier");

        assert_eq!(identifier.get_system_id().await.expect("id"), "sys-1");
        assert_eq!(identifier.get_unit_model().await.expect("model"), "model;1.0");
        assert_eq!(
            identifier.get_subjects().await.expect("subjects"),
            vec!["subject1", "subject2"]
        );
    }

    #[tokio::test]
    async fn missing_subjects_file_means_no_subjects() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = config(&dir, None);
        config.subjects_path = Some(dir.path().join("absent"));

        let identifier = FileIdentifier::new(&config).expect("identifier");
        assert!(identifier.get_subjects().await.expect("subjects").is_empty());
    }

    #[test]
    fn missing_system_id_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = config(&dir, None);
        config.system_id_path = dir.path().join("absent");

        assert!(matches!(
            FileIdentifier::new(&config),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn reload_notifies_live_observers_on_change() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir, Some("a\n"));
        let identifier = FileIdentifier::new(&config).expect("identifier");

        let recorder = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&recorder);
        let observer: Weak<dyn SubjectsObserver> = weak;
        identifier.subscribe_subjects_changed(observer);

        assert!(!identifier.reload_subjects());

        let path = config.subjects_path.as_ref().expect("path");
        std::fs::write(path, "a\nb\n").expect("write");
        assert!(identifier.reload_subjects());

        assert_eq!(
            *recorder.seen.lock(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );

        drop(recorder);
        std::fs::write(path, "c\n").expect("write");
        assert!(identifier.reload_subjects());
        assert!(identifier.observers.lock().is_empty());
    }
}
