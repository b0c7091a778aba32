//! Persistent schedule storage. Default implementation is a single JSON
//! file keyed by schedule id, written atomically (spec.md §4.6: "Persistent
//! `ScheduleStorage` keyed by id (JSON file by default, single-writer)").

use crate::error::CronResult;
use crate::schedule::{Schedule, ScheduleId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[async_trait]
pub trait ScheduleStorage: Send + Sync {
    async fn load_all(&self) -> CronResult<HashMap<ScheduleId, Schedule>>;
    async fn save(&self, schedule: &Schedule) -> CronResult<()>;
    async fn delete(&self, id: ScheduleId) -> CronResult<()>;
}

/// JSON-file-backed storage. All writes go through a single in-process
/// mutex (the "single-writer" requirement); the file itself is replaced
/// via write-then-rename so a crash mid-write cannot corrupt it.
pub struct JsonFileScheduleStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileScheduleStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> CronResult<HashMap<ScheduleId, Schedule>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &HashMap<ScheduleId, Schedule>) -> CronResult<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStorage for JsonFileScheduleStorage {
    async fn load_all(&self) -> CronResult<HashMap<ScheduleId, Schedule>> {
        self.read_map().await
    }

    async fn save(&self, schedule: &Schedule) -> CronResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(schedule.id, schedule.clone());
        self.write_map(&map).await
    }

    async fn delete(&self, id: ScheduleId) -> CronResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.remove(&id);
        self.write_map(&map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;

    #[tokio::test]
    async fn round_trips_through_the_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileScheduleStorage::new(dir.path().join("schedules.json"));

        let schedule = Schedule::new("nightly", "0 0 * * *", "workflow.yaml");
        storage.save(&schedule).await.unwrap();

        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&schedule.id].name, "nightly");

        storage.delete(schedule.id).await.unwrap();
        let loaded = storage.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileScheduleStorage::new(dir.path().join("does-not-exist.json"));
        let loaded = storage.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }
}
