use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::errors::Result;
use crate::models::PersistentStatus;

/// The four durable keys. Together they are the entire crash-recovery
/// contract: nothing else survives a process restart.
pub const KEY_PERSISTENT_STATUS: &str = "persistent_status";
pub const KEY_INSTALLING_AB_ID: &str = "installing_ab_id";
pub const KEY_NEEDS_REBOOT_ID: &str = "needs_reboot_id";
pub const KEY_SUSPENDED_AB_ID: &str = "suspended_ab_id";

pub trait StatusQueries {
    fn persistent_status(&self) -> Result<PersistentStatus>;
    fn set_persistent_status(&self, status: PersistentStatus) -> Result<()>;

    fn installing_ab_id(&self) -> Result<Option<String>>;
    fn set_installing_ab_id(&self, download_id: &str) -> Result<()>;
    fn clear_installing_ab_id(&self) -> Result<()>;

    fn needs_reboot_id(&self) -> Result<Option<String>>;
    fn set_needs_reboot_id(&self, download_id: &str) -> Result<()>;
    fn clear_needs_reboot_id(&self) -> Result<()>;

    fn suspended_ab_id(&self) -> Result<Option<String>>;
    fn set_suspended_ab_id(&self, download_id: &str) -> Result<()>;
    fn clear_suspended_ab_id(&self) -> Result<()>;
}

impl Database {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl StatusQueries for Database {
    fn persistent_status(&self) -> Result<PersistentStatus> {
        Ok(self
            .get_setting(KEY_PERSISTENT_STATUS)?
            .map(|value| PersistentStatus::parse(&value))
            .unwrap_or(PersistentStatus::Unknown))
    }

    fn set_persistent_status(&self, status: PersistentStatus) -> Result<()> {
        self.set_setting(KEY_PERSISTENT_STATUS, status.as_str())
    }

    fn installing_ab_id(&self) -> Result<Option<String>> {
        self.get_setting(KEY_INSTALLING_AB_ID)
    }

    fn set_installing_ab_id(&self, download_id: &str) -> Result<()> {
        self.set_setting(KEY_INSTALLING_AB_ID, download_id)
    }

    fn clear_installing_ab_id(&self) -> Result<()> {
        self.delete_setting(KEY_INSTALLING_AB_ID)
    }

    fn needs_reboot_id(&self) -> Result<Option<String>> {
        self.get_setting(KEY_NEEDS_REBOOT_ID)
    }

    fn set_needs_reboot_id(&self, download_id: &str) -> Result<()> {
        self.set_setting(KEY_NEEDS_REBOOT_ID, download_id)
    }

    fn clear_needs_reboot_id(&self) -> Result<()> {
        self.delete_setting(KEY_NEEDS_REBOOT_ID)
    }

    fn suspended_ab_id(&self) -> Result<Option<String>> {
        self.get_setting(KEY_SUSPENDED_AB_ID)
    }

    fn set_suspended_ab_id(&self, download_id: &str) -> Result<()> {
        self.set_setting(KEY_SUSPENDED_AB_ID, download_id)
    }

    fn clear_suspended_ab_id(&self) -> Result<()> {
        self.delete_setting(KEY_SUSPENDED_AB_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_db() -> (Database, PathBuf) {
        let dir = std::env::temp_dir().join(format!("ota-updater-db-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("updater.db");
        (Database::open(&path).expect("open database"), dir)
    }

    #[test]
    fn persistent_status_defaults_to_unknown() {
        let (db, dir) = temp_db();
        assert_eq!(
            db.persistent_status().expect("read status"),
            PersistentStatus::Unknown
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn persistent_status_survives_reopen() {
        let (db, dir) = temp_db();
        let path = db.path().clone();
        db.set_persistent_status(PersistentStatus::Verified)
            .expect("write status");
        drop(db);

        let reopened = Database::open(&path).expect("reopen database");
        assert_eq!(
            reopened.persistent_status().expect("read status"),
            PersistentStatus::Verified
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn marker_keys_set_and_clear() {
        let (db, dir) = temp_db();
        assert_eq!(db.installing_ab_id().expect("read"), None);

        db.set_installing_ab_id("u1").expect("write");
        assert_eq!(db.installing_ab_id().expect("read"), Some("u1".to_string()));
        db.clear_installing_ab_id().expect("clear");
        assert_eq!(db.installing_ab_id().expect("read"), None);

        db.set_needs_reboot_id("u1").expect("write");
        db.set_suspended_ab_id("u1").expect("write");
        assert_eq!(db.needs_reboot_id().expect("read"), Some("u1".to_string()));
        assert_eq!(db.suspended_ab_id().expect("read"), Some("u1".to_string()));
        let _ = std::fs::remove_dir_all(dir);
    }
}
