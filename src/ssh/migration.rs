// 已有连接迁移
//
// 迁移分三步并记入 migrations.json：
//   1. staged     片段写入 config/<group>/.<name>.conf.staged 并校验
//   2. commented  主配置中的原 Host 块被注释
//   3. 暂存片段重命名为 <name>.conf，删除日志条目
// 中途失败时，重试或 initialize() 会从记录的阶段继续。

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::constants::layout::MIGRATIONS_FILE;
use crate::services::storage::{write_atomic, ConfigStore};
use crate::services::templates;
use crate::ssh::error::{ManagerError, Result};
use crate::ssh::main_config::MainConfigReconciler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// 暂存片段已写入并校验通过
    Staged,
    /// 主配置中的原条目已注释
    Commented,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub name: String,
    pub to_group: String,
    pub phase: MigrationPhase,
    pub started: String,
}

/// migrations.json
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MigrationJournal {
    #[serde(default)]
    pub pending: Vec<PendingMigration>,
}

impl MigrationJournal {
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// 保存；没有待处理条目时删除文件
    pub async fn save(&self, path: &std::path::Path) -> Result<()> {
        if self.pending.is_empty() {
            return match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        write_atomic(path, &serde_json::to_string_pretty(self)?).await
    }

    pub fn find(&self, name: &str) -> Option<&PendingMigration> {
        self.pending.iter().find(|p| p.name == name)
    }

    fn set_phase(&mut self, name: &str, phase: MigrationPhase) {
        if let Some(entry) = self.pending.iter_mut().find(|p| p.name == name) {
            entry.phase = phase;
        }
    }

    fn remove(&mut self, name: &str) {
        self.pending.retain(|p| p.name != name);
    }
}

/// 迁移执行器，同一时间只执行一个迁移
#[derive(Clone, Debug)]
pub struct Migrator {
    store: ConfigStore,
    main_config: MainConfigReconciler,
    lock: Arc<Mutex<()>>,
}

impl Migrator {
    pub fn new(store: ConfigStore, main_config: MainConfigReconciler) -> Self {
        Self {
            store,
            main_config,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn journal_path(&self) -> PathBuf {
        self.store.settings().root_dir.join(MIGRATIONS_FILE)
    }

    pub async fn pending(&self) -> Result<Vec<PendingMigration>> {
        Ok(MigrationJournal::load(&self.journal_path()).await?.pending)
    }

    /// 开始迁移：记录日志、写暂存片段并校验，然后继续后续步骤
    pub async fn migrate(&self, name: &str, to_group: &str, fragment_text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let journal_path = self.journal_path();
        let mut journal = MigrationJournal::load(&journal_path).await?;
        if let Some(entry) = journal.find(name) {
            return Err(ManagerError::Conflict(format!(
                "migration of '{}' to '{}' is already in progress",
                name, entry.to_group
            )));
        }

        let report = templates::validate(fragment_text);
        if !report.is_valid {
            return Err(ManagerError::Validation(report.errors.join("; ")));
        }

        journal.pending.push(PendingMigration {
            name: name.to_string(),
            to_group: to_group.to_string(),
            phase: MigrationPhase::Staged,
            started: chrono::Local::now().to_rfc3339(),
        });
        journal.save(&journal_path).await?;

        let staged = self.store.staged_path(to_group, name)?;
        self.store.create_group(to_group).await?;
        if let Err(e) = self.stage(&staged, fragment_text).await {
            let _ = tokio::fs::remove_file(&staged).await;
            journal.remove(name);
            journal.save(&journal_path).await?;
            return Err(e);
        }
        info!("[Migration] Staged {} into {}", name, to_group);

        self.advance(&mut journal, name).await
    }

    /// 写入暂存片段并回读校验
    async fn stage(&self, staged: &std::path::Path, text: &str) -> Result<()> {
        write_atomic(staged, text).await?;
        let written = tokio::fs::read_to_string(staged).await?;
        let report = templates::validate(&written);
        if !report.is_valid {
            return Err(ManagerError::Validation(report.errors.join("; ")));
        }
        Ok(())
    }

    /// 从当前阶段继续执行
    async fn advance(&self, journal: &mut MigrationJournal, name: &str) -> Result<()> {
        let journal_path = self.journal_path();
        let Some(entry) = journal.find(name).cloned() else {
            return Ok(());
        };
        let staged = self.store.staged_path(&entry.to_group, name)?;
        let target = self.store.fragment_path(&entry.to_group, name)?;
        let staged_exists = tokio::fs::try_exists(&staged).await?;

        if entry.phase == MigrationPhase::Staged {
            if !staged_exists {
                // 暂存片段未写完，主配置未改动，直接放弃
                warn!("[Migration] Staged fragment for {} missing, dropping", name);
                journal.remove(name);
                return journal.save(&journal_path).await;
            }
            self.main_config.comment_out_host(name).await?;
            journal.set_phase(name, MigrationPhase::Commented);
            journal.save(&journal_path).await?;
        }

        if staged_exists {
            tokio::fs::rename(&staged, &target).await?;
        } else if !tokio::fs::try_exists(&target).await? {
            warn!(
                "[Migration] Neither staged nor final fragment exists for {}",
                name
            );
        }
        journal.remove(name);
        journal.save(&journal_path).await?;
        info!("[Migration] Migrated {} into {}", name, entry.to_group);
        Ok(())
    }

    /// 继续单个未完成的迁移；没有记录时返回 false
    pub async fn resume(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut journal = MigrationJournal::load(&self.journal_path()).await?;
        if journal.find(name).is_none() {
            return Ok(false);
        }
        self.advance(&mut journal, name).await?;
        Ok(true)
    }

    /// 继续所有未完成的迁移，返回完成的名称
    pub async fn resume_all(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut journal = MigrationJournal::load(&self.journal_path()).await?;
        let names: Vec<String> = journal.pending.iter().map(|p| p.name.clone()).collect();
        let mut resumed = Vec::new();
        for name in names {
            match self.advance(&mut journal, &name).await {
                Ok(()) => resumed.push(name),
                Err(e) => warn!("[Migration] Could not resume {}: {}", name, e),
            }
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ManagerSettings;
    use tempfile::TempDir;

    const FRAGMENT: &str = "Host legacy-box\n    HostName 1.2.3.4\n    User root\n";

    async fn create_test_migrator() -> (Migrator, ConfigStore, MainConfigReconciler, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let settings = ManagerSettings::with_root(temp_dir.path());
        let store = ConfigStore::new(settings.clone());
        store.ensure_layout().await.unwrap();
        let main_config = MainConfigReconciler::new(settings);
        tokio::fs::write(
            main_config.path(),
            "Host legacy-box\n    HostName 1.2.3.4\n    User root\n",
        )
        .await
        .unwrap();
        let migrator = Migrator::new(store.clone(), main_config.clone());
        (migrator, store, main_config, temp_dir)
    }

    #[tokio::test]
    async fn test_migrate_completes_all_phases() {
        let (migrator, store, main_config, _temp) = create_test_migrator().await;
        migrator.migrate("legacy-box", "work", FRAGMENT).await.unwrap();

        assert_eq!(
            store.read_fragment("work", "legacy-box").await.unwrap().unwrap(),
            FRAGMENT
        );
        assert!(!tokio::fs::try_exists(store.staged_path("work", "legacy-box").unwrap())
            .await
            .unwrap());
        assert!(migrator.pending().await.unwrap().is_empty());

        let content = main_config.read().await.unwrap().unwrap();
        assert!(content
            .lines()
            .all(|l| l.starts_with("# ") && l.ends_with("# Migrated to SSH Manager")));
    }

    #[tokio::test]
    async fn test_invalid_fragment_leaves_no_trace() {
        let (migrator, store, main_config, _temp) = create_test_migrator().await;
        let err = migrator
            .migrate("legacy-box", "work", "    User root\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
        assert!(migrator.pending().await.unwrap().is_empty());
        assert!(store.read_fragment("work", "legacy-box").await.unwrap().is_none());
        assert!(main_config
            .read()
            .await
            .unwrap()
            .unwrap()
            .starts_with("Host legacy-box"));
    }

    #[tokio::test]
    async fn test_resume_from_staged_phase() {
        let (migrator, store, main_config, _temp) = create_test_migrator().await;

        // 模拟在注释主配置之前中断
        let journal = MigrationJournal {
            pending: vec![PendingMigration {
                name: "legacy-box".to_string(),
                to_group: "work".to_string(),
                phase: MigrationPhase::Staged,
                started: "2024-01-01T00:00:00+00:00".to_string(),
            }],
        };
        journal.save(&migrator.journal_path()).await.unwrap();
        write_atomic(&store.staged_path("work", "legacy-box").unwrap(), FRAGMENT)
            .await
            .unwrap();
        assert!(store.list_fragments(Some("work")).await.unwrap().is_empty());

        let resumed = migrator.resume_all().await.unwrap();
        assert_eq!(resumed, vec!["legacy-box".to_string()]);
        assert!(store.read_fragment("work", "legacy-box").await.unwrap().is_some());
        assert!(main_config
            .read()
            .await
            .unwrap()
            .unwrap()
            .starts_with("# Host legacy-box"));
        assert!(!tokio::fs::try_exists(migrator.journal_path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_from_commented_phase() {
        let (migrator, store, _main_config, _temp) = create_test_migrator().await;
        let journal = MigrationJournal {
            pending: vec![PendingMigration {
                name: "legacy-box".to_string(),
                to_group: "work".to_string(),
                phase: MigrationPhase::Commented,
                started: "2024-01-01T00:00:00+00:00".to_string(),
            }],
        };
        journal.save(&migrator.journal_path()).await.unwrap();
        write_atomic(&store.staged_path("work", "legacy-box").unwrap(), FRAGMENT)
            .await
            .unwrap();

        assert!(migrator.resume("legacy-box").await.unwrap());
        assert!(store.read_fragment("work", "legacy-box").await.unwrap().is_some());
        assert!(!migrator.resume("legacy-box").await.unwrap());
    }

    #[tokio::test]
    async fn test_journal_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let journal = MigrationJournal::load(&temp.path().join("none.json"))
            .await
            .unwrap();
        assert!(journal.pending.is_empty());
    }
}
