// 备份归档
//
// 归档内容：
//   config/<group>/<name>.conf   所有受管片段
//   ssh_config                   主配置副本（存在时）
//   manifest.json                清单
// 私钥不会被打包。

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::constants::{layout, BACKUP_MANIFEST_VERSION};
use crate::models::{BackupManifest, BackupSummary, ManifestConnection};
use crate::services::storage::FragmentEntry;
use crate::ssh::error::{ManagerError, Result};

/// 归档内主配置副本的文件名
pub const MAIN_CONFIG_ENTRY: &str = "ssh_config";
pub const MANIFEST_ENTRY: &str = "manifest.json";

fn zip_error(e: zip::result::ZipError) -> ManagerError {
    ManagerError::Backup(e.to_string())
}

/// 构建清单
pub fn build_manifest(fragments: &[FragmentEntry], groups: &[String]) -> BackupManifest {
    BackupManifest {
        version: BACKUP_MANIFEST_VERSION.to_string(),
        created: chrono::Local::now().to_rfc3339(),
        platform: std::env::consts::OS.to_string(),
        connections: fragments
            .iter()
            .map(|f| ManifestConnection {
                name: f.name.clone(),
                group: f.group.clone(),
            })
            .collect(),
        groups: groups.to_vec(),
    }
}

fn write_archive(
    destination: &Path,
    fragments: &[FragmentEntry],
    main_config: Option<&Path>,
    manifest: &BackupManifest,
) -> Result<bool> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(destination)?;
    let mut writer = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for fragment in fragments {
        let content = std::fs::read(&fragment.path)?;
        let entry = format!(
            "{}/{}/{}.{}",
            layout::CONFIG_DIR,
            fragment.group,
            fragment.name,
            layout::FRAGMENT_EXT
        );
        writer.start_file(entry, options).map_err(zip_error)?;
        writer.write_all(&content)?;
    }

    let mut includes_main_config = false;
    if let Some(path) = main_config {
        match std::fs::read(path) {
            Ok(content) => {
                writer
                    .start_file(MAIN_CONFIG_ENTRY, options)
                    .map_err(zip_error)?;
                writer.write_all(&content)?;
                includes_main_config = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("[Backup] Main config {} not found, skipped", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }

    writer
        .start_file(MANIFEST_ENTRY, options)
        .map_err(zip_error)?;
    writer.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;
    writer.finish().map_err(zip_error)?;
    Ok(includes_main_config)
}

/// 写出备份归档
pub async fn create_archive(
    destination: PathBuf,
    fragments: Vec<FragmentEntry>,
    groups: Vec<String>,
    main_config: Option<PathBuf>,
) -> Result<BackupSummary> {
    let manifest = build_manifest(&fragments, &groups);
    let connections = manifest.connections.len();
    let target = destination.clone();
    let includes_main_config = tokio::task::spawn_blocking(move || {
        let result = write_archive(&target, &fragments, main_config.as_deref(), &manifest);
        if result.is_err() {
            let _ = std::fs::remove_file(&target);
        }
        result
    })
    .await
    .map_err(|e| ManagerError::Io(std::io::Error::other(e)))??;

    let summary = BackupSummary {
        path: destination.to_string_lossy().to_string(),
        connections,
        groups: groups.len(),
        includes_main_config,
    };
    info!(
        "[Backup] Wrote {} ({} connections, {} groups)",
        summary.path, summary.connections, summary.groups
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> String {
        let mut entry = archive.by_name(name).unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        content
    }

    #[tokio::test]
    async fn test_archive_contents() {
        let temp = TempDir::new().unwrap();
        let fragment_path = temp.path().join("web.conf");
        std::fs::write(&fragment_path, "Host web\n    HostName 10.0.0.1\n").unwrap();
        let main_config = temp.path().join("ssh_config");
        std::fs::write(&main_config, "Include /x/config/*/*.conf\n").unwrap();

        let fragments = vec![FragmentEntry {
            group: "work/clients".to_string(),
            name: "web".to_string(),
            path: fragment_path,
        }];
        let destination = temp.path().join("out").join("backup.zip");
        let summary = create_archive(
            destination.clone(),
            fragments,
            vec!["work".to_string(), "work/clients".to_string()],
            Some(main_config),
        )
        .await
        .unwrap();

        assert_eq!(summary.connections, 1);
        assert_eq!(summary.groups, 2);
        assert!(summary.includes_main_config);

        let mut archive = ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
        assert!(read_entry(&mut archive, "config/work/clients/web.conf").contains("HostName 10.0.0.1"));
        assert!(read_entry(&mut archive, MAIN_CONFIG_ENTRY).starts_with("Include"));

        let manifest: BackupManifest =
            serde_json::from_str(&read_entry(&mut archive, MANIFEST_ENTRY)).unwrap();
        assert_eq!(manifest.version, "1.0");
        assert_eq!(manifest.platform, std::env::consts::OS);
        assert_eq!(
            manifest.connections,
            vec![ManifestConnection {
                name: "web".to_string(),
                group: "work/clients".to_string()
            }]
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&manifest.created).is_ok());
    }

    #[tokio::test]
    async fn test_missing_main_config_is_skipped() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("empty.zip");
        let summary = create_archive(
            destination.clone(),
            Vec::new(),
            Vec::new(),
            Some(temp.path().join("absent")),
        )
        .await
        .unwrap();
        assert!(!summary.includes_main_config);

        let archive = ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }
}
