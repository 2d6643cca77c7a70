use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use zip::{write::SimpleFileOptions, ZipArchive, ZipWriter};

use crate::config::APP_RESOURCES;

const DATABASE_ENTRY: &str = "sublarr.sqlite";
const CONFIG_ENTRY: &str = "configuration.toml";

/// ZIP the database and the active configuration into the backups
/// directory. Returns the archive path.
pub async fn create_backup() -> anyhow::Result<PathBuf> {
    let database_path = APP_RESOURCES.database_path.clone();
    let config_path = APP_RESOURCES.config_path.clone();
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp();
    let target = APP_RESOURCES
        .backup_path
        .join(format!("sublarr-backup-{stamp}.zip"));
    let archive_path = target.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = File::create(&archive_path)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file(DATABASE_ENTRY, options)?;
        copy_into(&database_path, &mut zip)?;

        if config_path.exists() {
            zip.start_file(CONFIG_ENTRY, options)?;
            copy_into(&config_path, &mut zip)?;
        }
        zip.finish()?;
        Ok(())
    })
    .await??;

    tracing::info!(path = %target.display(), "Backup archive written");
    Ok(target)
}

fn copy_into<W: Write + std::io::Seek>(path: &Path, zip: &mut ZipWriter<W>) -> anyhow::Result<()> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        zip.write_all(&buffer[..read])?;
    }
    Ok(())
}

/// Restore database and configuration from a backup archive. The archive
/// is validated before any live file is touched, and the live database is
/// kept as `.bak`.
pub async fn restore_backup(archive: &Path) -> anyhow::Result<()> {
    let archive = archive.to_path_buf();
    let database_path = APP_RESOURCES.database_path.clone();
    let config_path = APP_RESOURCES.config_path.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let file = File::open(&archive)?;
        let mut zip = ZipArchive::new(file)?;
        if zip.by_name(DATABASE_ENTRY).is_err() {
            anyhow::bail!("archive is missing {DATABASE_ENTRY}, refusing to restore");
        }

        let mut backup = database_path.as_os_str().to_owned();
        backup.push(".bak");
        if database_path.exists() {
            std::fs::copy(&database_path, PathBuf::from(&backup))?;
        }

        {
            let mut entry = zip.by_name(DATABASE_ENTRY)?;
            let mut out = File::create(&database_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        if let Ok(mut entry) = zip.by_name(CONFIG_ENTRY) {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&config_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    })
    .await??;

    tracing::info!("Backup restored");
    Ok(())
}
