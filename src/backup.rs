use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/hallpass.sqlite3";
const BACKGROUNDS_PREFIX: &str = "backgrounds/";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "hallpass-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub backgrounds_restored: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn read_file_bytes(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
    Ok(buf)
}

/// Collects background files relative to the workspace, sorted so the bundle
/// layout (and the manifest) is deterministic.
fn collect_backgrounds(workspace_path: &Path) -> anyhow::Result<Vec<String>> {
    let root = workspace_path.join("backgrounds");
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut rels = Vec::new();
    for teacher_dir in std::fs::read_dir(&root).context("failed to read backgrounds dir")? {
        let teacher_dir = teacher_dir?;
        if !teacher_dir.path().is_dir() {
            continue;
        }
        let teacher = teacher_dir.file_name().to_string_lossy().to_string();
        for ent in std::fs::read_dir(teacher_dir.path())? {
            let ent = ent?;
            if !ent.path().is_file() {
                continue;
            }
            rels.push(format!(
                "{}/{}",
                teacher,
                ent.file_name().to_string_lossy()
            ));
        }
    }
    rels.sort();
    Ok(rels)
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join("hallpass.sqlite3");
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let db_bytes = read_file_bytes(&db_path)?;
    let backgrounds = collect_backgrounds(workspace_path)?;

    let mut checksums: BTreeMap<String, String> = BTreeMap::new();
    checksums.insert(DB_ENTRY.to_string(), sha256_hex(&db_bytes));

    let mut background_bytes: Vec<(String, Vec<u8>)> = Vec::new();
    for rel in &backgrounds {
        let bytes = read_file_bytes(&workspace_path.join("backgrounds").join(rel))?;
        let entry_name = format!("{}{}", BACKGROUNDS_PREFIX, rel);
        checksums.insert(entry_name.clone(), sha256_hex(&bytes));
        background_bytes.push((entry_name, bytes));
    }

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "checksums": checksums,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    for (entry_name, bytes) in &background_bytes {
        zip.start_file(entry_name.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry_name))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write entry {}", entry_name))?;
    }

    let workspace_meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });
    zip.start_file(META_WORKSPACE_ENTRY, opts)
        .context("failed to start workspace metadata entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&workspace_meta)
            .context("failed to serialize workspace metadata")?
            .as_bytes(),
    )
    .context("failed to write workspace metadata entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3 + background_bytes.len(),
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join("hallpass.sqlite3");

    if !is_zip_file(in_path)? {
        // Bare database files from manual copies are still accepted.
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy bare sqlite backup from {} to {}",
                in_path.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: "bare-sqlite3".to_string(),
            backgrounds_restored: 0,
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let checksums = manifest
        .get("checksums")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let verify = |entry_name: &str, bytes: &[u8]| -> anyhow::Result<()> {
        let Some(expected) = checksums.get(entry_name).and_then(|v| v.as_str()) else {
            return Err(anyhow!("manifest missing checksum for {}", entry_name));
        };
        let actual = sha256_hex(bytes);
        if actual != expected {
            return Err(anyhow!(
                "checksum mismatch for {}: expected {}, got {}",
                entry_name,
                expected,
                actual
            ));
        }
        Ok(())
    };

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/hallpass.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to read database entry")?;
    verify(DB_ENTRY, &db_bytes)?;

    let background_entries: Vec<String> = (0..archive.len())
        .filter_map(|i| {
            archive
                .by_index(i)
                .ok()
                .map(|e| e.name().to_string())
                .filter(|n| n.starts_with(BACKGROUNDS_PREFIX) && !n.ends_with('/'))
        })
        .collect();

    let mut backgrounds_restored = 0usize;
    for entry_name in &background_entries {
        let mut bytes = Vec::new();
        archive
            .by_name(entry_name)
            .with_context(|| format!("bundle missing {}", entry_name))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}", entry_name))?;
        verify(entry_name, &bytes)?;

        let rel = &entry_name[BACKGROUNDS_PREFIX.len()..];
        let target = workspace_path.join("backgrounds").join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
        std::fs::write(&target, &bytes)
            .with_context(|| format!("failed to write {}", target.to_string_lossy()))?;
        backgrounds_restored += 1;
    }

    let tmp_dst = workspace_path.join("hallpass.sqlite3.importing");
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    std::fs::write(&tmp_dst, &db_bytes).with_context(|| {
        format!(
            "failed to write temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        backgrounds_restored,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
