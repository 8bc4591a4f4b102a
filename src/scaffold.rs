//! Local copies of the example models shipped with the engine.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::bridge::EngineHandle;
use crate::consts::{EXAMPLE_DATA_DIR, EXAMPLE_SUFFIX};
use crate::interop::make_symbol;

/// The engine's examples folder.
pub async fn examples_dir(handle: &EngineHandle) -> Result<PathBuf> {
    let get_path = handle
        .get(Some("IESopt.IESoptLib.get_path"))
        .await
        .context("engine does not expose its example library")?;
    let examples = make_symbol(handle, "examples").await?;
    let folder = handle.call(&get_path, &[examples.value().into()], &[]).await;
    handle.discard(&[&get_path, examples.value()]).await;
    let folder = folder?;
    handle.discard(&[&folder]).await;
    match folder.as_str() {
        Some(path) => Ok(PathBuf::from(path)),
        None => bail!("examples folder is not a path: {folder}"),
    }
}

/// Names of all available examples, sorted, without the file suffix.
pub async fn examples(handle: &EngineHandle) -> Result<Vec<String>> {
    list_examples(&examples_dir(handle).await?)
}

/// Example names found in `folder`.
pub fn list_examples(folder: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(folder)
        .with_context(|| format!("failed to read examples folder {}", folder.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(EXAMPLE_SUFFIX)) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Copy `example` into `dst_dir`, returning the path of the copied model file.
///
/// See [`copy_example`].
pub async fn make_example(
    handle: &EngineHandle,
    example: &str,
    dst_dir: &Path,
    dst_name: Option<&str>,
) -> Result<PathBuf> {
    let folder = examples_dir(handle).await?;
    copy_example(&folder, example, dst_dir, dst_name)
}

/// Copy `<example>.iesopt.yaml` from `folder` into `dst_dir`, renamed to
/// `dst_name` if given, together with the shared data folder.
///
/// The data folder is only copied if `dst_dir` has none yet; an existing one
/// is left alone entirely. Everything copied is made writable by the owner.
pub fn copy_example(
    folder: &Path,
    example: &str,
    dst_dir: &Path,
    dst_name: Option<&str>,
) -> Result<PathBuf> {
    let source = folder.join(format!("{example}{EXAMPLE_SUFFIX}"));
    if !source.is_file() {
        bail!("unknown example `{example}` (no {})", source.display());
    }
    let target = dst_dir.join(format!("{}{EXAMPLE_SUFFIX}", dst_name.unwrap_or(example)));
    if is_same_file(&source, &target)? {
        bail!(
            "{} and {} are the same file",
            source.display(),
            target.display()
        );
    }
    let data = folder.join(EXAMPLE_DATA_DIR);
    let target_data = dst_dir.join(EXAMPLE_DATA_DIR);

    fs::create_dir_all(dst_dir)
        .with_context(|| format!("failed to create {}", dst_dir.display()))?;

    info!(
        target = %target.display(),
        data = %target_data.display(),
        "setting write permissions for example and data folder"
    );
    if target_data.exists() {
        info!("data folder for examples already exists; not copying any contents");
        make_tree_writable(&target_data)?;
    } else if data.is_dir() {
        info!("data folder for examples does not exist; creating it and copying contents");
        copy_tree(&data, &target_data)?;
    }

    info!(example, target = %target.display(), "creating example");
    fs::copy(&source, &target)
        .with_context(|| format!("failed to copy {}", source.display()))?;
    make_writable(&target)?;

    Ok(target)
}

fn is_same_file(a: &Path, b: &Path) -> Result<bool> {
    if !b.exists() {
        return Ok(false);
    }
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}

/// Copy the tree under `from` to `to`, making every copied entry writable.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let dest = to.join(entry.path().strip_prefix(from)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("failed to create {}", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
        make_writable(&dest)?;
    }
    Ok(())
}

fn make_tree_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        make_writable(entry?.path())?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o200);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn make_writable(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}
