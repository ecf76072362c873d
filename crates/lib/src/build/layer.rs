//! Deterministic layer packing.
//!
//! Layers are gzip-compressed tar streams. Every entry is written with the
//! same metadata regardless of the host: mtime [`SOURCE_DATE_EPOCH`], uid and
//! gid 0, no user or group names, mode `0755` for directories and executables
//! and `0644` for everything else. Entries are sorted by path. The gzip header
//! carries no timestamp or file name. Packing the same tree twice yields the
//! same bytes.
//!
//! `RUN` layers are diffs: lower layers are unpacked into a root filesystem
//! ([`unpack_into`]), the tree is fingerprinted ([`Snapshot`]), the command
//! runs, and only what changed is packed ([`pack_diff`]). Those entries keep
//! their real permission bits; removals become whiteout entries.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::CachedLayer;
use crate::consts::SOURCE_DATE_EPOCH;
use crate::oci::{Descriptor, Digest, LayerCompression, MEDIA_TYPE_LAYER_GZIP};
use crate::util::hash::{ContentHash, hash_bytes, is_executable};

/// Marks a removed path in a layer: `dir/.wh.name` hides `dir/name`.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Hides every lower entry of the directory it appears in.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Error)]
pub enum LayerError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("failed to write layer: {0}")]
  Write(#[from] std::io::Error),

  #[error("in-image destination '{0}' must be absolute")]
  RelativeDestination(String),
}

enum Content {
  Dir { mode: u32 },
  File { data: Vec<u8>, mode: u32 },
  Symlink(PathBuf),
}

fn normalized_mode(executable: bool) -> u32 {
  if executable { 0o755 } else { 0o644 }
}

struct LayerEntry {
  path: String,
  content: Content,
}

/// Pack a context file or directory so it lands at `dest` inside the image.
///
/// Parent directories of `dest` are included. Names matching `exclude` are
/// skipped at any depth.
pub fn pack_copy(src: &Path, dest: &str, exclude: &dyn Fn(&str) -> bool) -> Result<CachedLayer, LayerError> {
  let dest = dest
    .strip_prefix('/')
    .ok_or_else(|| LayerError::RelativeDestination(dest.to_string()))?
    .trim_end_matches('/');

  let mut entries = Vec::new();
  let parents: Vec<&str> = dest.split('/').collect();
  for depth in 1..parents.len() {
    entries.push(LayerEntry {
      path: parents[..depth].join("/"),
      content: Content::Dir { mode: 0o755 },
    });
  }

  let metadata = fs::symlink_metadata(src).map_err(|source| LayerError::Read {
    path: src.to_path_buf(),
    source,
  })?;
  if metadata.is_dir() {
    entries.push(LayerEntry {
      path: dest.to_string(),
      content: Content::Dir { mode: 0o755 },
    });
    collect_tree(src, dest, exclude, &mut entries)?;
  } else {
    entries.push(LayerEntry {
      path: dest.to_string(),
      content: read_content(src, &metadata)?,
    });
  }

  finish(entries)
}

/// Pack every entry below `root` as a layer rooted at `/`.
pub fn pack_tree(root: &Path) -> Result<CachedLayer, LayerError> {
  let mut entries = Vec::new();
  collect_tree(root, "", &|_: &str| false, &mut entries)?;
  finish(entries)
}

fn collect_tree(
  root: &Path,
  prefix: &str,
  exclude: &dyn Fn(&str) -> bool,
  entries: &mut Vec<LayerEntry>,
) -> Result<(), LayerError> {
  let walker = WalkDir::new(root)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().map(|name| !exclude(name)).unwrap_or(true));

  for entry in walker {
    let entry = entry.map_err(|e| LayerError::Walk {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    let relative = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");
    let path = if prefix.is_empty() {
      relative
    } else {
      format!("{}/{}", prefix, relative)
    };

    let metadata = fs::symlink_metadata(entry.path()).map_err(|source| LayerError::Read {
      path: entry.path().to_path_buf(),
      source,
    })?;
    if metadata.is_dir() {
      entries.push(LayerEntry {
        path,
        content: Content::Dir { mode: 0o755 },
      });
    } else if metadata.is_file() || metadata.file_type().is_symlink() {
      entries.push(LayerEntry {
        path,
        content: read_content(entry.path(), &metadata)?,
      });
    }
  }

  Ok(())
}

fn read_content(path: &Path, metadata: &fs::Metadata) -> Result<Content, LayerError> {
  let read_err = |source| LayerError::Read {
    path: path.to_path_buf(),
    source,
  };
  if metadata.file_type().is_symlink() {
    return Ok(Content::Symlink(fs::read_link(path).map_err(read_err)?));
  }
  Ok(Content::File {
    data: fs::read(path).map_err(read_err)?,
    mode: normalized_mode(is_executable(path)),
  })
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
  if metadata.is_dir() { 0o755 } else { 0o644 }
}

fn has_unsafe_components(path: &Path) -> bool {
  path
    .components()
    .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

fn remove_path(path: &Path) -> Result<(), LayerError> {
  let result = match fs::symlink_metadata(path) {
    Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
    Err(e) => Err(e),
  };
  result.map_err(|source| LayerError::Read {
    path: path.to_path_buf(),
    source,
  })
}

/// Unpack a layer blob on top of `root`, applying its whiteouts.
///
/// Device nodes and FIFOs are skipped, and entries that cannot be created
/// without privileges are logged and skipped. Ownership is not restored.
pub fn unpack_into(data: &[u8], compression: LayerCompression, root: &Path) -> Result<(), LayerError> {
  let reader: Box<dyn Read + '_> = match compression {
    LayerCompression::Gzip => Box::new(GzDecoder::new(data)),
    LayerCompression::None => Box::new(data),
  };
  let mut archive = tar::Archive::new(reader);
  archive.set_preserve_mtime(false);
  archive.set_preserve_permissions(true);
  archive.set_unpack_xattrs(false);
  archive.set_overwrite(true);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    if has_unsafe_components(&path) {
      warn!(path = %path.display(), "skipping layer entry outside the root");
      continue;
    }

    let parent = root.join(path.parent().unwrap_or(Path::new("")));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name == OPAQUE_WHITEOUT {
      if let Ok(children) = fs::read_dir(&parent) {
        for child in children.flatten() {
          remove_path(&child.path())?;
        }
      }
      continue;
    }
    if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
      remove_path(&parent.join(hidden))?;
      continue;
    }

    let kind = entry.header().entry_type();
    if matches!(kind, EntryType::Block | EntryType::Char | EntryType::Fifo) {
      debug!(path = %path.display(), "skipping device entry");
      continue;
    }
    if let Err(e) = entry.unpack_in(root) {
      warn!(path = %path.display(), error = %e, "failed to unpack layer entry, continuing");
      continue;
    }
    // Read-only directories would block the entries unpacked into them.
    #[cfg(unix)]
    if kind == EntryType::Directory {
      use std::os::unix::fs::PermissionsExt;
      let target = root.join(&path);
      if let Ok(metadata) = fs::metadata(&target) {
        let mode = metadata.permissions().mode() | 0o700;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(|source| LayerError::Read {
          path: target.clone(),
          source,
        })?;
      }
    }
  }

  Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fingerprint {
  Dir { mode: u32 },
  File { mode: u32, hash: ContentHash },
  Symlink(PathBuf),
}

/// Fingerprints of every entry below a root filesystem, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
  entries: BTreeMap<String, Fingerprint>,
}

impl Snapshot {
  pub fn take(root: &Path) -> Result<Self, LayerError> {
    let mut entries = BTreeMap::new();
    walk_rootfs(root, |path, _, fingerprint| {
      entries.insert(path, fingerprint);
      Ok(())
    })?;
    Ok(Self { entries })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

fn walk_rootfs(
  root: &Path,
  mut visit: impl FnMut(String, &Path, Fingerprint) -> Result<(), LayerError>,
) -> Result<(), LayerError> {
  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| LayerError::Walk {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    let relative = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");
    let metadata = fs::symlink_metadata(entry.path()).map_err(|source| LayerError::Read {
      path: entry.path().to_path_buf(),
      source,
    })?;

    let fingerprint = if metadata.file_type().is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|source| LayerError::Read {
        path: entry.path().to_path_buf(),
        source,
      })?;
      Fingerprint::Symlink(target)
    } else if metadata.is_dir() {
      Fingerprint::Dir {
        mode: permission_bits(&metadata),
      }
    } else if metadata.is_file() {
      let data = fs::read(entry.path()).map_err(|source| LayerError::Read {
        path: entry.path().to_path_buf(),
        source,
      })?;
      Fingerprint::File {
        mode: permission_bits(&metadata),
        hash: hash_bytes(&data),
      }
    } else {
      continue;
    };
    visit(relative, entry.path(), fingerprint)?;
  }
  Ok(())
}

/// Pack what changed below `root` since `before` was taken.
///
/// New and modified entries are packed with their permission bits. Removed
/// entries become whiteouts; a removed directory needs only its own.
pub fn pack_diff(root: &Path, before: &Snapshot) -> Result<CachedLayer, LayerError> {
  let mut entries = Vec::new();
  let mut seen = BTreeMap::new();

  walk_rootfs(root, |path, full, fingerprint| {
    if before.entries.get(&path) != Some(&fingerprint) {
      let content = match &fingerprint {
        Fingerprint::Dir { mode } => Content::Dir { mode: *mode },
        Fingerprint::File { mode, .. } => Content::File {
          data: fs::read(full).map_err(|source| LayerError::Read {
            path: full.to_path_buf(),
            source,
          })?,
          mode: *mode,
        },
        Fingerprint::Symlink(target) => Content::Symlink(target.clone()),
      };
      entries.push(LayerEntry {
        path: path.clone(),
        content,
      });
    }
    seen.insert(path, ());
    Ok(())
  })?;

  let removed: Vec<&String> = before.entries.keys().filter(|p| !seen.contains_key(*p)).collect();
  for path in &removed {
    let parent = path.rsplit_once('/').map(|(parent, _)| parent);
    if parent.is_some_and(|parent| removed.iter().any(|r| r.as_str() == parent)) {
      continue;
    }
    let whiteout = match path.rsplit_once('/') {
      Some((parent, name)) => format!("{}/{}{}", parent, WHITEOUT_PREFIX, name),
      None => format!("{}{}", WHITEOUT_PREFIX, path),
    };
    entries.push(LayerEntry {
      path: whiteout,
      content: Content::File {
        data: Vec::new(),
        mode: 0o644,
      },
    });
  }

  finish(entries)
}

fn finish(mut entries: Vec<LayerEntry>) -> Result<CachedLayer, LayerError> {
  entries.sort_by(|a, b| a.path.cmp(&b.path));
  entries.dedup_by(|a, b| a.path == b.path);

  let mut builder = tar::Builder::new(Vec::new());
  for entry in &entries {
    let mut header = Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(SOURCE_DATE_EPOCH);

    match &entry.content {
      Content::Dir { mode } => {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(*mode);
        header.set_size(0);
        builder.append_data(&mut header, &entry.path, std::io::empty())?;
      }
      Content::File { data, mode } => {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(*mode);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, &entry.path, data.as_slice())?;
      }
      Content::Symlink(target) => {
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, &entry.path, target)?;
      }
    }
  }
  let tar_bytes = builder.into_inner()?;

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(&tar_bytes)?;
  let data = encoder.finish()?;

  Ok(CachedLayer {
    descriptor: Descriptor::for_bytes(MEDIA_TYPE_LAYER_GZIP, &data),
    diff_id: Digest::of(&tar_bytes),
    data,
  })
}
