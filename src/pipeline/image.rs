//! Image metadata and the rootfs archive.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::executor::files::write_atomic;
use crate::stage::StageKind;

/// Accumulated effect of the directive stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub exposed_ports: BTreeSet<u16>,
    pub user: Option<String>,
    pub cmd: Vec<String>,
}

impl ImageConfig {
    /// Fold a directive into the config. Other stage kinds are ignored.
    pub fn apply(&mut self, kind: &StageKind) {
        match kind {
            StageKind::Env { name, value } => {
                self.env.insert(name.clone(), value.clone());
            }
            StageKind::Workdir(dir) => self.workdir = Some(dir.clone()),
            StageKind::Expose(port) => {
                self.exposed_ports.insert(*port);
            }
            StageKind::User(user) => self.user = Some(user.clone()),
            StageKind::Cmd(cmd) => self.cmd = cmd.clone(),
            _ => {}
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        write_atomic(path, &payload)
    }
}

/// Deterministic tar.zst of `src_dir`.
///
/// Entries are sorted and mtimes zeroed; ownership and modes are kept so the
/// runtime identity survives into the archive.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let io_err = |e: std::io::Error| Error::io(out_path, e);

    let out = File::create(out_path).map_err(io_err)?;
    let encoder = zstd::stream::Encoder::new(out, 3).map_err(io_err)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::io(src_dir, e.into()))?;
        if entry.path() != src_dir {
            entries.push(entry.path().to_path_buf());
        }
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a);
        let rb = b.strip_prefix(src_dir).unwrap_or(b);
        ra.cmp(rb)
    });

    for path in entries {
        let rel = path.strip_prefix(src_dir).unwrap_or(&path).to_path_buf();
        let md = fs::symlink_metadata(&path).map_err(|e| Error::io(&path, e))?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(md.uid() as u64);
        header.set_gid(md.gid() as u64);
        header.set_mode(md.permissions().mode());

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .map_err(io_err)?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&path).map_err(|e| Error::io(&path, e))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, &rel, &target)
                .map_err(io_err)?;
        } else if md.is_file() {
            let mut f = File::open(&path).map_err(|e| Error::io(&path, e))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, &mut f)
                .map_err(io_err)?;
        }
    }

    let encoder = builder.into_inner().map_err(io_err)?;
    encoder.finish().map_err(io_err)?;
    Ok(())
}
