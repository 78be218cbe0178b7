use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::Result;
use log::{debug, warn};
use tar::{Archive, Builder, EntryType, Header};

use crate::archive::{append_raw, copy_metadata};
use crate::util::compress::{Codec, CompressWriter};
use crate::util::sha::Sha256Writer;

/// Mtime used for `--mtime=portable`, 2000-01-01T00:00:00Z.
pub const PORTABLE_MTIME: u64 = 946684800;

/// Numeric and named owner of an entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
}

pub enum Content<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

pub enum EntryKind<'a> {
    File(Content<'a>),
    Directory,
    Symlink(&'a str),
}

pub struct WriterOptions {
    pub compression: Codec,
    pub root_directory: String,
    pub default_mtime: u64,
    pub preserve_mtime: bool,
}

/// Digests of a finished layer, hex without the `sha256:` prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerDigests {
    /// sha256 of the uncompressed tar stream
    pub diff_id: String,
    /// sha256 of the bytes as written
    pub blob_sum: String,
    pub size: u64,
}

type DigestStack<W> = Sha256Writer<CompressWriter<Sha256Writer<W>>>;

/// Tar writer producing deterministic image layers.
///
/// Names are rooted under `root_directory`, parent directories are emitted
/// before their children and a member name is only ever written once.
pub struct LayerWriter<W: Write> {
    builder: Builder<DigestStack<W>>,
    root_directory: String,
    default_mtime: u64,
    preserve_mtime: bool,
    members: HashSet<String>,
    directories: HashSet<String>,
}

impl<W: Write> LayerWriter<W> {
    pub fn new(inner: W, options: WriterOptions) -> Result<LayerWriter<W>> {
        let blob_writer = Sha256Writer::new(inner);
        let compress_writer = CompressWriter::new(options.compression, blob_writer)?;
        let mut builder = Builder::new(Sha256Writer::new(compress_writer));
        builder.follow_symlinks(false);
        Ok(LayerWriter {
            builder,
            root_directory: trim_root(&options.root_directory),
            default_mtime: options.default_mtime,
            preserve_mtime: options.preserve_mtime,
            members: HashSet::new(),
            directories: HashSet::new(),
        })
    }

    /// Swaps the root directory, returning the previous one.
    pub fn replace_root_directory(&mut self, root_directory: &str) -> String {
        std::mem::replace(&mut self.root_directory, trim_root(root_directory))
    }

    /// Adds one entry. `mode` defaults to 0644 for files and 0755 otherwise.
    pub fn add_entry(&mut self, name: &str, kind: EntryKind, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        if name.is_empty() || name == "." {
            return Ok(());
        }
        let name = self.rooted(name);
        self.add_rooted(name, kind, mode, owner)
    }

    fn add_rooted(&mut self, mut name: String, kind: EntryKind, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        if let EntryKind::Directory = kind {
            name = name.trim_end_matches('/').to_string();
            if name.is_empty() || self.directories.contains(&name) {
                return Ok(());
            }
        }
        if let Some((parent, _)) = name.rsplit_once('/') {
            if !parent.is_empty() && parent != "." {
                let parent = parent.to_string();
                self.add_rooted(parent, EntryKind::Directory, Some(0o755), owner)?;
            }
        }

        let mut header = Header::new_gnu();
        header.set_mtime(self.default_mtime);
        header.set_uid(owner.uid);
        header.set_gid(owner.gid);
        header.set_username(&owner.uname)?;
        header.set_groupname(&owner.gname)?;
        match kind {
            EntryKind::File(content) => {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(mode.unwrap_or(0o644));
                match content {
                    Content::Bytes(bytes) => {
                        header.set_size(bytes.len() as u64);
                        self.append_member(&mut header, &name, None, bytes)?;
                    }
                    Content::Path(path) => {
                        let file = File::open(path)?;
                        header.set_size(file.metadata()?.len());
                        self.append_member(&mut header, &name, None, BufReader::new(file))?;
                    }
                }
            }
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(mode.unwrap_or(0o755));
                header.set_size(0);
                self.directories.insert(name.clone());
                self.append_member(&mut header, &format!("{}/", name), None, std::io::empty())?;
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(mode.unwrap_or(0o755));
                header.set_size(0);
                self.append_member(&mut header, &name, Some(target), std::io::empty())?;
            }
        }
        Ok(())
    }

    /// Merges every member of a tar stream, placed under `directory` when set.
    ///
    /// Merged members are owned by numeric root:root with no owner names.
    pub fn add_tar<R: Read>(&mut self, reader: R, directory: Option<&str>) -> Result<()> {
        let directory = directory.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty());
        if let Some(directory) = directory {
            self.add_entry(directory, EntryKind::Directory, Some(0o755), &Ownership::default())?;
        }
        let mut archive = Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let source_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = self.relocate(&source_name, directory);
            if name.is_empty() {
                continue;
            }
            let mut header = copy_metadata(entry.header())?;
            if !self.preserve_mtime {
                header.set_mtime(self.default_mtime);
            }
            header.set_uid(0);
            header.set_gid(0);
            header.set_username("")?;
            header.set_groupname("")?;

            let entry_type = entry.header().entry_type();
            let link = match entry.link_name_bytes() {
                Some(link) => {
                    let link = String::from_utf8_lossy(&link).into_owned();
                    // hard links name another member, so they move with it
                    Some(if entry_type == EntryType::Link { self.relocate(&link, directory) } else { link })
                }
                None => None,
            };
            let name = if entry_type == EntryType::Directory && !name.ends_with('/') {
                format!("{}/", name)
            } else {
                name
            };
            debug!("merging {} as {}", source_name, name);
            self.append_member(&mut header, &name, link.as_deref(), &mut entry)?;
        }
        Ok(())
    }

    /// Writes the tar trailer, flushes the codec and reports the digests.
    pub fn finish(self) -> Result<(W, LayerDigests)> {
        let diff_writer = self.builder.into_inner()?;
        let (compress_writer, diff_id, _) = diff_writer.finish();
        let blob_writer = compress_writer.finish()?;
        let (mut inner, blob_sum, size) = blob_writer.finish();
        inner.flush()?;
        Ok((inner, LayerDigests { diff_id, blob_sum, size }))
    }

    fn append_member<R: Read>(&mut self, header: &mut Header, name: &str, link: Option<&str>, data: R) -> Result<()> {
        if self.members.contains(name) {
            if header.entry_type() != EntryType::Directory {
                warn!("Duplicate file in archive: {}, picking first occurrence", name);
            }
            return Ok(());
        }
        append_raw(&mut self.builder, header, name.as_bytes(), link.map(str::as_bytes), data)?;
        self.members.insert(name.to_string());
        Ok(())
    }

    fn rooted(&self, name: &str) -> String {
        let root = self.root_directory.as_str();
        if root.is_empty() || name == root || name.starts_with(&format!("{}/", root)) {
            name.to_string()
        } else {
            format!("{}/{}", root, name)
        }
    }

    /// Maps a member name of a merged tar into this layer.
    fn relocate(&self, source_name: &str, directory: Option<&str>) -> String {
        let relative = source_name.trim_start_matches("./").trim_start_matches('/');
        let relative = relative.trim_end_matches('/');
        let placed = match (directory, relative.is_empty()) {
            (Some(directory), true) => directory.to_string(),
            (Some(directory), false) => format!("{}/{}", directory, relative),
            (None, _) => relative.to_string(),
        };
        if placed.is_empty() {
            self.root_directory.clone()
        } else {
            self.rooted(&placed)
        }
    }
}

fn trim_root(root_directory: &str) -> String {
    root_directory.trim_end_matches('/').to_string()
}
