//! Unpacking of Debian packages into a layer, with a dpkg status record so
//! scanners can tell which packages the image carries.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::info;
use regex::Regex;
use tar::Archive;
use tempfile::NamedTempFile;

use crate::archive::ar::ArReader;
use crate::archive::writer::{Content, EntryKind, Ownership};
use crate::error::PackError;
use crate::layer::LayerBuilder;
use crate::util::compress::{decompress, Codec};

const DPKG_STATUS_DIR: &str = "/var/lib/dpkg/status.d";
const PKG_METADATA_FILE: &str = "control";
const PKG_MD5SUMS_FILE: &str = "md5sums";

impl<'a, W: Write> LayerBuilder<'a, W> {
    /// Merges the `data` member of a package and records its `control` file
    /// under the dpkg status directory.
    pub fn add_deb(&mut self, deb: &Path) -> Result<()> {
        let bad_package = |reason: &str| PackError::BadPackage {
            deb: deb.to_path_buf(),
            reason: reason.to_string(),
        };
        let file = File::open(deb).with_context(|| format!("opening package {}", deb.display()))?;
        let mut ar = ArReader::new(BufReader::new(file)).map_err(|e| bad_package(&e.to_string()))?;

        let mut data_found = false;
        let mut control_found = false;
        while let Some(member) = ar.next_member()? {
            let parts: Vec<&str> = member.filename.split('.').collect();
            let name = parts[0];
            if name != "data" && name != "control" {
                continue;
            }
            let (payload, ext) = match parts.split_last() {
                Some((last, _)) if parts.len() > 1 && last.eq_ignore_ascii_case("xz") => {
                    (self.options.xz.decompress(&member.data)?, parts[1..parts.len() - 1].join("."))
                }
                _ => (member.data, parts[1..].join(".")),
            };
            let scratch = scratch_file(decompress(Codec::from_suffix(&ext), payload, &self.options.xz)?)?;
            if name == "data" {
                data_found = true;
                self.add_tar(scratch.path())?;
            } else {
                control_found = true;
                self.add_pkg_metadata(scratch.path(), deb).map_err(|e| match e.downcast::<PackError>() {
                    Ok(pack_error) => anyhow::Error::from(pack_error),
                    Err(source) => anyhow::Error::from(PackError::PackageMetadata {
                        deb: deb.to_path_buf(),
                        source,
                    }),
                })?;
            }
        }

        if !data_found {
            return Err(bad_package("does not contain a data file!").into());
        }
        if !control_found {
            return Err(bad_package("does not contain a control file!").into());
        }
        info!("Unpacked {}", deb.display());
        Ok(())
    }

    fn add_pkg_metadata(&mut self, metadata_tar: &Path, deb: &Path) -> Result<()> {
        let mut control = None;
        let mut md5sums = None;
        let mut archive = Archive::new(BufReader::new(File::open(metadata_tar)?));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let slot = match path.file_name().and_then(|n| n.to_str()) {
                Some(PKG_METADATA_FILE) if control.is_none() => &mut control,
                Some(PKG_MD5SUMS_FILE) if md5sums.is_none() => &mut md5sums,
                _ => continue,
            };
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            *slot = Some(content);
        }

        let control = control.ok_or_else(|| PackError::BadPackage {
            deb: deb.to_path_buf(),
            reason: "does not contain a control Metadata File!".to_string(),
        })?;
        let metadata = std::str::from_utf8(&control).map_err(|e| anyhow!("control file is not utf-8: {}", e))?;
        let pkg_name = parse_pkg_name(metadata, deb)?;
        self.add_status_file(&format!("{}/{}", DPKG_STATUS_DIR, pkg_name), &control)?;
        if let Some(md5sums) = md5sums {
            self.add_status_file(&format!("{}/{}.md5sums", DPKG_STATUS_DIR, pkg_name), &md5sums)?;
        }
        Ok(())
    }

    fn add_status_file(&mut self, dst: &str, content: &[u8]) -> Result<()> {
        let dest = self.destination(dst);
        self.writer
            .add_entry(&dest, EntryKind::File(Content::Bytes(content)), Some(0o644), &Ownership::default())
    }
}

/// Name from a leading `Package:` field, else the package file name without
/// its extension.
fn parse_pkg_name(metadata: &str, deb: &Path) -> Result<String> {
    let pkg_name_re = Regex::new(r"^Package:\s*(\w[\w.+-]*)")?;
    if let Some(caps) = pkg_name_re.captures(metadata) {
        return Ok(caps[1].to_string());
    }
    Ok(deb
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default())
}

/// Scratch copy of a decompressed member, deleted when dropped.
fn scratch_file(data: Vec<u8>) -> Result<NamedTempFile> {
    let mut scratch = NamedTempFile::new()?;
    scratch.write_all(&data)?;
    scratch.flush()?;
    Ok(scratch)
}
