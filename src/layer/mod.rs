//! Layer packager: turns files, tars, symlinks and Debian packages into one
//! deterministic filesystem layer.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use log::debug;

use crate::archive::writer::{Content, EntryKind, LayerDigests, LayerWriter, Ownership};
use crate::config::PackOptions;
use crate::layer::manifest::TarManifest;
use crate::util::compress::open_uncompressed;
use crate::util::file::{is_executable, normpath};

pub mod deb;
pub mod manifest;

pub struct LayerBuilder<'a, W: Write> {
    writer: LayerWriter<W>,
    options: &'a PackOptions,
}

impl<'a, W: Write> LayerBuilder<'a, W> {
    pub fn new(inner: W, options: &'a PackOptions) -> Result<LayerBuilder<'a, W>> {
        Ok(LayerBuilder {
            writer: LayerWriter::new(inner, options.writer_options())?,
            options,
        })
    }

    /// Copies `src` to `dst` under the configured directory. Without an explicit
    /// mode the file gets 0755 when `src` is executable and 0644 otherwise.
    pub fn add_file(&mut self, src: &Path, dst: &str, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        let dest = self.destination(dst);
        let mode = match mode {
            Some(mode) => mode,
            None if is_executable(src)? => 0o755,
            None => 0o644,
        };
        debug!("adding {} as {}", src.display(), dest);
        self.writer.add_entry(&dest, EntryKind::File(Content::Path(src)), Some(mode), owner)
    }

    pub fn add_empty_file(&mut self, dst: &str, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        let dest = self.destination(dst);
        self.writer
            .add_entry(&dest, EntryKind::File(Content::Bytes(b"")), Some(mode.unwrap_or(0o644)), owner)
    }

    pub fn add_empty_dir(&mut self, dst: &str, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        let dest = self.destination(dst);
        self.writer.add_entry(&dest, EntryKind::Directory, mode, owner)
    }

    /// Adds a directory next to the layer root instead of inside it.
    pub fn add_empty_root_dir(&mut self, dst: &str, mode: Option<u32>, owner: &Ownership) -> Result<()> {
        let dest = normpath(dst.trim_start_matches('/'), self.options.path_style);
        let original_root = self.writer.replace_root_directory(&dest);
        let result = self.writer.add_entry(&dest, EntryKind::Directory, mode, owner);
        self.writer.replace_root_directory(&original_root);
        result
    }

    /// Merges a (possibly compressed) tar under the configured directory.
    pub fn add_tar(&mut self, tar: &Path) -> Result<()> {
        debug!("merging tar {}", tar.display());
        let options: &'a PackOptions = self.options;
        let reader = open_uncompressed(tar, &options.xz)?;
        self.writer.add_tar(reader, directory(options))
    }

    pub fn add_link(&mut self, name: &str, target: &str) -> Result<()> {
        let name = normpath(name.trim_start_matches('/'), self.options.path_style);
        self.writer
            .add_entry(&name, EntryKind::Symlink(target), None, &Ownership::default())
    }

    /// Applies every section of a layer manifest, section by section.
    pub fn add_manifest(&mut self, manifest: &TarManifest) -> Result<()> {
        let options = self.options;
        let attributes = &options.attributes;
        for file in &manifest.files {
            self.add_file(&file.src, &file.dst, attributes.mode(&file.dst), &attributes.owner(&file.dst))?;
        }
        for path in &manifest.empty_files {
            self.add_empty_file(path, attributes.mode(path), &attributes.owner(path))?;
        }
        for path in &manifest.empty_dirs {
            self.add_empty_dir(path, attributes.mode(path), &attributes.owner(path))?;
        }
        for path in &manifest.empty_root_dirs {
            self.add_empty_root_dir(path, attributes.mode(path), &attributes.owner(path))?;
        }
        for link in &manifest.symlinks {
            self.add_link(&link.linkname, &link.target)?;
        }
        for tar in &manifest.tars {
            self.add_tar(tar)?;
        }
        for deb in &manifest.debs {
            self.add_deb(deb)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<(W, LayerDigests)> {
        self.writer.finish()
    }

    fn destination(&self, dst: &str) -> String {
        let dest = dst.trim_start_matches('/');
        let dest = match directory(self.options) {
            Some(directory) => format!("{}/{}", directory.trim_start_matches('/'), dest),
            None => dest.to_string(),
        };
        normpath(&dest, self.options.path_style)
    }
}

fn directory(options: &PackOptions) -> Option<&str> {
    options.directory.as_deref().filter(|d| !d.is_empty() && *d != "/")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tar::EntryType;

    use super::*;
    use crate::archive::append_raw;
    use crate::archive::writer::tests::read_members;
    use crate::layer::manifest::{ManifestFile, ManifestLink};
    use crate::util::compress::Codec;

    fn names(bytes: &[u8]) -> Vec<String> {
        read_members(bytes).into_iter().map(|m| m.name).collect()
    }

    #[test]
    fn packing_twice_is_byte_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("app");
        fs::write(&src, "binary")?;
        let manifest = TarManifest {
            files: vec![ManifestFile { src: src.clone(), dst: "/opt/app/bin/app".to_string() }],
            empty_dirs: vec!["var/log".to_string()],
            symlinks: vec![ManifestLink { linkname: "usr/bin/app".to_string(), target: "/opt/app/bin/app".to_string() }],
            ..Default::default()
        };
        let options = PackOptions { compression: Codec::Gzip, ..Default::default() };

        let pack = || -> Result<(Vec<u8>, LayerDigests)> {
            let mut builder = LayerBuilder::new(Vec::new(), &options)?;
            builder.add_manifest(&manifest)?;
            builder.finish()
        };
        let (first, first_digests) = pack()?;
        let (second, second_digests) = pack()?;
        assert_eq!(first, second);
        assert_eq!(first_digests, second_digests);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn unset_mode_follows_executable_bit() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("run.sh");
        let data = dir.path().join("data.txt");
        fs::write(&script, "#!/bin/sh")?;
        fs::write(&data, "x")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o700))?;
        fs::set_permissions(&data, fs::Permissions::from_mode(0o600))?;

        let options = PackOptions::default();
        let mut builder = LayerBuilder::new(Vec::new(), &options)?;
        builder.add_file(&script, "run.sh", None, &Ownership::default())?;
        builder.add_file(&data, "data.txt", None, &Ownership::default())?;
        builder.add_file(&data, "forced.txt", Some(0o400), &Ownership::default())?;
        let (bytes, _) = builder.finish()?;

        let modes: Vec<(String, u32)> = read_members(&bytes).into_iter().map(|m| (m.name, m.mode)).collect();
        assert_eq!(
            modes,
            vec![
                ("./run.sh".to_string(), 0o755),
                ("./data.txt".to_string(), 0o644),
                ("./forced.txt".to_string(), 0o400),
            ]
        );
        Ok(())
    }

    #[test]
    fn directory_prefix_skips_links_and_root_dirs() -> Result<()> {
        let options = PackOptions { directory: Some("/app".to_string()), ..Default::default() };
        let mut builder = LayerBuilder::new(Vec::new(), &options)?;
        builder.add_empty_file("/etc//config/../app.conf", None, &Ownership::default())?;
        builder.add_link("/bin/app", "/app/bin/app")?;
        builder.add_empty_root_dir("/tmp", None, &Ownership::default())?;
        builder.add_empty_dir("data", None, &Ownership::default())?;
        let (bytes, _) = builder.finish()?;

        assert_eq!(
            names(&bytes),
            vec!["./app/", "./app/etc/", "./app/etc/app.conf", "./bin/", "./bin/app", "tmp/", "./app/data/"]
        );
        let members = read_members(&bytes);
        assert_eq!(members[2].mode, 0o644);
        assert_eq!(members[4].kind, EntryType::Symlink);
        Ok(())
    }

    #[test]
    fn manifest_attributes_apply_per_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("shadow");
        fs::write(&src, "root:*:")?;
        let mut options = PackOptions::default();
        options.attributes.modes.insert("etc/shadow".to_string(), 0o600);
        options.attributes.ids.insert("etc/shadow".to_string(), (0, 42));
        options.attributes.default_names = ("root".to_string(), "root".to_string());

        let manifest = TarManifest {
            files: vec![ManifestFile { src, dst: "/etc/shadow".to_string() }],
            ..Default::default()
        };
        let mut builder = LayerBuilder::new(Vec::new(), &options)?;
        builder.add_manifest(&manifest)?;
        let (bytes, _) = builder.finish()?;

        let members = read_members(&bytes);
        let shadow = members.iter().find(|m| m.name == "./etc/shadow").unwrap();
        assert_eq!((shadow.mode, shadow.uname.as_str()), (0o600, "root"));
        let mut archive = tar::Archive::new(bytes.as_slice());
        let gids = archive
            .entries()?
            .map(|e| Ok(e?.header().gid()?))
            .collect::<std::io::Result<Vec<u64>>>()?;
        assert_eq!(gids, vec![42, 42]);
        Ok(())
    }

    #[test]
    fn merged_tar_with_blank_owner_fields() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tar = dir.path().join("rootfs.tar");
        let mut source = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o755);
        header.set_size(2);
        // uid, gid and mtime are left NUL-filled
        append_raw(&mut source, &mut header, b"bin/sh", None, &b"#!"[..])?;
        fs::write(&tar, source.into_inner()?)?;

        let options = PackOptions { directory: Some("/app".to_string()), ..Default::default() };
        let mut builder = LayerBuilder::new(Vec::new(), &options)?;
        builder.add_tar(&tar)?;
        let (bytes, _) = builder.finish()?;

        let members = read_members(&bytes);
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["./app/", "./app/bin/sh"]);
        assert_eq!((members[1].uid, members[1].mode, members[1].data.as_slice()), (0, 0o755, &b"#!"[..]));
        Ok(())
    }
}
