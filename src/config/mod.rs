use std::collections::HashMap;

use crate::archive::writer::{Ownership, WriterOptions};
use crate::config::cmd::LayerCmdArgs;
use crate::util::compress::{Codec, XzDecoder};
use crate::util::file::PathStyle;

pub mod cmd;
pub mod stamp;

/// Everything the layer packager needs from its command line, resolved once.
pub struct PackOptions {
    pub directory: Option<String>,
    pub compression: Codec,
    pub root_directory: String,
    pub default_mtime: u64,
    pub preserve_mtime: bool,
    pub path_style: PathStyle,
    pub xz: XzDecoder,
    pub attributes: FileAttributes,
}

impl PackOptions {
    pub fn from_args(args: &LayerCmdArgs) -> PackOptions {
        PackOptions {
            directory: args.directory.clone(),
            compression: args.compression,
            root_directory: args.root_directory.clone(),
            default_mtime: args.mtime.map(|m| m.0).unwrap_or(0),
            preserve_mtime: args.enable_mtime_preservation.0,
            path_style: PathStyle::from_force_posix(args.force_posixpath.0),
            xz: XzDecoder::resolve(args.xz_path.as_deref()),
            attributes: FileAttributes::from_args(args),
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            compression: self.compression,
            root_directory: self.root_directory.clone(),
            default_mtime: self.default_mtime,
            preserve_mtime: self.preserve_mtime,
        }
    }
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            directory: None,
            compression: Codec::None,
            root_directory: "./".to_string(),
            default_mtime: 0,
            preserve_mtime: false,
            path_style: PathStyle::Posix,
            xz: XzDecoder::resolve(None),
            attributes: FileAttributes::default(),
        }
    }
}

/// Mode and owner of an added path: per-path override, then the global
/// default, then the entry kind's own default.
#[derive(Default, Debug, Clone)]
pub struct FileAttributes {
    pub default_mode: Option<u32>,
    pub modes: HashMap<String, u32>,
    pub default_ids: (u64, u64),
    pub ids: HashMap<String, (u64, u64)>,
    pub default_names: (String, String),
    pub names: HashMap<String, (String, String)>,
}

impl FileAttributes {
    fn from_args(args: &LayerCmdArgs) -> FileAttributes {
        FileAttributes {
            default_mode: args.mode.map(|m| m.0),
            modes: args.modes.iter().map(|m| (m.path.clone(), m.value.0)).collect(),
            default_ids: (args.owner.uid, args.owner.gid),
            ids: args.owners.iter().map(|o| (o.path.clone(), (o.value.uid, o.value.gid))).collect(),
            default_names: args
                .owner_name
                .as_ref()
                .map(|n| (n.user.clone(), n.group.clone()))
                .unwrap_or_default(),
            names: args
                .owner_names
                .iter()
                .map(|n| (n.path.clone(), (n.value.user.clone(), n.value.group.clone())))
                .collect(),
        }
    }

    /// Looks `path` up with any leading `/` dropped.
    pub fn mode(&self, path: &str) -> Option<u32> {
        let key = path.trim_start_matches('/');
        self.modes.get(key).copied().or(self.default_mode)
    }

    pub fn owner(&self, path: &str) -> Ownership {
        let key = path.trim_start_matches('/');
        let (uid, gid) = self.ids.get(key).copied().unwrap_or(self.default_ids);
        let (uname, gname) = self.names.get(key).cloned().unwrap_or_else(|| self.default_names.clone());
        Ownership { uid, gid, uname, gname }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_path_overrides_win_over_defaults() {
        let attributes = FileAttributes {
            default_mode: Some(0o640),
            modes: HashMap::from([("usr/bin/tool".to_string(), 0o755)]),
            default_ids: (0, 0),
            ids: HashMap::from([("etc/app.conf".to_string(), (1000, 1000))]),
            default_names: ("root".to_string(), "root".to_string()),
            names: HashMap::new(),
        };
        assert_eq!(attributes.mode("/usr/bin/tool"), Some(0o755));
        assert_eq!(attributes.mode("etc/app.conf"), Some(0o640));
        let owner = attributes.owner("/etc/app.conf");
        assert_eq!((owner.uid, owner.gid, owner.uname.as_str()), (1000, 1000, "root"));
        assert_eq!(FileAttributes::default().mode("x"), None);
    }
}
