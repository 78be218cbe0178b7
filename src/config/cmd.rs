use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Error;
use clap::Parser;

use crate::archive::writer::PORTABLE_MTIME;
use crate::error::PackError;
use crate::util::compress::Codec;

#[derive(Parser)]
#[command(about = "Assembles container image layers, configs and image bundles", version)]
pub enum CmdArgs {
    /// Build one filesystem layer from files, tars and Debian packages
    Layer(LayerCmdArgs),
    /// Compose an image config on top of a base config
    Config(ConfigCmdArgs),
    /// Join layers and configs into a loadable multi-tag image tarball
    Join(JoinCmdArgs),
    /// Copy a layer while dropping paths that match exclusion globs
    Prune(PruneCmdArgs),
}

#[derive(clap::Args)]
pub struct LayerCmdArgs {
    /// The output file, mandatory
    #[arg(long)]
    pub output: PathBuf,

    /// A file to add to the layer, as 'src=dst'
    #[arg(long)]
    pub file: Vec<FileMapping>,

    /// JSON manifest of contents to add to the layer
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// An empty file to add to the layer
    #[arg(long = "empty_file")]
    pub empty_file: Vec<String>,

    /// An empty dir to add to the layer
    #[arg(long = "empty_dir")]
    pub empty_dir: Vec<String>,

    /// An empty directory anchored at the layer root instead of under --directory
    #[arg(long = "empty_root_dir")]
    pub empty_root_dir: Vec<String>,

    /// A tar file to merge into the layer
    #[arg(long)]
    pub tar: Vec<PathBuf>,

    /// A Debian package to unpack into the layer
    #[arg(long)]
    pub deb: Vec<PathBuf>,

    /// Add a symlink a inside the layer pointing to b if a:b is specified
    #[arg(long)]
    pub link: Vec<LinkArg>,

    /// Directory in which to store the files inside the layer
    #[arg(long)]
    pub directory: Option<String>,

    /// Output compression: none, gzip (gz) or bzip2 (bz2)
    #[arg(long, default_value = "none")]
    pub compression: Codec,

    /// Force the mode on the added files (in octal)
    #[arg(long)]
    pub mode: Option<OctalMode>,

    /// Mode for a specific file, e.g. 'path/to/file=0755'
    #[arg(long)]
    pub modes: Vec<PathAttr<OctalMode>>,

    /// Numeric default owner of all files, e.g. '0.0'
    #[arg(long, default_value = "0.0")]
    pub owner: OwnerIds,

    /// Numeric owner of a specific file, e.g. 'path/to/file=1000.1000'
    #[arg(long)]
    pub owners: Vec<PathAttr<OwnerIds>>,

    /// Owner names of all files, e.g. 'root.root'
    #[arg(long = "owner_name")]
    pub owner_name: Option<OwnerNames>,

    /// Owner names of a specific file, e.g. 'path/to/file=root.root'
    #[arg(long = "owner_names")]
    pub owner_names: Vec<PathAttr<OwnerNames>>,

    /// Root directory of the layer; Windows images require 'Files'
    #[arg(long = "root_directory", default_value = "./")]
    pub root_directory: String,

    /// Mtime of the entries: integer seconds or 'portable' (2000-01-01)
    #[arg(long)]
    pub mtime: Option<Mtime>,

    /// Keep the mtimes of merged tar members
    #[arg(long = "enable_mtime_preservation", default_value = "False")]
    pub enable_mtime_preservation: StringBool,

    /// xz binary used when in-process xz decoding is not built in
    #[arg(long = "xz_path")]
    pub xz_path: Option<PathBuf>,

    /// Normalise member names with '/' even on non-posix hosts
    #[arg(long = "force_posixpath", default_value = "False")]
    pub force_posixpath: StringBool,

    /// Write the sha256 of the uncompressed layer here
    #[arg(long = "diffid_output")]
    pub diffid_output: Option<PathBuf>,

    /// Write the sha256 of the layer as written here
    #[arg(long = "blobsum_output")]
    pub blobsum_output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct ConfigCmdArgs {
    /// The parent image config
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// The parent image manifest, passed through to --manifestoutput
    #[arg(long)]
    pub basemanifest: Option<PathBuf>,

    /// The output file to generate
    #[arg(long)]
    pub output: PathBuf,

    /// The manifest output file to generate
    #[arg(long)]
    pub manifestoutput: Option<PathBuf>,

    /// Layer sha256 hashes that make up this image, '@file' reads them from a file
    #[arg(long)]
    pub layer: Vec<String>,

    /// Override the "Entrypoint" of the previous layer
    #[arg(long, allow_hyphen_values = true)]
    pub entrypoint: Vec<String>,

    /// Override the "Cmd" of the previous layer
    #[arg(long, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Seconds since the epoch (integer or float) or an RFC 3339 date/time
    #[arg(long = "creation_time")]
    pub creation_time: Option<String>,

    /// The username to run commands under
    #[arg(long)]
    pub user: Option<String>,

    /// Augment the "Labels" of the previous layer
    #[arg(long)]
    pub labels: Vec<KeyValue>,

    /// Augment the "ExposedPorts" of the previous layer
    #[arg(long)]
    pub ports: Vec<String>,

    /// Augment the "Volumes" of the previous layer
    #[arg(long)]
    pub volumes: Vec<String>,

    /// Set the working directory of the layer
    #[arg(long)]
    pub workdir: Option<String>,

    /// Augment the "Env" of the previous layer
    #[arg(long)]
    pub env: Vec<KeyValue>,

    /// Files with 'KEY value' lines substituted into {KEY} placeholders
    #[arg(long = "stamp-info-file")]
    pub stamp_info_file: Vec<PathBuf>,

    /// If True, "Entrypoint" is removed from the config
    #[arg(long = "null_entrypoint", default_value = "False")]
    pub null_entrypoint: StringBool,

    /// If True, "Cmd" is removed from the config
    #[arg(long = "null_cmd", default_value = "False")]
    pub null_cmd: StringBool,

    #[arg(long = "operating_system", default_value = "linux", value_parser = ["linux", "windows"])]
    pub operating_system: String,

    #[arg(long, default_value = "amd64")]
    pub architecture: String,

    /// Prefix the "Entrypoint" with the specified arguments
    #[arg(long = "entrypoint_prefix", allow_hyphen_values = true)]
    pub entrypoint_prefix: Vec<String>,
}

#[derive(clap::Args)]
pub struct JoinCmdArgs {
    /// The output file, mandatory
    #[arg(long)]
    pub output: PathBuf,

    /// Fully qualified tag and the config it tags, 'gcr.io/a/b:tag=config.json'
    #[arg(long, required = true)]
    pub tags: Vec<Association>,

    /// Fully qualified tag and the manifest carrying its foreign layers
    #[arg(long)]
    pub manifests: Vec<Association>,

    /// Layer record 'diff_id_file=blob_sum_file=unzipped_layer=zipped_layer'
    #[arg(long, required = true)]
    pub layer: Vec<LayerParts>,

    /// Image tarballs from which our images may derive
    #[arg(long)]
    pub legacy: Vec<PathBuf>,

    /// Files with 'KEY value' lines substituted into the tags
    #[arg(long = "stamp-info-file")]
    pub stamp_info_file: Vec<PathBuf>,
}

#[derive(clap::Args)]
pub struct PruneCmdArgs {
    /// The output file, mandatory
    #[arg(long)]
    pub output: PathBuf,

    /// JSON manifest with 'remove_paths' and 'unzipped_layer'
    #[arg(long)]
    pub manifest: PathBuf,

    #[arg(long = "root_directory", default_value = "./")]
    pub root_directory: String,
}

/// Boolean passed as text ('True'/'False').
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StringBool(pub bool);

impl FromStr for StringBool {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        Ok(StringBool(matches!(arg, "True" | "true" | "1" | "yes")))
    }
}

#[derive(Clone, Debug)]
pub struct FileMapping {
    pub src: PathBuf,
    pub dst: String,
}

impl FromStr for FileMapping {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let (src, dst) = arg.split_once('=').ok_or_else(|| PackError::InvalidAssociation {
            entry: arg.to_string(),
            expected: "src=dst",
        })?;
        Ok(FileMapping {
            src: PathBuf::from(src),
            dst: dst.to_string(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct LinkArg {
    pub name: String,
    pub target: String,
}

impl FromStr for LinkArg {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg.split_once(':') {
            Some((name, target)) if !name.is_empty() => Ok(LinkArg {
                name: name.to_string(),
                target: target.to_string(),
            }),
            _ => Err(PackError::InvalidLink(arg.to_string()).into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OctalMode(pub u32);

impl FromStr for OctalMode {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let digits = arg.strip_prefix("0o").unwrap_or(arg);
        u32::from_str_radix(digits, 8)
            .map(OctalMode)
            .map_err(|_| PackError::InvalidMode(arg.to_string()).into())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnerIds {
    pub uid: u64,
    pub gid: u64,
}

impl FromStr for OwnerIds {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let invalid = || PackError::InvalidOwner(arg.to_string());
        let (uid, gid) = arg.split_once('.').ok_or_else(invalid)?;
        Ok(OwnerIds {
            uid: uid.parse().map_err(|_| invalid())?,
            gid: gid.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerNames {
    pub user: String,
    pub group: String,
}

impl FromStr for OwnerNames {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let (user, group) = arg.split_once('.').ok_or_else(|| PackError::InvalidOwner(arg.to_string()))?;
        Ok(OwnerNames {
            user: user.to_string(),
            group: group.to_string(),
        })
    }
}

/// Per-path attribute override, 'path=value'. A leading '/' on the path is dropped.
#[derive(Clone, Debug)]
pub struct PathAttr<T> {
    pub path: String,
    pub value: T,
}

impl<T: FromStr<Err = Error>> FromStr for PathAttr<T> {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let (path, value) = arg.split_once('=').ok_or_else(|| PackError::InvalidAssociation {
            entry: arg.to_string(),
            expected: "path=value",
        })?;
        Ok(PathAttr {
            path: path.strip_prefix('/').unwrap_or(path).to_string(),
            value: value.parse()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mtime(pub u64);

impl FromStr for Mtime {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        if arg == "portable" {
            return Ok(Mtime(PORTABLE_MTIME));
        }
        Ok(Mtime(arg.parse()?))
    }
}

/// 'key=value', split at the first '='.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl FromStr for KeyValue {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let (key, value) = arg.split_once('=').ok_or_else(|| PackError::InvalidAssociation {
            entry: arg.to_string(),
            expected: "key=value",
        })?;
        Ok(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// 'key=value' with exactly one '='.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Association {
    pub key: String,
    pub value: String,
}

impl FromStr for Association {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg.split('=').collect::<Vec<&str>>().as_slice() {
            [key, value] => Ok(Association {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(PackError::InvalidAssociation {
                entry: arg.to_string(),
                expected: "key=value",
            }
            .into()),
        }
    }
}

/// The four files describing one layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerParts {
    pub diff_id_file: String,
    pub blob_sum_file: String,
    pub unzipped: PathBuf,
    pub zipped: PathBuf,
}

impl FromStr for LayerParts {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg.split('=').collect::<Vec<&str>>().as_slice() {
            [diff_id_file, blob_sum_file, unzipped, zipped] => Ok(LayerParts {
                diff_id_file: diff_id_file.to_string(),
                blob_sum_file: blob_sum_file.to_string(),
                unzipped: PathBuf::from(unzipped),
                zipped: PathBuf::from(zipped),
            }),
            _ => Err(PackError::InvalidAssociation {
                entry: arg.to_string(),
                expected: "diff_id=blob_sum=unzipped=zipped",
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_needs_exactly_two_fields() {
        let ok: Association = "gcr.io/a/b:{TAG}=cfg.json".parse().unwrap();
        assert_eq!(ok.key, "gcr.io/a/b:{TAG}");
        let err = "a=b=c".parse::<Association>().unwrap_err();
        assert!(err.to_string().contains("a=b=c"));
    }

    #[test]
    fn layer_parts_need_four_fields() {
        let parts: LayerParts = "d=b=layer.tar=layer.tar.gz".parse().unwrap();
        assert_eq!(parts.zipped, PathBuf::from("layer.tar.gz"));
        assert!("d=b=layer.tar".parse::<LayerParts>().is_err());
    }

    #[test]
    fn path_attributes_drop_leading_slash() {
        let mode: PathAttr<OctalMode> = "/usr/bin/tool=0755".parse().unwrap();
        assert_eq!((mode.path.as_str(), mode.value), ("usr/bin/tool", OctalMode(0o755)));
        let owner: PathAttr<OwnerIds> = "etc/shadow=0.42".parse().unwrap();
        assert_eq!(owner.value, OwnerIds { uid: 0, gid: 42 });
        assert!("etc/shadow=0".parse::<PathAttr<OwnerIds>>().is_err());
        assert!("a=9".parse::<PathAttr<OctalMode>>().is_err());
    }

    #[test]
    fn link_needs_a_name_before_the_colon() {
        let link: LinkArg = "usr/bin/python:python3".parse().unwrap();
        assert_eq!(link.target, "python3");
        assert!(":target".parse::<LinkArg>().is_err());
        assert!("nocolon".parse::<LinkArg>().is_err());
    }

    #[test]
    fn mtime_accepts_portable() {
        assert_eq!("portable".parse::<Mtime>().unwrap(), Mtime(PORTABLE_MTIME));
        assert_eq!("42".parse::<Mtime>().unwrap(), Mtime(42));
    }

    #[test]
    fn string_bool_only_true_spellings() {
        assert!("True".parse::<StringBool>().unwrap().0);
        assert!(!"False".parse::<StringBool>().unwrap().0);
    }
}
