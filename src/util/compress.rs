use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;

use anyhow::{anyhow, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::error::PackError;

/// Compression of a tar stream, either read or written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Codec {
    /// Sniffs the codec from the first bytes of a stream.
    pub fn detect(magic: &[u8]) -> Codec {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Codec::Gzip
        } else if magic.starts_with(b"BZh") {
            Codec::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Codec::Xz
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Codec::Zstd
        } else {
            Codec::None
        }
    }

    /// Codec named by a file suffix such as `tar.gz` or `xz`.
    pub fn from_suffix(suffix: &str) -> Codec {
        match suffix.rsplit('.').next().unwrap_or_default() {
            "gz" | "tgz" => Codec::Gzip,
            "bz2" => Codec::Bzip2,
            "xz" => Codec::Xz,
            "zst" => Codec::Zstd,
            _ => Codec::None,
        }
    }
}

/// Output compression accepted by the layer packager.
impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        Ok(match arg {
            "" | "none" => Codec::None,
            "gz" | "gzip" => Codec::Gzip,
            "bz2" | "bzip2" => Codec::Bzip2,
            _ => return Err(PackError::UnknownCompression(arg.to_string()).into()),
        })
    }
}

/// How `.xz` data gets decoded, decided once per invocation.
#[derive(Clone, Debug)]
pub enum XzDecoder {
    #[cfg(feature = "xz")]
    Library,
    External(PathBuf),
    Unavailable,
}

impl XzDecoder {
    /// An explicit `xz_path` wins over the built-in codec.
    pub fn resolve(xz_path: Option<&Path>) -> XzDecoder {
        match xz_path {
            Some(path) => XzDecoder::External(path.to_path_buf()),
            #[cfg(feature = "xz")]
            None => XzDecoder::Library,
            #[cfg(not(feature = "xz"))]
            None => XzDecoder::Unavailable,
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "xz")]
            XzDecoder::Library => {
                let mut out = Vec::new();
                xz2::read::XzDecoder::new_multi_decoder(data).read_to_end(&mut out)?;
                Ok(out)
            }
            XzDecoder::External(path) => xzcat(path, data),
            XzDecoder::Unavailable => Err(PackError::XzUnavailable.into()),
        }
    }
}

fn xzcat(xz_path: &Path, data: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new(xz_path)
        .args(["--decompress", "--stdout"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|_| PackError::XzUnavailable)?;
    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("xz stdin not captured"))?;
    let input = data.to_vec();
    // feed stdin from a thread so a full stdout pipe cannot deadlock us
    let feeder = thread::spawn(move || stdin.write_all(&input));
    let output = child.wait_with_output()?;
    feeder.join().map_err(|_| anyhow!("xz input thread panicked"))??;
    if !output.status.success() {
        return Err(anyhow!("{} exited with {}", xz_path.display(), output.status));
    }
    Ok(output.stdout)
}

/// Decompresses an in-memory buffer.
pub fn decompress(codec: Codec, data: Vec<u8>, xz: &XzDecoder) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match codec {
        Codec::None => return Ok(data),
        Codec::Gzip => {
            MultiGzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
        }
        Codec::Bzip2 => {
            bzip2::read::MultiBzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
        }
        Codec::Xz => return xz.decompress(&data),
        Codec::Zstd => {
            zstd::stream::read::Decoder::new(data.as_slice())?.read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

/// Opens a possibly compressed tar file as a plain stream.
///
/// Xz files are decoded through [`XzDecoder`] into memory, the other codecs
/// are streamed.
pub fn open_uncompressed(path: &Path, xz: &XzDecoder) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 6];
    let read_size = read_up_to(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    let reader: Box<dyn Read> = match Codec::detect(&magic[..read_size]) {
        Codec::None => Box::new(BufReader::new(file)),
        Codec::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(file))),
        Codec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(BufReader::new(file))),
        Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Codec::Xz => {
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Box::new(io::Cursor::new(xz.decompress(&data)?))
        }
    };
    Ok(reader)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let read_size = reader.read(&mut buf[total..])?;
        if read_size == 0 {
            break;
        }
        total += read_size;
    }
    Ok(total)
}

/// Compressing writer for layer output.
pub enum CompressWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(codec: Codec, inner: W) -> Result<CompressWriter<W>> {
        Ok(match codec {
            Codec::None => CompressWriter::Plain(inner),
            Codec::Gzip => CompressWriter::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
            Codec::Bzip2 => CompressWriter::Bzip2(bzip2::write::BzEncoder::new(inner, bzip2::Compression::default())),
            other => return Err(anyhow!("{:?} is not supported for output", other)),
        })
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::Plain(inner) => Ok(inner),
            CompressWriter::Gzip(encoder) => encoder.finish(),
            CompressWriter::Bzip2(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Plain(inner) => inner.write(buf),
            CompressWriter::Gzip(encoder) => encoder.write(buf),
            CompressWriter::Bzip2(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Plain(inner) => inner.flush(),
            CompressWriter::Gzip(encoder) => encoder.flush(),
            CompressWriter::Bzip2(encoder) => encoder.flush(),
        }
    }
}

/// Gzips a whole stream, as used for blobs of legacy image layers.
pub fn gz_copy<R: Read, W: Write>(input_reader: &mut R, output_writer: W) -> Result<W> {
    let mut encoder = GzEncoder::new(output_writer, flate2::Compression::default());
    io::copy(input_reader, &mut encoder)?;
    Ok(encoder.finish()?)
}
