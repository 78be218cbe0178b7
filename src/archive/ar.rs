//! Minimal reader for the `ar` container used by Debian packages.

use std::io::{self, Read};

use anyhow::{anyhow, Result};

const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;

pub struct ArMember {
    pub filename: String,
    pub data: Vec<u8>,
}

pub struct ArReader<R: Read> {
    reader: R,
}

impl<R: Read> ArReader<R> {
    pub fn new(mut reader: R) -> Result<ArReader<R>> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(|_| anyhow!("not an ar archive: truncated magic"))?;
        if &magic != AR_MAGIC {
            return Err(anyhow!("not an ar archive: bad magic"));
        }
        Ok(ArReader { reader })
    }

    /// Next member, or `None` at the end of the archive.
    pub fn next_member(&mut self) -> Result<Option<ArMember>> {
        let mut header = [0u8; HEADER_LEN];
        if !read_header(&mut self.reader, &mut header)? {
            return Ok(None);
        }
        if &header[58..60] != b"`\n" {
            return Err(anyhow!("corrupt ar member header"));
        }
        let raw_name = field(&header[0..16]);
        let size: u64 = field(&header[48..58])
            .parse()
            .map_err(|_| anyhow!("bad ar member size for {:?}", raw_name))?;

        let mut data = Vec::new();
        (&mut self.reader).take(size).read_to_end(&mut data)?;
        if (data.len() as u64) < size {
            return Err(anyhow!("ar member {:?} truncated: {} of {} bytes", raw_name, data.len(), size));
        }
        if size % 2 == 1 {
            let mut pad = [0u8; 1];
            // the final padding byte may be missing
            let _ = self.reader.read(&mut pad)?;
        }

        // BSD variant: "#1/<len>" with the name stored ahead of the data
        let filename = match raw_name.strip_prefix("#1/") {
            Some(len) => {
                let len: usize = len.parse().map_err(|_| anyhow!("bad BSD ar name {:?}", raw_name))?;
                if len > data.len() {
                    return Err(anyhow!("BSD ar name longer than member"));
                }
                let name = String::from_utf8_lossy(&data[..len]).trim_end_matches('\0').to_string();
                data.drain(..len);
                name
            }
            None => raw_name.trim_end_matches('/').to_string(),
        };
        Ok(Some(ArMember { filename, data }))
    }
}

fn field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn read_header<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut total = 0;
    while total < buf.len() {
        let read_size = reader.read(&mut buf[total..])?;
        if read_size == 0 {
            if total == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated ar header"));
        }
        total += read_size;
    }
    Ok(true)
}

/// Builds an `ar` archive, used by tests to fabricate packages.
#[cfg(test)]
pub fn build_ar(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = AR_MAGIC.to_vec();
    for (name, data) in members {
        let header = format!("{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", name, 0, 0, 0, "100644", data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}
