//! Archive primitives: the deterministic layer writer and an `ar` reader.
//!
//! Member names are written verbatim (a leading `./` is significant in
//! image layers), so headers are filled here instead of through
//! `tar::Builder::append_data`, which normalises paths.

use std::io::{self, Read, Write};

use tar::{Builder, EntryType, Header};

pub mod ar;
pub mod writer;

const NAME_FIELD_LEN: usize = 100;

/// Appends one member with an exact `name` (and `link` target), emitting GNU
/// long-name records when either does not fit the header.
pub fn append_raw<W: Write, R: Read>(
    builder: &mut Builder<W>,
    header: &mut Header,
    name: &[u8],
    link: Option<&[u8]>,
    data: R,
) -> io::Result<()> {
    if name.len() > NAME_FIELD_LEN {
        append_long(builder, EntryType::GNULongName, name)?;
    }
    if let Some(link) = link {
        if link.len() > NAME_FIELD_LEN {
            append_long(builder, EntryType::GNULongLink, link)?;
        }
    }
    let old = header.as_old_mut();
    old.name = [0; NAME_FIELD_LEN];
    let name_len = name.len().min(NAME_FIELD_LEN);
    old.name[..name_len].copy_from_slice(&name[..name_len]);
    old.linkname = [0; NAME_FIELD_LEN];
    if let Some(link) = link {
        let link_len = link.len().min(NAME_FIELD_LEN);
        old.linkname[..link_len].copy_from_slice(&link[..link_len]);
    }
    header.set_cksum();
    builder.append(header, data)
}

fn append_long<W: Write>(builder: &mut Builder<W>, kind: EntryType, value: &[u8]) -> io::Result<()> {
    const LONG_LINK: &[u8] = b"././@LongLink";
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..LONG_LINK.len()].copy_from_slice(LONG_LINK);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(value.len() as u64 + 1);
    header.set_entry_type(kind);
    header.set_cksum();
    builder.append(&header, value.chain(&b"\0"[..]))
}

/// Fresh GNU header carrying the metadata of `src` (type, mode, owner, size,
/// mtime, device numbers) but none of its name fields. Blank or unparsable
/// owner and mtime fields read as 0.
pub fn copy_metadata(src: &Header) -> io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(src.entry_type());
    header.set_mode(src.mode()?);
    header.set_uid(src.uid().unwrap_or(0));
    header.set_gid(src.gid().unwrap_or(0));
    header.set_mtime(src.mtime().unwrap_or(0));
    header.set_size(src.entry_size()?);
    if let Ok(Some(uname)) = src.username() {
        header.set_username(uname)?;
    }
    if let Ok(Some(gname)) = src.groupname() {
        header.set_groupname(gname)?;
    }
    if let (Ok(Some(major)), Ok(Some(minor))) = (src.device_major(), src.device_minor()) {
        header.set_device_major(major)?;
        header.set_device_minor(minor)?;
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use tar::Archive;

    use super::*;

    #[test]
    fn keeps_dot_slash_and_long_names() -> io::Result<()> {
        let long_name = format!("./{}/file", "d".repeat(120));
        let mut builder = Builder::new(Vec::new());
        for name in ["./usr/bin/tool", long_name.as_str()] {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(2);
            append_raw(&mut builder, &mut header, name.as_bytes(), None, &b"hi"[..])?;
        }
        let bytes = builder.into_inner()?;

        let mut archive = Archive::new(bytes.as_slice());
        let names = archive
            .entries()?
            .map(|entry| Ok(String::from_utf8_lossy(&entry?.path_bytes()).into_owned()))
            .collect::<io::Result<Vec<String>>>()?;
        assert_eq!(names, vec!["./usr/bin/tool".to_string(), long_name]);
        Ok(())
    }

    #[test]
    fn blank_numeric_fields_read_as_zero() -> io::Result<()> {
        let mut src = Header::new_gnu();
        src.set_entry_type(EntryType::Regular);
        src.set_mode(0o640);
        src.set_size(3);
        let old = src.as_old_mut();
        old.uid = [0; 8];
        old.gid = [0; 8];
        old.mtime = [0; 12];
        assert!(src.uid().is_err());

        let header = copy_metadata(&src)?;
        assert_eq!((header.uid()?, header.gid()?, header.mtime()?), (0, 0, 0));
        assert_eq!((header.mode()?, header.entry_size()?), (0o640, 3));
        Ok(())
    }
}
