//! The browsable file-list document: bzip2-compressed UTF-8 XML.
//!
//! Wire schema:
//!
//! ```xml
//! <FileListing Version="1" Generator="…" CID="…" Base="/">
//!   <Directory Name="…">
//!     <File Name="…" Size="N" TTH="…"/>
//!   </Directory>
//! </FileListing>
//! ```

use crate::{ShareDirectory, ShareError, ShareResult, ShareTree};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use dctk_hash::TigerHash;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::{Read, Write};

/// Fixed name every peer serves its list under.
pub const FILE_LIST_NAME: &str = "files.xml.bz2";

/// A file entry recovered from a downloaded list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListFile {
    pub name: String,
    pub size: u64,
    pub tth: TigerHash,
}

/// A directory recovered from a downloaded list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileListDirectory {
    pub name: String,
    pub dirs: Vec<FileListDirectory>,
    pub files: Vec<FileListFile>,
}

impl FileListDirectory {
    /// Total number of files below this directory.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.iter().map(|d| d.file_count()).sum::<usize>()
    }
}

/// A parsed file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileList {
    pub generator: String,
    pub cid: String,
    /// Unnamed root holding the share aliases.
    pub root: FileListDirectory,
}

fn xml_err<E: std::fmt::Display>(e: E) -> ShareError {
    ShareError::FileList(e.to_string())
}

/// Render a share tree as `files.xml.bz2` content.
pub fn generate_file_list(share: &ShareTree, generator: &str, cid: &str) -> ShareResult<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("FileListing");
    root.push_attribute(("Version", "1"));
    root.push_attribute(("Generator", generator));
    root.push_attribute(("CID", cid));
    root.push_attribute(("Base", "/"));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    for dir in &share.roots {
        write_directory(&mut writer, dir)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("FileListing")))
        .map_err(xml_err)?;

    let xml = writer.into_inner();
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&xml)?;
    Ok(encoder.finish()?)
}

fn write_directory(writer: &mut Writer<Vec<u8>>, dir: &ShareDirectory) -> ShareResult<()> {
    let mut start = BytesStart::new("Directory");
    start.push_attribute(("Name", dir.name.as_str()));
    writer.write_event(Event::Start(start)).map_err(xml_err)?;

    for sub in &dir.dirs {
        write_directory(writer, sub)?;
    }
    for file in &dir.files {
        let mut elem = BytesStart::new("File");
        elem.push_attribute(("Name", file.name.as_str()));
        elem.push_attribute(("Size", file.size.to_string().as_str()));
        elem.push_attribute(("TTH", file.tth.to_string().as_str()));
        writer.write_event(Event::Empty(elem)).map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Directory")))
        .map_err(xml_err)?;
    Ok(())
}

/// Parse a file list back into a tree. Accepts the wire form (bzip2) as
/// well as already-unpacked XML, which is what a finished file-list
/// download hands back.
pub fn parse_file_list(data: &[u8]) -> ShareResult<FileList> {
    let mut xml = Vec::new();
    if data.starts_with(b"BZh") {
        BzDecoder::new(data).read_to_end(&mut xml)?;
    } else {
        xml.extend_from_slice(data);
    }

    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();

    let mut generator = String::new();
    let mut cid = String::new();
    let mut stack: Vec<FileListDirectory> = Vec::new();
    let mut root: Option<FileListDirectory> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"FileListing" => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let value = attr.unescape_value().map_err(xml_err)?.to_string();
                        match attr.key.as_ref() {
                            b"Generator" => generator = value,
                            b"CID" => cid = value,
                            _ => {}
                        }
                    }
                    stack.push(FileListDirectory::default());
                }
                b"Directory" => {
                    stack.push(FileListDirectory {
                        name: attribute(&e, b"Name")?,
                        ..Default::default()
                    });
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"File" => {
                    let parent = stack
                        .last_mut()
                        .ok_or_else(|| ShareError::FileList("file outside listing".into()))?;
                    parent.files.push(FileListFile {
                        name: attribute(&e, b"Name")?,
                        size: attribute(&e, b"Size")?
                            .parse()
                            .map_err(|_| ShareError::FileList("bad Size attribute".into()))?,
                        tth: TigerHash::from_base32(&attribute(&e, b"TTH")?)
                            .map_err(|_| ShareError::FileList("bad TTH attribute".into()))?,
                    });
                }
                b"Directory" => {
                    let parent = stack
                        .last_mut()
                        .ok_or_else(|| ShareError::FileList("directory outside listing".into()))?;
                    parent.dirs.push(FileListDirectory {
                        name: attribute(&e, b"Name")?,
                        ..Default::default()
                    });
                }
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"Directory" => {
                    let done = stack
                        .pop()
                        .ok_or_else(|| ShareError::FileList("unbalanced directory".into()))?;
                    let parent = stack
                        .last_mut()
                        .ok_or_else(|| ShareError::FileList("directory outside listing".into()))?;
                    parent.dirs.push(done);
                }
                b"FileListing" => {
                    root = stack.pop();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let root = root.ok_or_else(|| ShareError::FileList("missing FileListing root".into()))?;
    Ok(FileList {
        generator,
        cid,
        root,
    })
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> ShareResult<String> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == key {
            return Ok(attr.unescape_value().map_err(xml_err)?.to_string());
        }
    }
    Err(ShareError::FileList(format!(
        "missing attribute {}",
        String::from_utf8_lossy(key)
    )))
}

/// Render a magnet URI for one file.
pub fn magnet_link(name: &str, size: u64, tth: TigerHash) -> String {
    format!(
        "magnet:?xt=urn:tree:tiger:{}&xl={}&dn={}",
        tth,
        size,
        percent_encode(name)
    )
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShareFile;
    use dctk_hash::tth_of_bytes;
    use std::path::PathBuf;

    fn sample_file(name: &str, content: &[u8]) -> ShareFile {
        let digest = dctk_hash::leaves_of_bytes(content);
        ShareFile {
            name: name.to_string(),
            real_path: PathBuf::from("/tmp").join(name),
            share_path: format!("share/{}", name),
            size: content.len() as u64,
            tth: digest.root,
            leaves: digest.leaves,
        }
    }

    fn sample_tree() -> ShareTree {
        ShareTree {
            roots: vec![ShareDirectory {
                name: "share".into(),
                dirs: vec![ShareDirectory {
                    name: "docs & notes".into(),
                    dirs: vec![],
                    files: vec![sample_file("readme <1>.txt", b"readme")],
                }],
                files: vec![
                    sample_file("a.txt", b"aaaa"),
                    sample_file("b.txt", b"bbbb"),
                ],
            }],
        }
    }

    #[test]
    fn test_file_list_roundtrip() {
        let tree = sample_tree();
        let blob = generate_file_list(&tree, "dctk 0.1", "CIDCIDCID").unwrap();
        let list = parse_file_list(&blob).unwrap();

        assert_eq!(list.generator, "dctk 0.1");
        assert_eq!(list.cid, "CIDCIDCID");
        assert_eq!(list.root.dirs.len(), 1);

        let share = &list.root.dirs[0];
        assert_eq!(share.name, "share");
        assert_eq!(share.files.len(), 2);
        assert_eq!(share.files[0].name, "a.txt");
        assert_eq!(share.files[0].size, 4);
        assert_eq!(share.files[0].tth, tth_of_bytes(b"aaaa"));

        // XML-hostile names survive the trip.
        assert_eq!(share.dirs[0].name, "docs & notes");
        assert_eq!(share.dirs[0].files[0].name, "readme <1>.txt");
    }

    #[test]
    fn test_file_list_is_bzip2() {
        let blob = generate_file_list(&sample_tree(), "dctk", "CID").unwrap();
        // bzip2 magic.
        assert_eq!(&blob[..3], b"BZh");
        assert!(parse_file_list(b"not bzip2").is_err());
    }

    #[test]
    fn test_empty_share_list() {
        let blob = generate_file_list(&ShareTree::empty(), "dctk", "CID").unwrap();
        let list = parse_file_list(&blob).unwrap();
        assert_eq!(list.root.file_count(), 0);
    }

    #[test]
    fn test_magnet_link() {
        let tth = tth_of_bytes(b"content");
        let uri = magnet_link("test file.txt", 7, tth);
        assert_eq!(
            uri,
            format!("magnet:?xt=urn:tree:tiger:{}&xl=7&dn=test%20file.txt", tth)
        );
    }
}
