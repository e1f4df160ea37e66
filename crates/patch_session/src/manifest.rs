//! Identity of an APK read from its compiled `AndroidManifest.xml`.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use shared::domain::PackageName;
use thiserror::Error;
use zip::{result::ZipError, ZipArchive};

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' is not a readable APK: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("malformed binary manifest: {0}")]
    Malformed(&'static str),
    #[error("manifest does not declare a package name")]
    MissingPackage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApkManifest {
    pub package_name: Option<String>,
    pub application_name: Option<String>,
    pub app_component_factory: Option<String>,
}

impl ApkManifest {
    pub fn package(&self) -> Result<PackageName, ManifestError> {
        self.package_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(PackageName::new)
            .ok_or(ManifestError::MissingPackage)
    }

    fn absorb(&mut self, element: &Element) {
        match element.name.as_str() {
            "manifest" if self.package_name.is_none() => {
                self.package_name = element.attribute("package");
            }
            "application" => {
                if self.application_name.is_none() {
                    self.application_name = element.attribute("name");
                }
                if self.app_component_factory.is_none() {
                    self.app_component_factory = element.attribute("appComponentFactory");
                }
            }
            _ => {}
        }
    }

    fn is_complete(&self) -> bool {
        self.package_name.is_some()
            && self.application_name.is_some()
            && self.app_component_factory.is_some()
    }
}

/// Reads the manifest of a base or split APK.
pub fn read_apk_manifest(path: &Path) -> Result<ApkManifest, ManifestError> {
    let io_err = |source: io::Error| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let archive_err = |source: ZipError| ManifestError::Archive {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let mut archive = ZipArchive::new(file).map_err(archive_err)?;
    let mut entry = archive.by_name(MANIFEST_ENTRY).map_err(archive_err)?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data).map_err(io_err)?;
    parse_binary_manifest(&data)
}

/// Extracts the package, application class and component factory from a
/// compiled (AXML) manifest. Elements after the first `<manifest>` and
/// `<application>` are ignored.
pub fn parse_binary_manifest(data: &[u8]) -> Result<ApkManifest, ManifestError> {
    let mut reader = Reader { data, pos: 0 };
    let document = reader.chunk_header()?;
    if document.chunk_type != RES_XML_TYPE {
        return Err(ManifestError::Malformed("not a binary XML document"));
    }
    reader.seek(document.start + document.header_size)?;

    let mut pool: Option<StringPool> = None;
    let mut manifest = ApkManifest::default();
    while reader.pos < document.end {
        let header = reader.chunk_header()?;
        match header.chunk_type {
            RES_STRING_POOL_TYPE if pool.is_none() => {
                pool = Some(StringPool::parse(&mut reader, &header)?);
            }
            RES_XML_START_ELEMENT_TYPE => {
                let pool = pool
                    .as_ref()
                    .ok_or(ManifestError::Malformed("element before string pool"))?;
                manifest.absorb(&Element::parse(&mut reader, &header, pool)?);
                if manifest.is_complete() {
                    break;
                }
            }
            _ => {}
        }
        reader.seek(header.end)?;
    }
    Ok(manifest)
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: usize,
    start: usize,
    end: usize,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], ManifestError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or(ManifestError::Malformed("unexpected end of document"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ManifestError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ManifestError> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, ManifestError> {
        self.take().map(u32::from_le_bytes)
    }

    fn seek(&mut self, pos: usize) -> Result<(), ManifestError> {
        if pos > self.data.len() {
            return Err(ManifestError::Malformed("seek past end of document"));
        }
        self.pos = pos;
        Ok(())
    }

    fn chunk_header(&mut self) -> Result<ChunkHeader, ManifestError> {
        let start = self.pos;
        let chunk_type = self.u16()?;
        let header_size = self.u16()? as usize;
        let size = self.u32()? as usize;
        if header_size < 8 || size < header_size {
            return Err(ManifestError::Malformed("invalid chunk size"));
        }
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.data.len())
            .ok_or(ManifestError::Malformed("chunk extends past end of document"))?;
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            start,
            end,
        })
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut Reader<'_>, header: &ChunkHeader) -> Result<Self, ManifestError> {
        let count = reader.u32()? as usize;
        let _style_count = reader.u32()?;
        let flags = reader.u32()?;
        let strings_start = reader.u32()? as usize;
        reader.seek(header.start + header.header_size)?;

        let base = header.start + strings_start;
        let data = reader.data;
        let chunk = &data[..header.end];
        let mut strings = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let at = base + reader.u32()? as usize;
            let text = if flags & STRING_FLAG_UTF8 != 0 {
                utf8_string(chunk, at)?
            } else {
                utf16_string(chunk, at)?
            };
            strings.push(text);
        }
        Ok(Self { strings })
    }

    fn get(&self, index: u32) -> Option<&str> {
        if index == NO_ENTRY {
            return None;
        }
        self.strings.get(index as usize).map(String::as_str)
    }
}

fn byte_at(data: &[u8], at: usize) -> Result<u8, ManifestError> {
    data.get(at)
        .copied()
        .ok_or(ManifestError::Malformed("string outside its pool"))
}

fn u16_at(data: &[u8], at: usize) -> Result<u16, ManifestError> {
    Ok(u16::from_le_bytes([byte_at(data, at)?, byte_at(data, at + 1)?]))
}

fn utf8_length(data: &[u8], at: usize) -> Result<(usize, usize), ManifestError> {
    let first = byte_at(data, at)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let second = byte_at(data, at + 1)?;
    Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
}

fn utf8_string(data: &[u8], at: usize) -> Result<String, ManifestError> {
    let (_, skip) = utf8_length(data, at)?;
    let (len, skip_bytes) = utf8_length(data, at + skip)?;
    let start = at + skip + skip_bytes;
    let bytes = data
        .get(start..start + len)
        .ok_or(ManifestError::Malformed("string outside its pool"))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ManifestError::Malformed("invalid UTF-8 string"))
}

fn utf16_string(data: &[u8], at: usize) -> Result<String, ManifestError> {
    let first = u16_at(data, at)?;
    let (len, skip) = if first & 0x8000 == 0 {
        (first as usize, 2)
    } else {
        let second = u16_at(data, at + 2)?;
        ((((first & 0x7FFF) as usize) << 16) | second as usize, 4)
    };
    let units = (0..len)
        .map(|i| u16_at(data, at + skip + i * 2))
        .collect::<Result<Vec<_>, _>>()?;
    String::from_utf16(&units).map_err(|_| ManifestError::Malformed("invalid UTF-16 string"))
}

struct Element {
    name: String,
    attributes: Vec<(String, Option<String>)>,
}

impl Element {
    fn parse(
        reader: &mut Reader<'_>,
        header: &ChunkHeader,
        pool: &StringPool,
    ) -> Result<Self, ManifestError> {
        let ext = header.start + header.header_size;
        reader.seek(ext)?;
        let _namespace = reader.u32()?;
        let name = pool
            .get(reader.u32()?)
            .ok_or(ManifestError::Malformed("element name out of range"))?
            .to_string();
        let attribute_start = reader.u16()? as usize;
        let attribute_size = reader.u16()? as usize;
        let count = reader.u16()? as usize;
        if attribute_size < 20 || ext + attribute_start + count * attribute_size > header.end {
            return Err(ManifestError::Malformed("attributes overrun element"));
        }

        let mut attributes = Vec::with_capacity(count);
        for i in 0..count {
            reader.seek(ext + attribute_start + i * attribute_size)?;
            let _namespace = reader.u32()?;
            let name = reader.u32()?;
            let raw = reader.u32()?;
            let _size = reader.u16()?;
            let _res0 = reader.u8()?;
            let data_type = reader.u8()?;
            let data = reader.u32()?;

            let Some(name) = pool.get(name) else {
                continue;
            };
            let value = match (pool.get(raw), data_type) {
                (Some(raw), _) => Some(raw.to_string()),
                (None, TYPE_STRING) => pool.get(data).map(str::to_string),
                (None, TYPE_INT_DEC) => Some((data as i32).to_string()),
                _ => None,
            };
            attributes.push((name.to_string(), value));
        }
        Ok(Self { name, attributes })
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .and_then(|(_, value)| value.clone())
    }
}

#[cfg(test)]
#[path = "tests/manifest_tests.rs"]
mod tests;
