// src/packages/elf.rs

//! Minimal ELF dynamic-section reader
//!
//! Only what the catalog needs: the `DT_SONAME` a shared object provides and
//! the `DT_NEEDED` entries it depends on. Both byte orders and both ELF
//! classes are handled; anything truncated or inconsistent is treated as
//! "not an ELF object" rather than an error.

const ELF_MAGIC: &[u8] = b"\x7fELF";

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const SHT_DYNAMIC: u32 = 6;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_SONAME: u64 = 14;

/// Dynamic linking information of one ELF object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicLinks {
    pub soname: Option<String>,
    pub needed: Vec<String>,
}

/// Whether `data` starts with the ELF magic
pub fn is_elf(data: &[u8]) -> bool {
    data.starts_with(ELF_MAGIC)
}

/// Read the dynamic section of an ELF object
///
/// Returns `None` for non-ELF data, malformed headers, or objects without a
/// dynamic section (static executables, relocatable objects).
pub fn scan(data: &[u8]) -> Option<DynamicLinks> {
    if !is_elf(data) {
        return None;
    }
    let reader = Reader::new(data)?;

    let (shoff, shentsize, shnum) = if reader.is64 {
        (reader.u64(0x28)?, reader.u16(0x3A)?, reader.u16(0x3C)?)
    } else {
        (
            u64::from(reader.u32(0x20)?),
            reader.u16(0x2E)?,
            reader.u16(0x30)?,
        )
    };

    let mut links = DynamicLinks::default();
    let mut found = false;

    for index in 0..u64::from(shnum) {
        let header = shoff.checked_add(index.checked_mul(u64::from(shentsize))?)?;
        let section = reader.section(usize::try_from(header).ok()?)?;
        if section.kind != SHT_DYNAMIC {
            continue;
        }
        found = true;

        let strtab_header = shoff.checked_add(u64::from(section.link) * u64::from(shentsize))?;
        let strtab = reader.section(usize::try_from(strtab_header).ok()?)?;

        let entsize = if reader.is64 { 16 } else { 8 };
        let count = section.size / entsize;
        for entry in 0..count {
            let offset = usize::try_from(section.offset.checked_add(entry * entsize)?).ok()?;
            let (tag, value) = if reader.is64 {
                (reader.u64(offset)?, reader.u64(offset.checked_add(8)?)?)
            } else {
                (
                    u64::from(reader.u32(offset)?),
                    u64::from(reader.u32(offset.checked_add(4)?)?),
                )
            };
            match tag {
                DT_NULL => break,
                DT_NEEDED => links
                    .needed
                    .push(reader.string(strtab.offset.checked_add(value)?)?),
                DT_SONAME => {
                    links.soname = Some(reader.string(strtab.offset.checked_add(value)?)?)
                }
                _ => {}
            }
        }
    }

    found.then_some(links)
}

struct Section {
    kind: u32,
    offset: u64,
    size: u64,
    link: u32,
}

struct Reader<'a> {
    data: &'a [u8],
    is64: bool,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        let is64 = match *data.get(4)? {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            _ => return None,
        };
        let big_endian = match *data.get(5)? {
            ELFDATA2LSB => false,
            ELFDATA2MSB => true,
            _ => return None,
        };
        Some(Self {
            data,
            is64,
            big_endian,
        })
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.data.get(offset..end)?.try_into().ok()
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let b = self.bytes::<2>(offset)?;
        Some(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let b = self.bytes::<4>(offset)?;
        Some(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn u64(&self, offset: usize) -> Option<u64> {
        let b = self.bytes::<8>(offset)?;
        Some(if self.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    fn section(&self, header: usize) -> Option<Section> {
        let at = |field: usize| header.checked_add(field);
        if self.is64 {
            Some(Section {
                kind: self.u32(at(4)?)?,
                offset: self.u64(at(0x18)?)?,
                size: self.u64(at(0x20)?)?,
                link: self.u32(at(0x28)?)?,
            })
        } else {
            Some(Section {
                kind: self.u32(at(4)?)?,
                offset: u64::from(self.u32(at(0x10)?)?),
                size: u64::from(self.u32(at(0x14)?)?),
                link: self.u32(at(0x18)?)?,
            })
        }
    }

    /// NUL-terminated string at `offset`
    fn string(&self, offset: u64) -> Option<String> {
        let start = usize::try_from(offset).ok()?;
        let rest = self.data.get(start..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}
