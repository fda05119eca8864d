//! DfuSe memory layout
//!
//! A DfuSe device describes each alternate setting's memory in the
//! setting's string descriptor, e.g.
//!
//! ```text
//! @Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg
//! ```
//!
//! After the name comes one or more `/address/segments` groups. Each
//! segment is `count*size[multiplier]type` where the multiplier is `B`,
//! `K`, `M` or a blank, and the type is a letter `a`..`g` whose low three
//! bits are the readable, erasable and writable capabilities.

use core::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Capabilities of a memory segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u8 {
        /// Segment can be read (uploaded)
        const READABLE = 1 << 0;
        /// Segment can be erased
        const ERASABLE = 1 << 1;
        /// Segment can be written (downloaded)
        const WRITABLE = 1 << 2;
        /// Last segment of the layout
        const LAST     = 1 << 3;
    }
}

impl Default for SegmentFlags {
    fn default() -> Self {
        SegmentFlags::empty()
    }
}

impl SegmentFlags {
    /// Decode a segment type letter (`a`..`g`)
    pub fn from_type_char(c: char) -> Option<Self> {
        if !('a'..='g').contains(&c) {
            return None;
        }
        Some(SegmentFlags::from_bits_truncate(c as u8 & 0x07))
    }
}

/// A contiguous run of equally sized pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    /// First address (inclusive)
    pub start: u32,
    /// Last address (inclusive)
    pub end: u32,
    /// Page (sector) size in bytes
    pub page_size: u32,
    /// Capabilities
    pub flags: SegmentFlags,
}

impl MemorySegment {
    /// Check if an address is within this segment
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    /// Size of the segment in bytes
    pub fn size(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    /// Base address of the page containing `address`
    pub fn page_base(&self, address: u32) -> u32 {
        address - address % self.page_size
    }

    /// Whether pages of this segment can be erased
    pub fn is_erasable(&self) -> bool {
        self.flags.contains(SegmentFlags::ERASABLE)
    }

    /// Whether this segment can be written
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SegmentFlags::WRITABLE)
    }

    /// Whether this segment can be read
    pub fn is_readable(&self) -> bool {
        self.flags.contains(SegmentFlags::READABLE)
    }
}

impl fmt::Display for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08X} - 0x{:08X} pages of {:>6} bytes {}{}{}",
            self.start,
            self.end,
            self.page_size,
            if self.is_readable() { 'r' } else { '-' },
            if self.is_erasable() { 'e' } else { '-' },
            if self.is_writable() { 'w' } else { '-' },
        )
    }
}

/// Memory layout of one DfuSe alternate setting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Name of the memory (e.g. "Internal Flash")
    pub name: String,
    /// Segments ordered by address
    pub segments: Vec<MemorySegment>,
}

impl MemoryLayout {
    /// Parse a DfuSe memory layout string
    pub fn parse(desc: &str) -> Result<Self> {
        let desc = desc.trim();
        let body = desc.strip_prefix('@').unwrap_or(desc);
        let slash = body.find('/').ok_or_else(|| {
            Error::InvalidLayout(format!("no address in memory layout \"{}\"", desc))
        })?;

        let mut layout = MemoryLayout {
            name: body[..slash].trim().to_string(),
            segments: Vec::new(),
        };

        let mut groups = body[slash + 1..].split('/');
        while let Some(address) = groups.next() {
            let address = address.trim();
            if address.is_empty() {
                break;
            }
            let mut next = parse_address(address)?;
            let list = groups.next().ok_or_else(|| {
                Error::InvalidLayout(format!("no segments after address {}", address))
            })?;

            for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let (count, page_size, flags) = parse_segment(entry)?;
                let size = u64::from(count) * u64::from(page_size);
                let end = u64::from(next) + size - 1;
                if end > u64::from(u32::MAX) {
                    return Err(Error::InvalidLayout(format!(
                        "segment {} at 0x{:08X} exceeds the address space",
                        entry, next
                    )));
                }
                layout.segments.push(MemorySegment {
                    start: next,
                    end: end as u32,
                    page_size,
                    flags,
                });
                next = next.wrapping_add(size as u32);
            }
        }

        if layout.segments.is_empty() {
            return Err(Error::InvalidLayout(format!(
                "no segments in memory layout \"{}\"",
                desc
            )));
        }
        if let Some(last) = layout.segments.last_mut() {
            last.flags |= SegmentFlags::LAST;
        }

        log::debug!(
            "Memory layout \"{}\": {} segments",
            layout.name,
            layout.segments.len()
        );
        for segment in &layout.segments {
            log::trace!("  {}", segment);
        }

        Ok(layout)
    }

    /// Find the segment containing `address`
    pub fn resolve(&self, address: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if the layout has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

fn parse_address(s: &str) -> Result<u32> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| Error::InvalidLayout(format!("address {} is not hexadecimal", s)))?;
    u32::from_str_radix(hex, 16).map_err(|_| Error::InvalidLayout(format!("bad address {}", s)))
}

/// Parse one `count*size[multiplier]type` segment description
fn parse_segment(entry: &str) -> Result<(u32, u32, SegmentFlags)> {
    let bad = || Error::InvalidLayout(format!("bad segment description \"{}\"", entry));

    let (count, rest) = entry.split_once('*').ok_or_else(bad)?;
    let count: u32 = count.trim().parse().map_err(|_| bad())?;
    if count == 0 {
        return Err(Error::InvalidLayout(format!(
            "zero page count in segment \"{}\"",
            entry
        )));
    }

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let mut size: u32 = rest[..digits_end].parse().map_err(|_| bad())?;
    let mut suffix = rest[digits_end..].chars();

    let flags = match (suffix.next(), suffix.next()) {
        (Some(t @ 'a'..='g'), _) => SegmentFlags::from_type_char(t),
        (Some(multiplier), t) => {
            match multiplier {
                'B' | ' ' => {}
                'K' => size = size.checked_mul(1024).ok_or_else(bad)?,
                'M' => size = size.checked_mul(1024 * 1024).ok_or_else(bad)?,
                other => {
                    log::warn!(
                        "Non-valid multiplier '{}' in \"{}\", interpreted as type identifier",
                        other,
                        entry
                    );
                    return Ok((count, check_size(size, entry)?, type_flags(other, entry)));
                }
            }
            t.and_then(SegmentFlags::from_type_char)
        }
        (None, _) => None,
    };

    let flags = flags.unwrap_or_else(|| {
        log::warn!("No valid type for segment \"{}\"", entry);
        SegmentFlags::empty()
    });

    Ok((count, check_size(size, entry)?, flags))
}

fn check_size(size: u32, entry: &str) -> Result<u32> {
    if size == 0 {
        return Err(Error::InvalidLayout(format!(
            "zero page size in segment \"{}\"",
            entry
        )));
    }
    Ok(size)
}

fn type_flags(c: char, entry: &str) -> SegmentFlags {
    SegmentFlags::from_type_char(c).unwrap_or_else(|| {
        log::warn!("No valid type for segment \"{}\"", entry);
        SegmentFlags::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STM32F4: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

    #[test]
    fn test_parse_stm32f4_flash() {
        let layout = MemoryLayout::parse(STM32F4).unwrap();
        assert_eq!(layout.name, "Internal Flash");
        assert_eq!(layout.len(), 3);

        let first = layout.segments[0];
        assert_eq!(first.start, 0x0800_0000);
        assert_eq!(first.end, 0x0800_FFFF);
        assert_eq!(first.page_size, 16 * 1024);
        assert!(first.is_readable() && first.is_erasable() && first.is_writable());
        assert!(!first.flags.contains(SegmentFlags::LAST));

        let second = layout.segments[1];
        assert_eq!(second.start, 0x0801_0000);
        assert_eq!(second.end, 0x0801_FFFF);
        assert_eq!(second.page_size, 64 * 1024);

        let last = layout.segments[2];
        assert_eq!(last.start, 0x0802_0000);
        assert_eq!(last.end, 0x080F_FFFF);
        assert!(last.flags.contains(SegmentFlags::LAST));
    }

    #[test]
    fn test_resolve() {
        let layout = MemoryLayout::parse(STM32F4).unwrap();
        assert_eq!(layout.resolve(0x0800_4000).unwrap().page_size, 16 * 1024);
        assert_eq!(layout.resolve(0x0801_0000).unwrap().page_size, 64 * 1024);
        assert_eq!(layout.resolve(0x080F_FFFF).unwrap().page_size, 128 * 1024);
        assert!(layout.resolve(0x0810_0000).is_none());
        assert!(layout.resolve(0x07FF_FFFF).is_none());
    }

    #[test]
    fn test_parse_option_bytes_blank_multiplier() {
        let layout = MemoryLayout::parse("@Option Bytes  /0x1FFFC000/01*016 e").unwrap();
        let seg = layout.segments[0];
        assert_eq!(seg.start, 0x1FFF_C000);
        assert_eq!(seg.end, 0x1FFF_C00F);
        assert_eq!(seg.page_size, 16);
        assert!(seg.is_readable() && seg.is_writable());
        assert!(!seg.is_erasable());
    }

    #[test]
    fn test_parse_type_without_multiplier() {
        let layout = MemoryLayout::parse("@OTP Memory /0x1FFF7800/01*512a").unwrap();
        let seg = layout.segments[0];
        assert_eq!(seg.page_size, 512);
        assert_eq!(seg.flags, SegmentFlags::READABLE | SegmentFlags::LAST);
    }

    #[test]
    fn test_parse_multiple_groups() {
        let layout =
            MemoryLayout::parse("@Flash /0x08000000/02*001Ka,02*001Kg/0x20000000/01*004Ke")
                .unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.segments[1].start, 0x0800_0800);
        assert!(layout.segments[1].is_erasable());
        assert_eq!(layout.segments[2].start, 0x2000_0000);
        assert_eq!(layout.segments[2].end, 0x2000_0FFF);
        assert!(!layout.segments[2].is_erasable());
    }

    #[test]
    fn test_page_base() {
        let layout = MemoryLayout::parse("@Flash /0x08000000/64*002Kg").unwrap();
        let seg = layout.resolve(0x0800_0FFF).unwrap();
        assert_eq!(seg.page_base(0x0800_0FFF), 0x0800_0800);
        assert_eq!(seg.page_base(0x0800_0800), 0x0800_0800);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            MemoryLayout::parse("@Internal Flash"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /08000000/04*016Kg"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /0x08000000/"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /0x08000000/04*000Kg"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /0xFFFF0000/02*064Kg"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /0x00000000/00*002Kg"),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            MemoryLayout::parse("@Flash /0x08000000/00*002Kg,04*002Kg"),
            Err(Error::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_page_base_non_power_of_two() {
        let layout = MemoryLayout::parse("@Flash /0x00000000/04*003Kg").unwrap();
        let seg = layout.resolve(0x1000).unwrap();
        assert_eq!(seg.page_base(0x1000), 0x0C00);
        assert_eq!(seg.page_base(0x17FF), 0x0C00);
        assert_eq!(seg.page_base(0x1800), 0x1800);
    }
}
