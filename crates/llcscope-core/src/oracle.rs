//! Clients for the external address oracles and the color-tagged allocator.
//!
//! Both kernel collaborators speak line-oriented text over a proc file. The
//! oracles exist purely for diagnostics — coloring self-checks, sanity
//! prints — and their absence disables those, never the build itself.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::cache::{CacheGeometry, PAGE_SHIFT};

pub const HPA_ORACLE_PATH: &str = "/proc/gpa_hpa";
pub const COLOR_ALLOCATOR_PATH: &str = "/proc/vcolor";

/// Guest-virtual to guest-physical translation via `/proc/self/pagemap`.
///
/// Returns `None` for unmapped pages or when pagemap is unreadable
/// (non-root readers get zeroed PFNs).
pub fn virt_to_phys(va: *const u8) -> Option<u64> {
    let page_size = 1u64 << PAGE_SHIFT;
    let mut f = File::open("/proc/self/pagemap").ok()?;
    let offset = (va as u64 / page_size) * 8;
    f.seek(SeekFrom::Start(offset)).ok()?;
    let mut entry = [0u8; 8];
    f.read_exact(&mut entry).ok()?;
    let entry = u64::from_le_bytes(entry);
    if entry & (1 << 63) == 0 {
        return None; // not present
    }
    let pfn = entry & ((1 << 55) - 1);
    if pfn == 0 {
        return None;
    }
    Some((pfn << PAGE_SHIFT) | (va as u64 & (page_size - 1)))
}

/// Client for the guest-physical → host-physical hypercall bridge.
///
/// Protocol: write the guest PFN in hex, read back one line of the form
/// `HPA=0xHEX PFN=0xHEX FLAGS=0xHEX`.
pub struct HpaOracle {
    file: File,
}

impl HpaOracle {
    pub fn open() -> std::io::Result<Self> {
        Self::open_at(HPA_ORACLE_PATH)
    }

    pub fn open_at(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Host-physical address backing a guest-virtual one.
    pub fn hpa_of(&mut self, va: *const u8) -> Option<u64> {
        let gpa = virt_to_phys(va)?;
        let pfn = gpa >> PAGE_SHIFT;
        let offset = va as u64 & ((1 << PAGE_SHIFT) - 1);

        self.file.write_all(format!("{pfn:x}").as_bytes()).ok()?;

        let mut buf = [0u8; 256];
        let n = self.file.read(&mut buf).ok()?;
        let line = std::str::from_utf8(&buf[..n]).ok()?;
        let hpa = parse_hpa_response(line)?;
        Some(hpa | offset)
    }
}

/// Extract the HPA field from a `HPA=0x… PFN=0x… FLAGS=0x…` response.
fn parse_hpa_response(line: &str) -> Option<u64> {
    let rest = line.trim_start().strip_prefix("HPA=0x")?;
    let end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    u64::from_str_radix(&rest[..end], 16).ok()
}

/// L2 color of a virtual address, via the guest-physical mapping. Debug
/// only; `None` when pagemap is unavailable.
pub fn l2_color_of(va: *const u8, l2: &CacheGeometry) -> Option<u32> {
    virt_to_phys(va).map(|pa| l2.color_of(pa))
}

/// Commands understood by the color-tagged page allocator module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorCommand {
    Enable,
    Disable,
    Clear,
    Flush,
    /// Preferred allocation order, coldest first.
    Order(Vec<u32>),
    /// Mark one color hot.
    Hot(u32),
    /// Release pages of one color.
    Free(u32),
    /// Record a page's color.
    Assign { pfn: u64, color: u32 },
}

impl ColorCommand {
    /// Wire rendering of the command line.
    pub fn render(&self) -> String {
        match self {
            Self::Enable => "enable".into(),
            Self::Disable => "disable".into(),
            Self::Clear => "clear".into(),
            Self::Flush => "flush".into(),
            Self::Order(colors) => {
                let mut s = String::from("order");
                for c in colors {
                    s.push(' ');
                    s.push_str(&c.to_string());
                }
                s
            }
            Self::Hot(c) => format!("hot {c}"),
            Self::Free(c) => format!("free {c}"),
            Self::Assign { pfn, color } => format!("{pfn:x} {color}"),
        }
    }
}

/// Client for the page-coloring allocator proc interface.
pub struct ColorAllocator {
    file: File,
}

impl ColorAllocator {
    pub fn open() -> std::io::Result<Self> {
        Self::open_at(COLOR_ALLOCATOR_PATH)
    }

    pub fn open_at(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn send(&mut self, cmd: &ColorCommand) -> std::io::Result<()> {
        self.file.write_all(cmd.render().as_bytes())
    }

    /// The module's multiline status blob, surfaced verbatim.
    pub fn status(&mut self) -> std::io::Result<String> {
        let mut out = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hpa_response_parsing() {
        assert_eq!(
            parse_hpa_response("HPA=0x1abc000 PFN=0x1abc FLAGS=0x86\n"),
            Some(0x1abc000)
        );
        assert_eq!(parse_hpa_response("HPA=0xdead"), Some(0xdead));
        assert_eq!(parse_hpa_response("garbage"), None);
        assert_eq!(parse_hpa_response(""), None);
    }

    #[test]
    fn color_command_rendering() {
        assert_eq!(ColorCommand::Enable.render(), "enable");
        assert_eq!(ColorCommand::Disable.render(), "disable");
        assert_eq!(ColorCommand::Clear.render(), "clear");
        assert_eq!(ColorCommand::Flush.render(), "flush");
        assert_eq!(ColorCommand::Order(vec![3, 0, 2]).render(), "order 3 0 2");
        assert_eq!(ColorCommand::Hot(5).render(), "hot 5");
        assert_eq!(ColorCommand::Free(1).render(), "free 1");
        assert_eq!(
            ColorCommand::Assign {
                pfn: 0x1abc,
                color: 7
            }
            .render(),
            "1abc 7"
        );
    }

    #[test]
    fn oracle_open_fails_cleanly_without_module() {
        let missing = HpaOracle::open_at("/proc/definitely_not_loaded_gpa_hpa");
        assert!(missing.is_err());
        let missing = ColorAllocator::open_at("/proc/definitely_not_loaded_vcolor");
        assert!(missing.is_err());
    }

    #[test]
    fn virt_to_phys_of_mapped_page() {
        // Needs root to see real PFNs; unprivileged runs legitimately get
        // None. Either way it must not error out.
        let buf = vec![1u8; 4096];
        let _ = virt_to_phys(buf.as_ptr());
    }
}
