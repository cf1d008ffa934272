//! PCI capability-chain parsing and rewriting.
//!
//! The physical function advertises an arbitrary capability chain; the guest
//! gets a filtered copy containing only what the assignment engine can
//! mediate: MSI, MSI-X, and (on platforms that can express it) the bare PCI
//! Express endpoint header. Everything else is dropped, and the survivors
//! are re-linked into a fresh chain at their original offsets.

use log::{debug, warn};

use crate::header::{regs, PciHeader};

/// A raw capability header: capability ID and its config-space offset.
#[derive(Debug, Clone, Copy)]
pub struct RawCapability {
    /// PCI capability ID.
    pub id: u8,
    /// Config-space offset of this capability header.
    pub offset: u8,
}

/// Iterator over the capability chain of a configuration image.
pub struct CapabilityIter<'a> {
    hdr: &'a PciHeader,
    next_offset: u8,
    hops: usize,
}

impl Iterator for CapabilityIter<'_> {
    type Item = RawCapability;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next_offset & 0xFC; // dword-aligned
        if (offset as usize) < regs::STD_HEADER_SIZE {
            return None;
        }
        // Bound the walk so a corrupt chain cannot loop forever.
        if self.hops == 0 {
            return None;
        }
        self.hops -= 1;

        let id = self.hdr.read_u8(offset as usize);
        self.next_offset = self.hdr.read_u8(offset as usize + 1);

        Some(RawCapability { id, offset })
    }
}

/// Returns an iterator over the capability chain of `hdr`.
///
/// Returns `None` if the header does not advertise a capability list.
#[must_use]
pub fn walk_capabilities(hdr: &PciHeader) -> Option<CapabilityIter<'_>> {
    if hdr.status() & regs::STATUS_CAP_LIST == 0 {
        return None;
    }
    Some(CapabilityIter {
        hdr,
        next_offset: hdr.capabilities_ptr() & !3,
        hops: (regs::CONFIG_SPACE_SIZE - regs::STD_HEADER_SIZE) / 4,
    })
}

/// Interrupt capabilities discovered on the physical function.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedCaps {
    /// MSI capability offset and advertised vector count.
    pub msi: Option<(u8, usize)>,
    /// MSI-X capability offset and table entry count.
    pub msix: Option<(u8, usize)>,
}

/// Walks the physical capability chain and records the interrupt
/// capabilities the engine will emulate.
#[must_use]
pub fn parse(hdr: &PciHeader) -> ParsedCaps {
    let mut parsed = ParsedCaps::default();
    let Some(iter) = walk_capabilities(hdr) else {
        return parsed;
    };

    for RawCapability { id, offset } in iter {
        let pos = offset as usize;
        match id {
            regs::CAP_ID_MSI => {
                let ctrl = hdr.read_u16(pos + regs::MSI_CTRL);
                let nr = 1usize << ((ctrl & regs::MSI_CTRL_QMASK) >> 1);
                parsed.msi = Some((offset, nr));
            }
            regs::CAP_ID_MSIX => {
                let ctrl = hdr.read_u16(pos + regs::MSIX_CTRL);
                let nr = usize::from(ctrl & regs::MSIX_CTRL_SIZE_MASK) + 1;
                parsed.msix = Some((offset, nr));
            }
            _ => {}
        }
    }
    parsed
}

/// Bytes of the MSI capability, which grows with 64-bit addressing and
/// per-vector masking.
fn msi_cap_size(ctrl: u16) -> usize {
    let mut size = 10;
    if ctrl & regs::MSI_CTRL_64BIT != 0 {
        size += 4;
    }
    if ctrl & regs::MSI_CTRL_MASKBIT != 0 {
        size += 10;
    }
    size
}

/// Bytes of capability `cap` to expose to the guest, or `None` to drop it.
fn retained_size(hdr: &PciHeader, cap: RawCapability, pcie: bool) -> Option<usize> {
    match cap.id {
        regs::CAP_ID_MSI => Some(msi_cap_size(hdr.read_u16(cap.offset as usize + regs::MSI_CTRL))),
        regs::CAP_ID_MSIX => Some(regs::MSIX_CAP_SIZE),
        // Expose the bare endpoint header only; link, slot, and root
        // registers belong to the host topology.
        regs::CAP_ID_EXP if pcie => Some(regs::EXP_CAP_SIZE_V1),
        _ => None,
    }
}

/// Rewrites the capability chain of `hdr` in place, keeping only the
/// capabilities the engine mediates.
///
/// Retained capabilities stay at their original offsets and are re-linked in
/// chain order, terminated with `next = 0`. The capabilities pointer and the
/// status `CAP_LIST` bit are set exactly when at least one capability
/// survives. The standard 64-byte header is left untouched.
pub fn rewrite(hdr: &mut PciHeader, pcie: bool) {
    let mut scratch = [0u8; regs::CONFIG_SPACE_SIZE];
    let mut first: u8 = 0;
    let mut prev_next: Option<usize> = None;

    if let Some(iter) = walk_capabilities(hdr) {
        // The iterator borrows the pre-rewrite image; collect before
        // mutating.
        let chain: Vec<RawCapability> = iter.collect();
        for cap in chain {
            let Some(size) = retained_size(hdr, cap, pcie) else {
                debug!("dropping capability {:#04x} at {:#04x}", cap.id, cap.offset);
                continue;
            };
            let pos = cap.offset as usize;
            if pos + size > regs::CONFIG_SPACE_SIZE {
                warn!(
                    "capability {:#04x} at {:#04x} overruns config space, dropping",
                    cap.id, cap.offset
                );
                continue;
            }

            hdr.read(pos, &mut scratch[pos..pos + size]);
            scratch[pos + 1] = 0; // terminates the chain until relinked
            match prev_next {
                Some(link) => scratch[link] = cap.offset,
                None => first = cap.offset,
            }
            prev_next = Some(pos + 1);
        }
    }

    // Splice the rebuilt chain over everything above the standard header.
    hdr.write(regs::STD_HEADER_SIZE, &scratch[regs::STD_HEADER_SIZE..]);
    hdr.write_u8(regs::CAPABILITIES_PTR, first);
    let mut status = hdr.status();
    if first != 0 {
        status |= regs::STATUS_CAP_LIST;
    } else {
        status &= !regs::STATUS_CAP_LIST;
    }
    hdr.write_u16(regs::STATUS, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an image with a vendor cap, an MSI cap, and an MSI-X cap.
    fn chained_header() -> PciHeader {
        let mut hdr = PciHeader::default();
        hdr.write_u16(regs::STATUS, regs::STATUS_CAP_LIST);
        hdr.write_u8(regs::CAPABILITIES_PTR, 0x40);
        // Vendor-specific capability, should be dropped.
        hdr.write_u8(0x40, 0x09);
        hdr.write_u8(0x41, 0x50);
        hdr.write_u8(0x42, 0xAA);
        // MSI, 64-bit + per-vector masking, 4 vectors capable.
        hdr.write_u8(0x50, regs::CAP_ID_MSI);
        hdr.write_u8(0x51, 0x70);
        hdr.write_u16(
            0x50 + regs::MSI_CTRL,
            regs::MSI_CTRL_64BIT | regs::MSI_CTRL_MASKBIT | (2 << 1),
        );
        // MSI-X, 8 entries.
        hdr.write_u8(0x70, regs::CAP_ID_MSIX);
        hdr.write_u8(0x71, 0x00);
        hdr.write_u16(0x70 + regs::MSIX_CTRL, 7);
        hdr
    }

    #[test]
    fn parse_finds_interrupt_caps() {
        let parsed = parse(&chained_header());
        assert_eq!(parsed.msi, Some((0x50, 4)));
        assert_eq!(parsed.msix, Some((0x70, 8)));
    }

    #[test]
    fn msi_cap_size_grows_with_features() {
        assert_eq!(msi_cap_size(0), 10);
        assert_eq!(msi_cap_size(regs::MSI_CTRL_64BIT), 14);
        assert_eq!(msi_cap_size(regs::MSI_CTRL_MASKBIT), 20);
        assert_eq!(
            msi_cap_size(regs::MSI_CTRL_64BIT | regs::MSI_CTRL_MASKBIT),
            24
        );
    }

    #[test]
    fn rewrite_keeps_only_mediated_caps_in_order() {
        let mut hdr = chained_header();
        rewrite(&mut hdr, false);

        // Chain closure: walking from the pointer visits exactly the
        // retained capabilities, in insertion order, ending at next = 0.
        assert_eq!(hdr.capabilities_ptr(), 0x50);
        assert_ne!(hdr.status() & regs::STATUS_CAP_LIST, 0);
        let caps: Vec<(u8, u8)> = walk_capabilities(&hdr)
            .expect("chain present")
            .map(|c| (c.id, c.offset))
            .collect();
        assert_eq!(
            caps,
            vec![(regs::CAP_ID_MSI, 0x50), (regs::CAP_ID_MSIX, 0x70)]
        );

        // The dropped vendor capability is gone from the image.
        assert_eq!(hdr.read_u8(0x40), 0);
        assert_eq!(hdr.read_u8(0x42), 0);
    }

    #[test]
    fn rewrite_size_filter() {
        let mut hdr = chained_header();
        rewrite(&mut hdr, false);

        // MSI with 64-bit + masking spans 24 bytes; nothing beyond that
        // survives until the next retained capability.
        assert_ne!(hdr.read_u16(0x50 + regs::MSI_CTRL), 0);
        for off in 0x50 + 24..0x70 {
            assert_eq!(hdr.read_u8(off), 0, "stray byte at {off:#x}");
        }
        // MSI-X spans 12 bytes.
        for off in 0x70 + regs::MSIX_CAP_SIZE..regs::CONFIG_SPACE_SIZE {
            assert_eq!(hdr.read_u8(off), 0, "stray byte at {off:#x}");
        }
    }

    #[test]
    fn rewrite_clears_cap_list_when_nothing_survives() {
        let mut hdr = PciHeader::default();
        hdr.write_u16(regs::STATUS, regs::STATUS_CAP_LIST);
        hdr.write_u8(regs::CAPABILITIES_PTR, 0x40);
        hdr.write_u8(0x40, 0x09); // vendor-specific only
        rewrite(&mut hdr, false);
        assert_eq!(hdr.capabilities_ptr(), 0);
        assert_eq!(hdr.status() & regs::STATUS_CAP_LIST, 0);
    }

    #[test]
    fn rewrite_respects_pcie_platform_support() {
        let mut hdr = PciHeader::default();
        hdr.write_u16(regs::STATUS, regs::STATUS_CAP_LIST);
        hdr.write_u8(regs::CAPABILITIES_PTR, 0x40);
        hdr.write_u8(0x40, regs::CAP_ID_EXP);
        hdr.write_u8(0x41, 0);

        let mut no_pcie = hdr.clone();
        rewrite(&mut no_pcie, false);
        assert_eq!(no_pcie.find_cap(regs::CAP_ID_EXP), None);

        rewrite(&mut hdr, true);
        assert_eq!(hdr.find_cap(regs::CAP_ID_EXP), Some(0x40));
    }
}
