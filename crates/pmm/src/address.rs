//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, and the translator the frame pool uses to reach frame contents.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translates physical addresses into pointers the kernel can dereference.
///
/// This enum supports two modes:
/// - Hardware: physical memory is direct-mapped at a fixed offset (kernel mode)
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map offset.
    ///
    /// # Safety
    ///
    /// Every physical address later handed to the frame pool must be mapped, writable,
    /// at `phys + direct_map_offset` for as long as the translator is in use.
    pub const unsafe fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of host memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns a pointer to the byte at `phys`.
    pub fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut u8
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()),
        }
    }

}

impl fmt::Debug for AddressTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware { direct_map_offset } => f
                .debug_struct("Hardware")
                .field("direct_map_offset", &format_args!("{:#x}", direct_map_offset))
                .finish(),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => f.debug_tuple("Emulated").field(&mem.size()).finish(),
        }
    }
}

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses identify frames; they are never dereferenced directly, only\n\
     through an [`AddressTranslator`]."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame number containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address inside some process's address space."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the page number containing this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            assert_eq!(PhysicalAddress::new(max_addr).as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 0x24);
            assert!(!addr.is_aligned(arch::PAGE_SIZE));
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 3)
            );
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE),
                PhysicalAddress::new(arch::PAGE_SIZE * 4)
            );
            assert_eq!(addr.page_offset(), 0x24);
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 7 + 1);
            assert_eq!(addr.frame_number(), FrameNumber::new(7));
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn accepts_canonical_higher_half() {
            let addr = VirtualAddress::new(0xFFFF_8000_0000_0000);
            assert_eq!(addr.as_usize(), 0xFFFF_8000_0000_0000);
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn rejects_non_canonical() {
            VirtualAddress::new(0x0000_8000_0000_0000);
        }

        #[test]
        fn difference_between_addresses() {
            let a = VirtualAddress::new(0x4000_2000);
            let b = VirtualAddress::new(0x4000_0000);
            assert_eq!(a - b, 0x2000);
            assert_eq!(b + 0x2000, a);
        }
    }

    mod translator {
        use super::*;

        #[test]
        fn emulated_translation_is_offset_into_buffer() {
            let translator = AddressTranslator::emulated(4 * arch::PAGE_SIZE);
            let base = translator.phys_to_ptr(PhysicalAddress::new(0));
            let third = translator.phys_to_ptr(PhysicalAddress::new(2 * arch::PAGE_SIZE));
            assert_eq!(third as usize - base as usize, 2 * arch::PAGE_SIZE);
        }

        #[test]
        fn hardware_translation_adds_direct_map_offset() {
            // SAFETY: The translator is only used for address arithmetic here.
            let translator = unsafe { AddressTranslator::hardware(0xFFFF_8000_0000_0000) };
            let ptr = translator.phys_to_ptr(PhysicalAddress::new(0x1000));
            assert_eq!(ptr as usize, 0xFFFF_8000_0000_1000);
        }
    }
}
