use core::cmp::min;
use core::fmt::{self, Debug, LowerHex};
use core::hash::Hash;
use core::marker::PhantomData;

pub trait AddressType: Clone + Copy + Eq + Ord + PartialEq + PartialOrd + Debug + Hash {}

/// Byte offsets on the boot storage device.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct StorageAddressType;

/// Physical addresses in the staging memory window.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct PhysAddressType;

impl AddressType for StorageAddressType {}
impl AddressType for PhysAddressType {}

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Address<Type: AddressType>(u64, PhantomData<Type>);

pub type StorageAddress = Address<StorageAddressType>;
pub type PhysAddress = Address<PhysAddressType>;

impl<Type: AddressType> Address<Type> {
    pub const fn from_raw(val: u64) -> Self {
        Self(val, PhantomData)
    }

    pub const fn zero() -> Self {
        Self::from_raw(0)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn from_zero(offset: Length) -> Self {
        Self::offset_by(Self::zero(), offset)
    }

    pub fn distance_from(self, left: Self) -> Length {
        assert!(self >= left);
        Length::from_raw(self.as_raw() - left.as_raw())
    }

    pub fn distance_to(self, right: Self) -> Length {
        assert!(self <= right);
        Length::from_raw(right.as_raw() - self.as_raw())
    }

    pub fn offset_by(self, length: Length) -> Self {
        self.offset_by_checked(length).unwrap()
    }

    pub fn offset_by_checked(self, length: Length) -> Option<Self> {
        if length.as_raw() > u64::MAX - self.as_raw() {
            return None;
        }

        Some(Self::from_raw(self.as_raw() + length.as_raw()))
    }
}

impl<Type: AddressType> LowerHex for Address<Type> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Length(u64);

impl Length {
    pub const fn from_raw(val: u64) -> Length {
        Length(val)
    }

    /// `count` blocks of `block_size` bytes, or `None` on overflow.
    pub const fn blocks(count: u64, block_size: u64) -> Option<Length> {
        match count.checked_mul(block_size) {
            Some(bytes) => Some(Length(bytes)),
            None => None,
        }
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// For indexing host-side buffers. Panics if the length does not fit in
    /// the address space.
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap()
    }

    pub fn subtract(self, rhs: Length) -> Length {
        assert!(self.as_raw() >= rhs.as_raw());
        Length::from_raw(self.as_raw() - rhs.as_raw())
    }
}

impl LowerHex for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A non-empty, non-wrapping range of addresses.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Extent<Type: AddressType> {
    address: Address<Type>,
    length: Length,
}

pub type StorageExtent = Extent<StorageAddressType>;
pub type PhysExtent = Extent<PhysAddressType>;

impl<Type: AddressType> Extent<Type> {
    pub fn new(address: Address<Type>, length: Length) -> Self {
        Self::new_checked(address, length).unwrap()
    }

    pub fn new_checked(address: Address<Type>, length: Length) -> Option<Self> {
        if length.as_raw() == 0 || length.as_raw() > u64::MAX - address.as_raw() {
            None
        } else {
            Some(Self { address, length })
        }
    }

    pub fn from_raw(address: u64, length: u64) -> Self {
        Self::new(Address::<Type>::from_raw(address), Length::from_raw(length))
    }

    pub fn address(self) -> Address<Type> {
        self.address
    }

    pub fn length(self) -> Length {
        self.length
    }

    /// The first address just outside us, to the right
    pub fn end_address(self) -> Address<Type> {
        self.address.offset_by(self.length)
    }

    /// The last address in the extent. E.g.
    ///
    /// ```
    /// use shared::memory::addr::*;
    /// assert_eq!(PhysExtent::from_raw(0, 4).last_address(), PhysAddress::from_raw(3));
    /// ```
    pub fn last_address(self) -> Address<Type> {
        self.address
            .offset_by(self.length.subtract(Length::from_raw(1)))
    }

    /// Whether `other` lies completely inside `self`.
    pub fn contains(self, other: Self) -> bool {
        self.address <= other.address && other.last_address() <= self.last_address()
    }

    pub fn overlap(self, other: Self) -> Option<Self> {
        if self.address > other.address {
            return other.overlap(self);
        }

        let overlap_start = other.address;

        if self.address.distance_to(overlap_start) >= self.length {
            return None;
        }

        let overlap_length = min(
            self.length
                .subtract(self.address.distance_to(overlap_start)),
            other.length,
        );

        Some(Self {
            address: overlap_start,
            length: overlap_length,
        })
    }

    pub fn has_overlap(self, other: Self) -> bool {
        self.overlap(other).is_some()
    }
}
