pub mod addr;
pub mod staging;

use core::iter::IntoIterator;

pub use addr::*;
pub use staging::*;

pub fn is_sorted_and_nonoverlapping<
    AddrType: AddressType,
    T: IntoIterator<Item = Extent<AddrType>>,
>(
    blocks: T,
) -> bool {
    let mut iter = blocks.into_iter().peekable();

    while let Some(cur) = iter.next() {
        let next = match iter.peek().copied() {
            Some(next) => next,
            None => return true,
        };

        if cur.address() >= next.address() {
            return false;
        }

        if cur.has_overlap(next) {
            return false;
        }
    }

    true
}
