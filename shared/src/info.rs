//! The Info blob: fixed-width decimal fields giving the sizes of the image,
//! dtb and initrd (and rootfs, which this stage ignores).

use core::fmt;

use crate::layout::Artifact;
use crate::memory::Length;

/// Sizes of the artifacts staged after Info.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArtifactSizes {
    pub image: Length,
    pub dtb: Length,
    pub initrd: Length,
}

impl ArtifactSizes {
    /// Each size paired with its artifact, in staging order.
    pub fn by_artifact(&self) -> [(Artifact, Length); 3] {
        [
            (Artifact::Image, self.image),
            (Artifact::Dtb, self.dtb),
            (Artifact::Initrd, self.initrd),
        ]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeFieldError {
    /// The blob ends before this field does.
    Truncated,
    /// No digits at all.
    Empty,
    /// Something other than digits followed by padding.
    InvalidByte { position: usize, byte: u8 },
    Overflow,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MalformedSizeField {
    pub artifact: Artifact,
    pub reason: SizeFieldError,
}

impl fmt::Display for MalformedSizeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed {} size field: ", self.artifact)?;
        match self.reason {
            SizeFieldError::Truncated => write!(f, "info blob too short"),
            SizeFieldError::Empty => write!(f, "no digits"),
            SizeFieldError::InvalidByte { position, byte } => {
                write!(f, "unexpected byte {byte:#04x} at {position}")
            }
            SizeFieldError::Overflow => write!(f, "value does not fit in 64 bits"),
        }
    }
}

impl core::error::Error for MalformedSizeField {}

/// Reads the image, dtb and initrd sizes from the first three
/// `field_width`-byte fields of `info`.
pub fn discover_sizes(info: &[u8], field_width: usize) -> Result<ArtifactSizes, MalformedSizeField> {
    let field = |n: usize| -> Result<Length, MalformedSizeField> {
        let artifact = Artifact::SIZED[n];
        let bytes = info
            .get(n * field_width..(n + 1) * field_width)
            .ok_or(MalformedSizeField {
                artifact,
                reason: SizeFieldError::Truncated,
            })?;
        parse_size_field(bytes)
            .map(Length::from_raw)
            .map_err(|reason| MalformedSizeField { artifact, reason })
    };

    Ok(ArtifactSizes {
        image: field(0)?,
        dtb: field(1)?,
        initrd: field(2)?,
    })
}

/// Parses one field: optional leading whitespace, at least one decimal
/// digit, then nothing but NUL or whitespace padding.
pub fn parse_size_field(field: &[u8]) -> Result<u64, SizeFieldError> {
    let start = field
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(field.len());
    let digits_end = field[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(field.len(), |n| start + n);

    if digits_end == start {
        return match field.get(start) {
            None | Some(0) => Err(SizeFieldError::Empty),
            Some(&byte) => Err(SizeFieldError::InvalidByte {
                position: start,
                byte,
            }),
        };
    }

    if let Some(n) = field[digits_end..]
        .iter()
        .position(|&b| b != 0 && !b.is_ascii_whitespace())
    {
        return Err(SizeFieldError::InvalidByte {
            position: digits_end + n,
            byte: field[digits_end + n],
        });
    }

    field[start..digits_end].iter().try_fold(0u64, |acc, &d| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(d - b'0')))
            .ok_or(SizeFieldError::Overflow)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::vec::Vec;

    fn info_blob(fields: &[&[u8]], width: usize) -> Vec<u8> {
        let mut blob = Vec::new();
        for field in fields {
            let mut padded = field.to_vec();
            padded.resize(width, 0);
            blob.extend_from_slice(&padded);
        }
        blob
    }

    #[test]
    fn reads_three_decimal_fields() {
        let blob = info_blob(&[b"1024", b"2048", b"512", b"99999"], 16);
        assert_eq!(
            discover_sizes(&blob, 16),
            Ok(ArtifactSizes {
                image: Length::from_raw(1024),
                dtb: Length::from_raw(2048),
                initrd: Length::from_raw(512),
            })
        );
    }

    #[test]
    fn sizes_pair_with_their_artifacts() {
        let sizes = ArtifactSizes {
            image: Length::from_raw(1),
            dtb: Length::from_raw(2),
            initrd: Length::from_raw(3),
        };
        assert_eq!(
            sizes.by_artifact(),
            [
                (Artifact::Image, Length::from_raw(1)),
                (Artifact::Dtb, Length::from_raw(2)),
                (Artifact::Initrd, Length::from_raw(3)),
            ]
        );
    }

    #[test]
    fn accepts_whitespace_and_nul_padding() {
        assert_eq!(parse_size_field(b"  42\n\0\0\0"), Ok(42));
        assert_eq!(parse_size_field(b"7"), Ok(7));
        assert_eq!(parse_size_field(b"0 \0"), Ok(0));
        assert_eq!(parse_size_field(b"18446744073709551615"), Ok(u64::MAX));
    }

    #[test]
    fn rejects_bad_fields() {
        assert_eq!(parse_size_field(b"\0\0\0\0"), Err(SizeFieldError::Empty));
        assert_eq!(parse_size_field(b"   "), Err(SizeFieldError::Empty));
        assert_eq!(parse_size_field(b""), Err(SizeFieldError::Empty));
        assert_eq!(
            parse_size_field(b"-12"),
            Err(SizeFieldError::InvalidByte {
                position: 0,
                byte: b'-'
            })
        );
        assert_eq!(
            parse_size_field(b"12k\0"),
            Err(SizeFieldError::InvalidByte {
                position: 2,
                byte: b'k'
            })
        );
        assert_eq!(
            parse_size_field(b"12\0\x003"),
            Err(SizeFieldError::InvalidByte {
                position: 4,
                byte: b'3'
            })
        );
        assert_eq!(
            parse_size_field(b"18446744073709551616"),
            Err(SizeFieldError::Overflow)
        );
    }

    #[test]
    fn names_the_malformed_artifact() {
        let blob = info_blob(&[b"1024", b"zz", b"512"], 8);
        assert_eq!(
            discover_sizes(&blob, 8),
            Err(MalformedSizeField {
                artifact: Artifact::Dtb,
                reason: SizeFieldError::InvalidByte {
                    position: 0,
                    byte: b'z'
                },
            })
        );

        let truncated = info_blob(&[b"1", b"2", b"3"], 8);
        assert_eq!(
            discover_sizes(&truncated[..20], 8),
            Err(MalformedSizeField {
                artifact: Artifact::Initrd,
                reason: SizeFieldError::Truncated,
            })
        );
    }

    proptest! {
        #[test]
        fn discovery_is_idempotent(blob in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(discover_sizes(&blob, 16), discover_sizes(&blob, 16));
        }

        #[test]
        fn written_sizes_are_read_back(sizes in prop::array::uniform3(any::<u64>())) {
            let text = sizes.map(|s| std::format!("{s}"));
            let blob = info_blob(&[text[0].as_bytes(), text[1].as_bytes(), text[2].as_bytes()], 24);
            let found = discover_sizes(&blob, 24).unwrap();
            prop_assert_eq!(
                [found.image, found.dtb, found.initrd],
                sizes.map(Length::from_raw)
            );
        }
    }
}
