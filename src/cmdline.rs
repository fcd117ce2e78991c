//! Kernel command line and `booti` arguments.

use alloc::string::String;
use core::fmt::{self, Write};

use arrayvec::ArrayString;

use shared::memory::{Length, PhysAddress};

use crate::assembly::{BootError, BootPlan};

/// Kernel command line before expansion. The initrd is the root filesystem.
pub const BOOTARGS_TEMPLATE: &str = "${cbootargs} root=/dev/ram0 rw rootwait ${bootargs}";

/// Kernel command line when the initrd was dropped. The root device has to
/// come from the environment.
pub const NO_INITRD_TEMPLATE: &str = "${cbootargs} rw rootwait ${bootargs}";

/// Widest argument: `<addr>:<size>`, both 64-bit hex.
pub const ARG_CAPACITY: usize = 2 * 16 + 1;

pub type Arg = ArrayString<ARG_CAPACITY>;

/// The boot environment variable store.
pub trait Environment {
    fn get(&self, name: &str) -> Option<&str>;
    fn set(&mut self, name: &str, value: &str);
}

/// Replaces each `${name}` in `template` with its value from `env`.
///
/// Unset names expand to nothing and an unterminated `${` is kept literally.
/// Template words are joined by single spaces and words that expand to
/// nothing are dropped. Substituted values are kept verbatim apart from
/// their leading and trailing whitespace.
pub fn expand<E: Environment + ?Sized>(template: &str, env: &E) -> String {
    let mut out = String::with_capacity(template.len());
    for word in template.split_ascii_whitespace() {
        let expanded = expand_word(word, env);
        let expanded = expanded.trim_matches(|c: char| c.is_ascii_whitespace());
        if expanded.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(expanded);
    }
    out
}

fn expand_word<E: Environment + ?Sized>(word: &str, env: &E) -> String {
    let mut out = String::with_capacity(word.len());
    let mut rest = word;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(env.get(&after[..end]).unwrap_or(""));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The final kernel command line: the expanded template with the outcome
/// flags appended.
///
/// Without an initrd there is no `/dev/ram0`, so the environment must name
/// the root device with `root=`. Otherwise this is
/// [`BootError::NoRootDevice`].
pub fn kernel_cmdline<E: Environment + ?Sized>(env: &E, plan: &BootPlan) -> Result<String, BootError> {
    let mut line = match plan.initrd {
        Some(_) => expand(BOOTARGS_TEMPLATE, env),
        None => {
            let line = expand(NO_INITRD_TEMPLATE, env);
            if !line.split_ascii_whitespace().any(|p| p.starts_with("root=")) {
                return Err(BootError::NoRootDevice);
            }
            line
        }
    };
    if !line.is_empty() {
        line.push(' ');
    }
    // Writing to a String cannot fail.
    let _ = write!(line, "{}", plan.outcomes);
    Ok(line)
}

/// Arguments of the `booti` command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootCommand {
    pub image: PhysAddress,
    pub initrd: Option<(PhysAddress, Length)>,
    pub dtb: PhysAddress,
}

impl BootCommand {
    pub fn new(plan: &BootPlan) -> Self {
        BootCommand {
            image: plan.image.address,
            initrd: plan.initrd.map(|initrd| (initrd.address, initrd.size)),
            dtb: plan.dtb.address,
        }
    }

    /// `booti` and its three arguments: image address, `initrd:size` (or `-`
    /// without an initrd) and dtb address, all in lowercase hex.
    pub fn argv(&self) -> [Arg; 4] {
        [
            arg(format_args!("booti")),
            arg(format_args!("{:x}", self.image)),
            match self.initrd {
                Some((address, size)) => arg(format_args!("{address:x}:{size:x}")),
                None => arg(format_args!("-")),
            },
            arg(format_args!("{:x}", self.dtb)),
        ]
    }
}

impl fmt::Display for BootCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv = self.argv();
        let mut iter = argv.iter();
        if let Some(first) = iter.next() {
            f.write_str(first)?;
        }
        iter.try_for_each(|a| write!(f, " {a}"))
    }
}

fn arg(args: fmt::Arguments) -> Arg {
    let mut arg = Arg::new();
    // Every argument fits in ARG_CAPACITY.
    let _ = arg.write_fmt(args);
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::assembly::{Outcome, Outcomes, Staged};
    use shared::info::ArtifactSizes;

    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::string::ToString;

    #[derive(Default)]
    struct Env(BTreeMap<String, String>);

    fn plan(with_initrd: bool, initrd: Outcome) -> BootPlan {
        let staged = |address: u64, size: u64| Staged {
            address: PhysAddress::from_raw(address),
            size: Length::from_raw(size),
        };
        BootPlan {
            info: staged(0x1000, 0x200),
            image: staged(0x1200, 0x800),
            dtb: staged(0x2000, 0x100),
            initrd: with_initrd.then(|| staged(0x3000, 0x400)),
            sizes: ArtifactSizes {
                image: Length::from_raw(0x800),
                dtb: Length::from_raw(0x100),
                initrd: Length::from_raw(0x400),
            },
            outcomes: Outcomes([Outcome::Verified, Outcome::Verified, Outcome::Verified, initrd]),
        }
    }

    impl Environment for Env {
        fn get(&self, name: &str) -> Option<&str> {
            self.0.get(name).map(String::as_str)
        }

        fn set(&mut self, name: &str, value: &str) {
            self.0.insert(name.into(), value.into());
        }
    }

    #[test]
    fn expands_known_and_unknown_variables() {
        let mut env = Env::default();
        env.set("cbootargs", "console=ttyS0,115200");

        assert_eq!(
            expand(BOOTARGS_TEMPLATE, &env),
            "console=ttyS0,115200 root=/dev/ram0 rw rootwait"
        );

        env.set("bootargs", "quiet  loglevel=3");
        assert_eq!(
            expand(BOOTARGS_TEMPLATE, &env),
            "console=ttyS0,115200 root=/dev/ram0 rw rootwait quiet  loglevel=3"
        );
    }

    #[test]
    fn substituted_values_are_verbatim() {
        let mut env = Env::default();
        env.set("bootargs", " foo=\"a  b\"\tquiet ");

        assert_eq!(
            expand(BOOTARGS_TEMPLATE, &env),
            "root=/dev/ram0 rw rootwait foo=\"a  b\"\tquiet"
        );
    }

    #[test]
    fn cmdline_carries_outcome_flags() {
        let mut env = Env::default();
        env.set("cbootargs", "console=ttyS0");

        assert_eq!(
            kernel_cmdline(&env, &plan(true, Outcome::Verified)),
            Ok("console=ttyS0 root=/dev/ram0 rw rootwait tmr=vvvv".to_string())
        );
    }

    #[test]
    fn missing_initrd_needs_root_from_environment() {
        let mut env = Env::default();
        let plan = plan(false, Outcome::Failed);

        assert_eq!(kernel_cmdline(&env, &plan), Err(BootError::NoRootDevice));

        env.set("bootargs", "root=/dev/mmcblk0p4");
        assert_eq!(
            kernel_cmdline(&env, &plan),
            Ok("rw rootwait root=/dev/mmcblk0p4 tmr=vvvx".to_string())
        );
    }

    #[test]
    fn keeps_unterminated_reference() {
        let env = Env::default();
        assert_eq!(expand("a ${b c", &env), "a ${b c");
        assert_eq!(expand("${}x", &env), "x");
    }

    #[test]
    fn booti_arguments_are_hex() {
        let command = BootCommand {
            image: PhysAddress::from_raw(0xa500_0200),
            initrd: Some((PhysAddress::from_raw(0xaa02_2400), Length::from_raw(0x1234))),
            dtb: PhysAddress::from_raw(0xaa00_2400),
        };
        assert_eq!(
            command.argv().map(|a| a.to_string()),
            ["booti", "a5000200", "aa022400:1234", "aa002400"]
        );
        assert_eq!(command.to_string(), "booti a5000200 aa022400:1234 aa002400");
    }

    #[test]
    fn widest_arguments_fit() {
        let command = BootCommand {
            image: PhysAddress::from_raw(u64::MAX),
            initrd: Some((PhysAddress::from_raw(u64::MAX), Length::from_raw(u64::MAX))),
            dtb: PhysAddress::from_raw(0),
        };
        let argv = command.argv();
        assert_eq!(&argv[2][..], "ffffffffffffffff:ffffffffffffffff");
        assert_eq!(&argv[3][..], "0");
    }

    #[test]
    fn missing_initrd_is_a_dash() {
        let command = BootCommand {
            image: PhysAddress::from_raw(0x1000),
            initrd: None,
            dtb: PhysAddress::from_raw(0x2000),
        };
        assert_eq!(command.to_string(), "booti 1000 - 2000");
    }
}
