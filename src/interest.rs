use std::num::NonZeroU8;
use std::{fmt, ops};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// The readiness a parked task is waiting for.
///
/// Registered with the platform poller when a socket operation would block;
/// the size of `Option<Interest>` is identical to `Interest` itself.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(NonZeroU8::new(READABLE).unwrap());

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(NonZeroU8::new(WRITABLE).unwrap());

    /// Add together two `Interest`s. The `BitOr` implementation as a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(NonZeroU8::new(self.0.get() | other.0.get()).unwrap())
    }

    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}

/// The readiness the poller reported for a descriptor.
///
/// Unlike [`Interest`] this can carry the out-of-band conditions (`ERROR`,
/// `HUP`) the OS reports regardless of what was asked for; a parked task is
/// woken for any of them and the retried syscall surfaces the verdict.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    pub const HUP: Readiness = Readiness(0b1000);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        (self.0 & Self::READABLE.0) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE.0) != 0
    }

    pub const fn is_error(self) -> bool {
        (self.0 & Self::ERROR.0) != 0
    }

    pub const fn is_hup(self) -> bool {
        (self.0 & Self::HUP.0) != 0
    }
}

impl ops::BitOr for Readiness {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Readiness(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Readiness {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }
        let mut one = false;
        for (set, name) in [
            (self.is_readable(), "READABLE"),
            (self.is_writable(), "WRITABLE"),
            (self.is_error(), "ERROR"),
            (self.is_hup(), "HUP"),
        ] {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        Ok(())
    }
}
